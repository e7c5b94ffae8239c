use crate::core::{Caller, CryptCore};
use crate::error::{FsError, FsResult};
use crate::longname;
use crate::pathmap::{BackingPath, make_child_path};
use crate::util::oflag_from_bits;
use nix::fcntl::{AtFlags, OFlag, openat, renameat};
use nix::sys::stat::{FileStat, Mode, fstat, fstatat};
use nix::unistd::{Gid, Uid, UnlinkatFlags, fchown, unlinkat};
use scopeguard::ScopeGuard;
use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use tracing::{debug, warn};

/// Splits a logical path into parent and final component.
fn split_child(path: &OsStr) -> (OsString, OsString) {
    let raw = path.as_bytes();
    let trimmed = match raw.iter().rposition(|b| *b != b'/') {
        Some(end) => &raw[..=end],
        None => return (OsString::from("/"), OsString::new()),
    };
    match trimmed.iter().rposition(|b| *b == b'/') {
        Some(0) | None => (
            OsString::from("/"),
            OsStr::from_bytes(trimmed.strip_prefix(b"/").unwrap_or(trimmed)).to_owned(),
        ),
        Some(idx) => (
            OsStr::from_bytes(&trimmed[..idx]).to_owned(),
            OsStr::from_bytes(&trimmed[idx + 1..]).to_owned(),
        ),
    }
}

fn same_entry(a: &BackingPath, b: &BackingPath) -> bool {
    if a.c_name != b.c_name {
        return false;
    }
    match (fstat(a.dir_fd.as_fd()), fstat(b.dir_fd.as_fd())) {
        (Ok(x), Ok(y)) => x.st_dev == y.st_dev && x.st_ino == y.st_ino,
        _ => false,
    }
}

impl CryptCore {
    /// Attributes of the backend entry behind `path`, symlinks not followed.
    pub fn stat(&self, path: &OsStr) -> FsResult<FileStat> {
        let backing = self.open_backing_dir(path)?;
        if backing.is_root() {
            return Ok(fstat(backing.dir_fd.as_fd())?);
        }
        Ok(fstatat(
            backing.dir_fd.as_fd(),
            backing.c_name.as_c_str(),
            AtFlags::AT_SYMLINK_NOFOLLOW,
        )?)
    }

    pub fn create(
        &self,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
        caller: Caller,
    ) -> FsResult<(OwnedFd, FileStat)> {
        let path = make_child_path(parent, name);
        let backing = self.open_backing_dir(&path)?;
        if backing.is_root() {
            return Err(FsError::AlreadyExists);
        }
        let dir = backing.dir_fd.as_fd();
        let c_name = backing.c_name.as_c_str();

        let side_file = match (backing.placeholder(), backing.long_name.as_deref()) {
            (Some(placeholder), Some(encrypted)) => {
                longname::put(dir, placeholder, encrypted, name)?;
                Some(scopeguard::guard(placeholder, move |placeholder| {
                    longname::delete(dir, placeholder)
                }))
            }
            _ => None,
        };

        let oflag = (oflag_from_bits(flags) & !OFlag::O_DIRECTORY)
            | OFlag::O_CREAT
            | OFlag::O_EXCL
            | OFlag::O_NOFOLLOW
            | OFlag::O_CLOEXEC;
        let fd = openat(dir, c_name, oflag, Mode::from_bits_truncate((mode & 0o7777) as _))?;
        let created = scopeguard::guard((), |_| {
            if let Err(err) = unlinkat(dir, c_name, UnlinkatFlags::NoRemoveDir) {
                warn!(error = %err, "create: rollback failed");
            }
        });

        if self.flags().preserve_owner {
            fchown(&fd, Some(Uid::from_raw(caller.uid)), Some(Gid::from_raw(caller.gid)))
                .inspect_err(|err| {
                    warn!(uid = caller.uid, gid = caller.gid, error = %err, "create: chown failed");
                })?;
        }
        let st = fstat(&fd)?;

        ScopeGuard::into_inner(created);
        if let Some(guard) = side_file {
            ScopeGuard::into_inner(guard);
        }
        Ok((fd, st))
    }

    /// Opens an existing non-directory entry.
    pub fn open(&self, path: &OsStr, flags: u32) -> FsResult<OwnedFd> {
        let backing = self.open_backing_dir(path)?;
        if backing.is_root() {
            return Err(FsError::from_errno(libc::EISDIR));
        }
        let oflag = (oflag_from_bits(flags) & !(OFlag::O_CREAT | OFlag::O_EXCL))
            | OFlag::O_NOFOLLOW
            | OFlag::O_CLOEXEC;
        Ok(openat(
            backing.dir_fd.as_fd(),
            backing.c_name.as_c_str(),
            oflag,
            Mode::empty(),
        )?)
    }

    pub fn unlink(&self, parent: &OsStr, name: &OsStr) -> FsResult<()> {
        let path = make_child_path(parent, name);
        let backing = self.open_backing_dir(&path)?;
        if backing.is_root() {
            return Err(FsError::PermissionDenied);
        }
        let dir = backing.dir_fd.as_fd();
        unlinkat(dir, backing.c_name.as_c_str(), UnlinkatFlags::NoRemoveDir)?;
        if let Some(placeholder) = backing.placeholder() {
            longname::delete(dir, placeholder);
        }
        Ok(())
    }

    /// Moves `from` to `to`, replacing a file or an empty directory there.
    pub fn rename(&self, from: &OsStr, to: &OsStr) -> FsResult<()> {
        let src = self.open_backing_dir(from)?;
        let dst = self.open_backing_dir(to)?;
        if src.is_root() || dst.is_root() {
            return Err(FsError::from_errno(libc::EBUSY));
        }
        if same_entry(&src, &dst) {
            return Ok(());
        }
        let src_dir = src.dir_fd.as_fd();
        let dst_dir = dst.dir_fd.as_fd();
        let src_c = src.c_name.as_c_str();
        let dst_c = dst.c_name.as_c_str();

        let side_guard =
            |placeholder| scopeguard::guard(placeholder, move |p| longname::delete(dst_dir, p));
        let put_dst_side = || -> FsResult<bool> {
            match (dst.placeholder(), dst.long_name.as_deref()) {
                (Some(placeholder), Some(encrypted)) => {
                    match longname::put(dst_dir, placeholder, encrypted, to) {
                        Ok(()) => Ok(true),
                        // Target exists under the same long name; its side file is reused.
                        Err(FsError::AlreadyExists) => Ok(false),
                        Err(err) => Err(err),
                    }
                }
                _ => Ok(false),
            }
        };

        let mut dst_side = match (put_dst_side()?, dst.placeholder()) {
            (true, Some(placeholder)) => Some(side_guard(placeholder)),
            _ => None,
        };

        match renameat(src_dir, src_c, dst_dir, dst_c) {
            Ok(()) => {}
            Err(err @ (nix::Error::ENOTEMPTY | nix::Error::EEXIST)) => {
                let st = fstatat(dst_dir, dst_c, AtFlags::AT_SYMLINK_NOFOLLOW)?;
                if self.flags().plaintext_names || st.st_mode & libc::S_IFMT != libc::S_IFDIR {
                    return Err(err.into());
                }
                // An otherwise empty target directory still holds its IV.
                debug!(to = %to.to_string_lossy(), "rename: removing empty target directory");
                let (to_parent, to_name) = split_child(to);
                if let Some(guard) = dst_side.take() {
                    ScopeGuard::into_inner(guard);
                }
                self.rmdir(&to_parent, &to_name)?;
                if put_dst_side()?
                    && let Some(placeholder) = dst.placeholder()
                {
                    dst_side = Some(side_guard(placeholder));
                }
                renameat(src_dir, src_c, dst_dir, dst_c)?;
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(guard) = dst_side {
            ScopeGuard::into_inner(guard);
        }
        if let Some(placeholder) = src.placeholder() {
            longname::delete(src_dir, placeholder);
        }
        self.dir_cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InitOptions, MountOptions};
    use crate::core::{test_core, test_core_with};
    use crate::diriv::DIRIV_NAME;
    use std::fs;

    fn root() -> &'static OsStr {
        OsStr::new("/")
    }

    fn listed(core: &CryptCore, path: &str) -> Vec<OsString> {
        let mut names: Vec<_> = core
            .read_dir(OsStr::new(path))
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        names
    }

    fn backend_count(dir: &std::path::Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    fn create(core: &CryptCore, parent: &str, name: &str) {
        core.create(
            OsStr::new(parent),
            OsStr::new(name),
            0o644,
            libc::O_WRONLY as u32,
            Caller::current(),
        )
        .unwrap();
    }

    #[test]
    fn split_child_handles_root_and_nested() {
        assert_eq!(
            split_child(OsStr::new("/a")),
            (OsString::from("/"), OsString::from("a"))
        );
        assert_eq!(
            split_child(OsStr::new("/a/b/")),
            (OsString::from("/a"), OsString::from("b"))
        );
    }

    #[test]
    fn created_file_is_writable_and_listed() {
        let (_tmp, core) = test_core(InitOptions::default());
        let (fd, st) = core
            .create(
                root(),
                OsStr::new("notes.txt"),
                0o640,
                libc::O_RDWR as u32,
                Caller::current(),
            )
            .unwrap();
        assert_eq!(st.st_mode & 0o777, 0o640);
        nix::unistd::write(&fd, b"hello").unwrap();
        drop(fd);

        assert_eq!(core.stat(OsStr::new("/notes.txt")).unwrap().st_size, 5);
        assert_eq!(listed(&core, "/"), vec![OsString::from("notes.txt")]);
        let err = core
            .create(root(), OsStr::new("notes.txt"), 0o640, 0, Caller::current())
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists));
    }

    #[test]
    fn long_file_name_round_trip() {
        let (tmp, core) = test_core(InitOptions::default());
        let long = "f".repeat(220);
        create(&core, "/", &long);
        // conf, root IV, placeholder, side file
        assert_eq!(backend_count(tmp.path()), 4);
        assert_eq!(listed(&core, "/"), vec![OsString::from(&long)]);

        core.unlink(root(), OsStr::new(&long)).unwrap();
        assert_eq!(backend_count(tmp.path()), 2);
        assert!(listed(&core, "/").is_empty());
    }

    #[test]
    fn rename_moves_between_directories() {
        let (_tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("a"), 0o755, Caller::current())
            .unwrap();
        core.mkdir(root(), OsStr::new("b"), 0o755, Caller::current())
            .unwrap();
        create(&core, "/a", "x");

        core.rename(OsStr::new("/a/x"), OsStr::new("/b/y")).unwrap();
        assert!(listed(&core, "/a").is_empty());
        assert_eq!(listed(&core, "/b"), vec![OsString::from("y")]);
    }

    #[test]
    fn rename_between_short_and_long_names_moves_side_file() {
        let (tmp, core) = test_core(InitOptions::default());
        let long = "l".repeat(230);
        create(&core, "/", "short");

        core.rename(OsStr::new("/short"), OsStr::new(&format!("/{long}")))
            .unwrap();
        assert_eq!(backend_count(tmp.path()), 4);
        assert_eq!(listed(&core, "/"), vec![OsString::from(&long)]);

        core.rename(OsStr::new(&format!("/{long}")), OsStr::new("/again"))
            .unwrap();
        assert_eq!(backend_count(tmp.path()), 3);
        assert_eq!(listed(&core, "/"), vec![OsString::from("again")]);
    }

    #[test]
    fn rename_replaces_empty_directory() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("src"), 0o755, Caller::current())
            .unwrap();
        core.mkdir(root(), OsStr::new("dst"), 0o755, Caller::current())
            .unwrap();
        create(&core, "/src", "kept");

        core.rename(OsStr::new("/src"), OsStr::new("/dst")).unwrap();
        assert_eq!(listed(&core, "/"), vec![OsString::from("dst")]);
        assert_eq!(listed(&core, "/dst"), vec![OsString::from("kept")]);
        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(
            !names
                .iter()
                .any(|n| n.to_string_lossy().starts_with(&format!("{DIRIV_NAME}.")))
        );
    }

    #[test]
    fn rename_onto_non_empty_directory_fails() {
        let (_tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("src"), 0o755, Caller::current())
            .unwrap();
        core.mkdir(root(), OsStr::new("dst"), 0o755, Caller::current())
            .unwrap();
        create(&core, "/dst", "occupied");

        let err = core
            .rename(OsStr::new("/src"), OsStr::new("/dst"))
            .unwrap_err();
        assert!(matches!(err, FsError::NotEmpty));
        assert_eq!(
            listed(&core, "/"),
            vec![OsString::from("dst"), OsString::from("src")]
        );
    }

    #[test]
    fn rename_onto_itself_is_a_no_op() {
        let (_tmp, core) = test_core(InitOptions::default());
        let long = "s".repeat(240);
        create(&core, "/", &long);
        let path = format!("/{long}");
        core.rename(OsStr::new(&path), OsStr::new(&path)).unwrap();
        assert_eq!(listed(&core, "/"), vec![OsString::from(&long)]);
    }

    #[test]
    fn preserve_owner_applies_caller_identity() {
        let (_tmp, core) = test_core_with(
            InitOptions::default(),
            MountOptions {
                preserve_owner: true,
                ..MountOptions::default()
            },
        );
        let caller = Caller::current();
        let (_fd, st) = core
            .create(root(), OsStr::new("owned"), 0o600, 0, caller)
            .unwrap();
        assert_eq!(st.st_uid, caller.uid);
        assert_eq!(st.st_gid, caller.gid);

        let st = core
            .mkdir(root(), OsStr::new("owned-dir"), 0o700, caller)
            .unwrap();
        assert_eq!(st.st_uid, caller.uid);
    }

    #[test]
    fn open_refuses_the_root() {
        let (_tmp, core) = test_core(InitOptions::default());
        let err = core.open(root(), libc::O_RDONLY as u32).unwrap_err();
        assert_eq!(err.to_errno(), libc::EISDIR);
    }
}
