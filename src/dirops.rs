//! Directory lifecycle: creation, listing and removal.
//!
//! Every encrypted directory carries exactly one IV file. Creation writes it
//! right after `mkdirat`, removal parks it in the parent right before
//! `unlinkat(AT_REMOVEDIR)`. Both windows run under the instance's dir-IV
//! lock. Listing never takes the lock and treats a missing IV as corruption.

use crate::config::CONF_NAME;
use crate::core::{Caller, CryptCore};
use crate::diriv::{self, DIRIV_NAME, DIRIV_NAME_CSTR, RMDIR_TEMP_PREFIX};
use crate::error::{FsError, FsResult};
use crate::longname::{self, NameType};
use crate::pathmap::make_child_path;
use crate::util::{
    RawEntry, fchmodat_nofollow, file_type_from_mode, open_dir_nofollow, read_raw_entries,
    string_to_cstring,
};
use fuse3::FileType;
use nix::fcntl::AtFlags;
use nix::sys::stat::{FileStat, Mode, fchmod, fstat, fstatat, mkdirat};
use nix::unistd::{Gid, Uid, UnlinkatFlags, fchownat, unlinkat};
use scopeguard::ScopeGuard;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use tracing::{debug, warn};

/// macOS drops these into directories it has displayed.
const STRAY_FILE_NAME: &str = ".DS_Store";
const STRAY_FILE_NAME_CSTR: &CStr = c".DS_Store";
const MAX_STRAY_RETRIES: usize = 4;

#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub kind: FileType,
    pub ino: u64,
}

/// Result of one listing. `mitigated` counts entries that were dropped
/// because their name could not be recovered.
#[derive(Debug, Default)]
pub struct DirListing {
    pub entries: Vec<DirEntryInfo>,
    pub mitigated: usize,
}

fn mkdirat_user(
    dir: BorrowedFd<'_>,
    c_name: &CStr,
    mode: u32,
    owner: Option<Caller>,
) -> FsResult<()> {
    mkdirat(dir, c_name, Mode::from_bits_truncate(mode as _))?;
    let Some(caller) = owner else {
        return Ok(());
    };
    if let Err(err) = fchownat(
        dir,
        c_name,
        Some(Uid::from_raw(caller.uid)),
        Some(Gid::from_raw(caller.gid)),
        AtFlags::AT_SYMLINK_NOFOLLOW,
    ) {
        warn!(uid = caller.uid, gid = caller.gid, error = %err, "mkdir: chown failed");
        if let Err(rollback) = unlinkat(dir, c_name, UnlinkatFlags::RemoveDir) {
            warn!(error = %rollback, "mkdir: rollback after chown failed");
        }
        return Err(err.into());
    }
    Ok(())
}

fn entry_kind(dir: BorrowedFd<'_>, entry: &RawEntry) -> Option<FileType> {
    if let Some(kind) = entry.kind {
        return Some(kind);
    }
    match fstatat(dir, entry.name.as_os_str(), AtFlags::AT_SYMLINK_NOFOLLOW) {
        Ok(st) => Some(file_type_from_mode(st.st_mode)),
        Err(err) => {
            debug!(entry = %entry.name.to_string_lossy(), error = %err, "entry vanished during listing");
            None
        }
    }
}

impl CryptCore {
    fn mkdir_with_iv(
        &self,
        dir: BorrowedFd<'_>,
        c_name: &CStr,
        mode: u32,
        owner: Option<Caller>,
    ) -> FsResult<()> {
        let _guard = self.lock_dir_iv();
        mkdirat_user(dir, c_name, mode, owner)?;

        let written = open_dir_nofollow(dir, c_name).and_then(|fd| diriv::write(fd.as_fd()));
        if let Err(err) = written {
            // The directory has no IV; it must not outlive this call.
            if let Err(rollback) = unlinkat(dir, c_name, UnlinkatFlags::RemoveDir) {
                warn!(error = %rollback, "mkdir: rollback failed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Undoes a completed `mkdir_with_iv`.
    fn discard_new_dir(&self, dir: BorrowedFd<'_>, c_name: &CStr) {
        let _guard = self.lock_dir_iv();
        match open_dir_nofollow(dir, c_name) {
            Ok(fd) => {
                if let Err(err) = unlinkat(fd.as_fd(), DIRIV_NAME_CSTR, UnlinkatFlags::NoRemoveDir)
                    && err != nix::Error::ENOENT
                {
                    warn!(error = %err, "mkdir: rollback could not delete IV");
                }
            }
            Err(FsError::NotFound) => return,
            Err(err) => warn!(error = %err, "mkdir: rollback could not open directory"),
        }
        if let Err(err) = unlinkat(dir, c_name, UnlinkatFlags::RemoveDir) {
            warn!(error = %err, "mkdir: rollback failed");
        }
    }

    /// Creates `name` below `parent` together with its IV and returns the
    /// attributes of the new directory.
    pub fn mkdir(
        &self,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        caller: Caller,
    ) -> FsResult<FileStat> {
        let path = make_child_path(parent, name);
        let backing = self.open_backing_dir(&path)?;
        if backing.is_root() {
            return Err(FsError::AlreadyExists);
        }
        let flags = self.flags();
        let owner = flags.preserve_owner.then_some(caller);
        let dir = backing.dir_fd.as_fd();
        let c_name = backing.c_name.as_c_str();
        let mode = mode & 0o7777;

        if flags.plaintext_names {
            mkdirat_user(dir, c_name, mode, owner)?;
            return Ok(fstatat(dir, c_name, AtFlags::AT_SYMLINK_NOFOLLOW)?);
        }

        // Owner rwx is needed to create the IV file and to reopen the
        // directory, whatever the caller asked for.
        let augmented = mode | 0o700;

        let side_file = match (backing.placeholder(), backing.long_name.as_deref()) {
            (Some(placeholder), Some(encrypted)) => {
                longname::put(dir, placeholder, encrypted, name)?;
                Some(scopeguard::guard(placeholder, move |placeholder| {
                    longname::delete(dir, placeholder)
                }))
            }
            _ => None,
        };

        self.mkdir_with_iv(dir, c_name, augmented, owner)?;
        let created = scopeguard::guard((), |_| self.discard_new_dir(dir, c_name));

        let fd = open_dir_nofollow(dir, c_name).map_err(|err| {
            warn!(name = %path.to_string_lossy(), error = %err, "mkdir: reopen failed");
            if err.is_not_found() { FsError::Racing } else { err }
        })?;
        let mut st = fstat(&fd).map_err(|err| {
            warn!(name = %path.to_string_lossy(), error = %err, "mkdir: fstat failed");
            FsError::from(err)
        })?;

        if mode != augmented {
            // Keep special bits the backend applied, such as an inherited
            // set-group-id.
            let target = (st.st_mode as u32 & 0o7000) | mode;
            match fchmod(&fd, Mode::from_bits_truncate(target as _)) {
                Ok(()) => {
                    st.st_mode = (st.st_mode & libc::S_IFMT) | target as libc::mode_t;
                }
                Err(err) => {
                    warn!(
                        name = %path.to_string_lossy(),
                        from = %format!("{augmented:#o}"),
                        to = %format!("{target:#o}"),
                        error = %err,
                        "mkdir: fchmod failed"
                    );
                }
            }
        }

        ScopeGuard::into_inner(created);
        if let Some(guard) = side_file {
            ScopeGuard::into_inner(guard);
        }
        Ok(st)
    }

    /// Opens the backing directory for `path` without following symlinks.
    pub fn open_dir(&self, path: &OsStr) -> FsResult<OwnedFd> {
        let backing = self.open_backing_dir(path)?;
        open_dir_nofollow(backing.dir_fd.as_fd(), backing.c_name.as_c_str())
    }

    pub fn opendir_check(&self, path: &OsStr) -> FsResult<()> {
        self.open_dir(path).map(drop)
    }

    /// Lists `path` with decrypted names, in backend order. Entries whose
    /// name cannot be recovered are logged, counted and left out.
    pub fn read_dir(&self, path: &OsStr) -> FsResult<DirListing> {
        let backing = self.open_backing_dir(path)?;
        let fd = open_dir_nofollow(backing.dir_fd.as_fd(), backing.c_name.as_c_str())?;
        let raw_entries = read_raw_entries(fd.as_fd())?;
        let flags = self.flags();
        let is_root = backing.is_root();

        let dir_iv = if flags.plaintext_names {
            None
        } else {
            match diriv::read(fd.as_fd()) {
                Ok(iv) => Some(iv),
                Err(err) => {
                    warn!(dir = %path.to_string_lossy(), error = %err, "could not read directory IV");
                    return Err(match err {
                        FsError::Corrupt { .. } => err,
                        other => FsError::corrupt("diriv", other.to_string()),
                    });
                }
            }
        };

        let mut listing = DirListing::default();
        for entry in raw_entries {
            let raw = entry.name.as_bytes();
            if is_root && raw == CONF_NAME.as_bytes() {
                continue;
            }

            let Some(iv) = dir_iv.as_ref() else {
                if let Some(kind) = entry_kind(fd.as_fd(), &entry) {
                    listing.entries.push(DirEntryInfo {
                        name: entry.name,
                        kind,
                        ino: entry.ino,
                    });
                }
                continue;
            };

            if raw == DIRIV_NAME.as_bytes() || raw.starts_with(RMDIR_TEMP_PREFIX.as_bytes()) {
                continue;
            }

            let name_type = if flags.long_names {
                longname::name_type(raw)
            } else {
                NameType::None
            };
            let encrypted = match name_type {
                NameType::SideFile => continue,
                NameType::Placeholder => match longname::get(fd.as_fd(), &entry.name) {
                    Ok(v) => v,
                    Err(err) => {
                        self.report_mitigated_corruption(path, &entry.name, &err);
                        listing.mitigated += 1;
                        continue;
                    }
                },
                NameType::None => match entry.name.to_str() {
                    Some(v) => v.to_owned(),
                    None => {
                        let err = FsError::corrupt("name", "not valid utf-8");
                        self.report_mitigated_corruption(path, &entry.name, &err);
                        listing.mitigated += 1;
                        continue;
                    }
                },
            };

            let plain = match self.names.decrypt_name(&encrypted, iv) {
                Ok(v) => v,
                Err(err) => {
                    self.report_mitigated_corruption(path, &entry.name, &err);
                    listing.mitigated += 1;
                    continue;
                }
            };
            if let Some(kind) = entry_kind(fd.as_fd(), &entry) {
                listing.entries.push(DirEntryInfo {
                    name: plain,
                    kind,
                    ino: entry.ino,
                });
            }
        }

        Ok(listing)
    }

    /// Moves the IV of `dir` into the parent under a temporary name and
    /// removes the directory. If the removal fails the IV is moved back.
    /// Returns the temporary name, which the caller deletes.
    fn remove_with_parked_iv(
        &self,
        parent_fd: BorrowedFd<'_>,
        c_name: &CStr,
        dir: BorrowedFd<'_>,
    ) -> FsResult<CString> {
        let tmp_name = diriv::rmdir_temp_name();
        let tmp_c = string_to_cstring(&tmp_name)?;
        let _guard = self.lock_dir_iv();
        debug!(tmp = %tmp_name, "rmdir: parking directory IV");
        diriv::relocate(dir, DIRIV_NAME_CSTR, parent_fd, tmp_c.as_c_str()).inspect_err(|err| {
            warn!(tmp = %tmp_name, error = %err, "rmdir: parking IV failed");
        })?;

        if let Err(err) = unlinkat(parent_fd, c_name, UnlinkatFlags::RemoveDir) {
            // Typically an entry was created in the meantime.
            if let Err(rollback) = diriv::relocate(parent_fd, tmp_c.as_c_str(), dir, DIRIV_NAME_CSTR)
            {
                warn!(tmp = %tmp_name, error = %rollback, "rmdir: IV rollback failed");
            }
            return Err(err.into());
        }
        Ok(tmp_c)
    }

    /// Removes the empty directory `name` below `parent`, disposing of its
    /// IV and long-name side file.
    pub fn rmdir(&self, parent: &OsStr, name: &OsStr) -> FsResult<()> {
        let path = make_child_path(parent, name);
        let backing = self.open_backing_dir(&path)?;
        if backing.is_root() {
            return Err(FsError::PermissionDenied);
        }
        let flags = self.flags();
        let parent_fd = backing.dir_fd.as_fd();
        let c_name = backing.c_name.as_c_str();

        if flags.plaintext_names {
            unlinkat(parent_fd, c_name, UnlinkatFlags::RemoveDir)?;
            self.dir_cache.clear();
            return Ok(());
        }

        // Without root privileges we need rwx on the directory to move its IV.
        let mut widened: Option<Mode> = None;
        if !flags.preserve_owner {
            let st = fstatat(parent_fd, c_name, AtFlags::AT_SYMLINK_NOFOLLOW)?;
            if st.st_mode & 0o700 != 0o700 {
                debug!(name = %path.to_string_lossy(), "rmdir: widening permissions");
                let orig = Mode::from_bits_truncate(st.st_mode);
                fchmodat_nofollow(parent_fd, c_name, orig | Mode::S_IRWXU).inspect_err(|err| {
                    debug!(error = %err, "rmdir: chmod failed");
                })?;
                widened = Some(orig);
            }
        }

        let dir_fd = match open_dir_nofollow(parent_fd, c_name) {
            Ok(fd) => fd,
            Err(err) => {
                debug!(error = %err, "rmdir: open failed");
                if let Some(orig) = widened
                    && let Err(rollback) = fchmodat_nofollow(parent_fd, c_name, orig)
                {
                    warn!(error = %rollback, "rmdir: permission rollback failed");
                }
                return Err(err);
            }
        };
        let opened = dir_fd.as_fd();
        let perm_guard = widened.map(|orig| {
            scopeguard::guard(orig, move |orig| {
                if let Err(err) = fchmod(opened, orig) {
                    warn!(error = %err, "rmdir: permission rollback failed");
                }
            })
        });

        let mut stray_removals = 0usize;
        loop {
            let children = read_raw_entries(dir_fd.as_fd()).inspect_err(|err| {
                warn!(error = %err, "rmdir: reading entries failed");
            })?;
            if children.is_empty() {
                warn!(name = %path.to_string_lossy(), "rmdir: {DIRIV_NAME} is missing");
                unlinkat(parent_fd, c_name, UnlinkatFlags::RemoveDir)?;
                if let Some(guard) = perm_guard {
                    ScopeGuard::into_inner(guard);
                }
                if let Some(placeholder) = backing.placeholder() {
                    longname::delete(parent_fd, placeholder);
                }
                self.dir_cache.clear();
                return Ok(());
            }

            let others: Vec<&RawEntry> = children
                .iter()
                .filter(|e| e.name.as_bytes() != DIRIV_NAME.as_bytes())
                .collect();
            if flags.remove_stray_files
                && others.len() == 1
                && others[0].name.as_bytes() == STRAY_FILE_NAME.as_bytes()
            {
                if stray_removals >= MAX_STRAY_RETRIES {
                    warn!(name = %path.to_string_lossy(), "rmdir: {STRAY_FILE_NAME} keeps reappearing");
                    return Err(FsError::Io(io::Error::other(format!(
                        "{STRAY_FILE_NAME} keeps reappearing"
                    ))));
                }
                unlinkat(dir_fd.as_fd(), STRAY_FILE_NAME_CSTR, UnlinkatFlags::NoRemoveDir)
                    .inspect_err(|err| {
                        warn!(error = %err, "rmdir: failed to delete blocking {STRAY_FILE_NAME}");
                    })?;
                warn!(name = %path.to_string_lossy(), "rmdir: had to delete blocking {STRAY_FILE_NAME}");
                stray_removals += 1;
                continue;
            }
            // Do not even start moving the IV around.
            if !others.is_empty() {
                return Err(FsError::NotEmpty);
            }
            break;
        }

        let tmp_c = self.remove_with_parked_iv(parent_fd, c_name, dir_fd.as_fd())?;
        let tmp_name = tmp_c.to_string_lossy();

        if let Some(guard) = perm_guard {
            ScopeGuard::into_inner(guard);
        }
        if let Err(err) = unlinkat(parent_fd, tmp_c.as_c_str(), UnlinkatFlags::NoRemoveDir) {
            warn!(tmp = %tmp_name, error = %err, "rmdir: could not clean up parked IV");
        }
        if let Some(placeholder) = backing.placeholder() {
            longname::delete(parent_fd, placeholder);
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
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn root() -> &'static OsStr {
        OsStr::new("/")
    }

    fn names(listing: &DirListing) -> Vec<OsString> {
        let mut names: Vec<_> = listing.entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    fn backend_name(core: &CryptCore, path: &str) -> String {
        core.open_backing_dir(OsStr::new(path))
            .unwrap()
            .c_name
            .into_string()
            .unwrap()
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    fn backend_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn mkdir_creates_iv_and_applies_requested_mode() {
        let (tmp, core) = test_core(InitOptions::default());
        let st = core
            .mkdir(root(), OsStr::new("café"), 0o750, Caller::current())
            .unwrap();
        assert_eq!(st.st_mode & 0o7777, 0o750);

        let c_name = backend_name(&core, "/café");
        let backend_dir = tmp.path().join(&c_name);
        assert_eq!(mode_of(&backend_dir), 0o750);
        assert_eq!(backend_entries(&backend_dir), vec![DIRIV_NAME.to_string()]);
        let fd = core.open_dir(OsStr::new("/café")).unwrap();
        assert!(diriv::read(fd.as_fd()).is_ok());

        let listing = core.read_dir(root()).unwrap();
        assert_eq!(names(&listing), vec![OsString::from("café")]);
        assert_eq!(listing.mitigated, 0);
    }

    #[test]
    fn mkdir_with_restrictive_mode_ends_restrictive() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("locked"), 0o500, Caller::current())
            .unwrap();
        let backend_dir = tmp.path().join(backend_name(&core, "/locked"));
        assert_eq!(mode_of(&backend_dir), 0o500);
        fs::set_permissions(&backend_dir, fs::Permissions::from_mode(0o700)).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn mkdir_keeps_inherited_setgid() {
        let (tmp, core) = test_core(InitOptions::default());
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o2755)).unwrap();
        if mode_of(tmp.path()) & 0o2000 == 0 {
            return;
        }
        core.mkdir(root(), OsStr::new("shared"), 0o750, Caller::current())
            .unwrap();
        let c_name = backend_name(&core, "/shared");
        assert_eq!(mode_of(&tmp.path().join(c_name)), 0o2750);
    }

    #[test]
    fn mkdir_twice_reports_existing() {
        let (_tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("a"), 0o755, Caller::current())
            .unwrap();
        let err = core
            .mkdir(root(), OsStr::new("a"), 0o755, Caller::current())
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists));
    }

    #[test]
    fn rmdir_then_second_rmdir_is_not_found() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("café"), 0o755, Caller::current())
            .unwrap();
        core.rmdir(root(), OsStr::new("café")).unwrap();
        assert!(matches!(
            core.rmdir(root(), OsStr::new("café")),
            Err(FsError::NotFound)
        ));
        assert!(core.read_dir(root()).unwrap().entries.is_empty());
        assert_eq!(
            backend_entries(tmp.path()),
            vec![CONF_NAME.to_string(), DIRIV_NAME.to_string()]
        );
    }

    #[test]
    fn rmdir_on_non_empty_leaves_everything_in_place() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("a"), 0o755, Caller::current())
            .unwrap();
        core.mkdir(OsStr::new("/a"), OsStr::new("b"), 0o755, Caller::current())
            .unwrap();
        let backend_dir = tmp.path().join(backend_name(&core, "/a"));
        let before = backend_entries(&backend_dir);

        let err = core.rmdir(root(), OsStr::new("a")).unwrap_err();
        assert!(matches!(err, FsError::NotEmpty));
        assert_eq!(backend_entries(&backend_dir), before);
        assert_eq!(
            names(&core.read_dir(OsStr::new("/a")).unwrap()),
            vec![OsString::from("b")]
        );
        assert_eq!(backend_entries(tmp.path()).len(), 3);
    }

    #[test]
    fn rmdir_handles_directory_without_owner_rwx() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("ro"), 0o500, Caller::current())
            .unwrap();
        let backend_dir = tmp.path().join(backend_name(&core, "/ro"));
        core.rmdir(root(), OsStr::new("ro")).unwrap();
        assert!(!backend_dir.exists());
    }

    #[test]
    fn failed_rmdir_restores_original_permissions() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("a"), 0o755, Caller::current())
            .unwrap();
        core.mkdir(OsStr::new("/a"), OsStr::new("b"), 0o755, Caller::current())
            .unwrap();
        let backend_dir = tmp.path().join(backend_name(&core, "/a"));
        fs::set_permissions(&backend_dir, fs::Permissions::from_mode(0o500)).unwrap();

        assert!(matches!(
            core.rmdir(root(), OsStr::new("a")),
            Err(FsError::NotEmpty)
        ));
        assert_eq!(mode_of(&backend_dir), 0o500);
        fs::set_permissions(&backend_dir, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn rmdir_removes_directory_with_missing_iv() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("broken"), 0o755, Caller::current())
            .unwrap();
        let backend_dir = tmp.path().join(backend_name(&core, "/broken"));
        fs::remove_file(backend_dir.join(DIRIV_NAME)).unwrap();

        core.rmdir(root(), OsStr::new("broken")).unwrap();
        assert!(!backend_dir.exists());
    }

    #[test]
    fn stray_file_is_cleaned_up_when_enabled() {
        let (tmp, core) = test_core_with(
            InitOptions::default(),
            MountOptions {
                remove_stray_files: Some(true),
                ..MountOptions::default()
            },
        );
        core.mkdir(root(), OsStr::new("finder"), 0o755, Caller::current())
            .unwrap();
        let backend_dir = tmp.path().join(backend_name(&core, "/finder"));
        fs::write(backend_dir.join(STRAY_FILE_NAME), b"junk").unwrap();

        core.rmdir(root(), OsStr::new("finder")).unwrap();
        assert!(!backend_dir.exists());
    }

    #[test]
    fn stray_file_blocks_removal_when_disabled() {
        let (tmp, core) = test_core_with(
            InitOptions::default(),
            MountOptions {
                remove_stray_files: Some(false),
                ..MountOptions::default()
            },
        );
        core.mkdir(root(), OsStr::new("finder"), 0o755, Caller::current())
            .unwrap();
        let backend_dir = tmp.path().join(backend_name(&core, "/finder"));
        fs::write(backend_dir.join(STRAY_FILE_NAME), b"junk").unwrap();

        assert!(matches!(
            core.rmdir(root(), OsStr::new("finder")),
            Err(FsError::NotEmpty)
        ));
        assert!(backend_dir.join(DIRIV_NAME).exists());
    }

    #[test]
    fn listing_skips_corrupt_entries_and_counts_them() {
        let (tmp, core) = test_core(InitOptions::default());
        for name in ["x", "y", "z"] {
            core.mkdir(root(), OsStr::new(name), 0o755, Caller::current())
                .unwrap();
        }
        fs::write(tmp.path().join("garbage"), b"").unwrap();
        let orphan = longname::placeholder_for(&"Q".repeat(300));
        fs::write(tmp.path().join(orphan), b"").unwrap();

        let listing = core.read_dir(root()).unwrap();
        assert_eq!(
            names(&listing),
            vec![OsString::from("x"), OsString::from("y"), OsString::from("z")]
        );
        assert_eq!(listing.mitigated, 2);
        assert_eq!(core.mitigated_corruptions(), 2);
    }

    #[test]
    fn entry_moved_from_other_directory_does_not_decrypt() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("a"), 0o755, Caller::current())
            .unwrap();
        core.mkdir(OsStr::new("/a"), OsStr::new("inner"), 0o755, Caller::current())
            .unwrap();
        let a_dir = tmp.path().join(backend_name(&core, "/a"));
        let inner = backend_name(&core, "/a/inner");
        fs::rename(a_dir.join(&inner), tmp.path().join(&inner)).unwrap();

        let listing = core.read_dir(root()).unwrap();
        assert_eq!(names(&listing), vec![OsString::from("a")]);
        assert_eq!(listing.mitigated, 1);
    }

    #[test]
    fn listing_without_iv_is_corrupt() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("a"), 0o755, Caller::current())
            .unwrap();
        let backend_dir = tmp.path().join(backend_name(&core, "/a"));
        fs::remove_file(backend_dir.join(DIRIV_NAME)).unwrap();

        let err = core.read_dir(OsStr::new("/a")).unwrap_err();
        assert!(matches!(err, FsError::Corrupt { .. }));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn long_directory_name_uses_side_file() {
        let (tmp, core) = test_core(InitOptions::default());
        let long = "d".repeat(200);
        core.mkdir(root(), OsStr::new(&long), 0o755, Caller::current())
            .unwrap();

        let placeholder = backend_name(&core, &format!("/{long}"));
        assert_eq!(longname::name_type(placeholder.as_bytes()), NameType::Placeholder);
        let side = format!("{placeholder}{}", longname::LONGNAME_SUFFIX);
        assert!(tmp.path().join(&placeholder).is_dir());
        assert!(tmp.path().join(&side).is_file());

        let listing = core.read_dir(root()).unwrap();
        assert_eq!(names(&listing), vec![OsString::from(&long)]);

        core.rmdir(root(), OsStr::new(&long)).unwrap();
        assert!(!tmp.path().join(&placeholder).exists());
        assert!(!tmp.path().join(&side).exists());
    }

    #[test]
    fn failed_long_mkdir_removes_its_side_file() {
        let (tmp, core) = test_core(InitOptions::default());
        let long = "e".repeat(200);
        let placeholder = backend_name(&core, &format!("/{long}"));
        let side = format!("{placeholder}{}", longname::LONGNAME_SUFFIX);
        // A directory already sits under the placeholder, without a side file.
        fs::create_dir(tmp.path().join(&placeholder)).unwrap();

        let err = core
            .mkdir(root(), OsStr::new(&long), 0o755, Caller::current())
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists));
        assert!(!tmp.path().join(&side).exists());
        assert!(backend_entries(&tmp.path().join(&placeholder)).is_empty());
    }

    #[test]
    fn mkdir_refuses_a_taken_side_file_without_creating_anything() {
        let (tmp, core) = test_core(InitOptions::default());
        let long = "f".repeat(200);
        let placeholder = backend_name(&core, &format!("/{long}"));
        let side = format!("{placeholder}{}", longname::LONGNAME_SUFFIX);
        fs::write(tmp.path().join(&side), b"someone else").unwrap();

        let err = core
            .mkdir(root(), OsStr::new(&long), 0o755, Caller::current())
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists));
        assert!(!tmp.path().join(&placeholder).exists());
        assert_eq!(fs::read(tmp.path().join(&side)).unwrap(), b"someone else");
    }

    #[test]
    fn discarding_a_new_directory_leaves_no_trace() {
        let (tmp, core) = test_core(InitOptions::default());
        let root_fd = core.open_dir(root()).unwrap();
        let c_name = CString::new("fresh").unwrap();

        core.mkdir_with_iv(root_fd.as_fd(), c_name.as_c_str(), 0o755, None)
            .unwrap();
        assert_eq!(
            backend_entries(&tmp.path().join("fresh")),
            vec![DIRIV_NAME.to_string()]
        );

        core.discard_new_dir(root_fd.as_fd(), c_name.as_c_str());
        assert_eq!(
            backend_entries(tmp.path()),
            vec![CONF_NAME.to_string(), DIRIV_NAME.to_string()]
        );
    }

    #[test]
    fn failed_removal_puts_the_iv_back() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("a"), 0o755, Caller::current())
            .unwrap();
        let backing = core.open_backing_dir(OsStr::new("/a")).unwrap();
        let dir_fd = core.open_dir(OsStr::new("/a")).unwrap();
        let iv_before = diriv::read(dir_fd.as_fd()).unwrap();
        // An entry that appeared after the emptiness check.
        core.mkdir(OsStr::new("/a"), OsStr::new("late"), 0o755, Caller::current())
            .unwrap();

        let err = core
            .remove_with_parked_iv(
                backing.dir_fd.as_fd(),
                backing.c_name.as_c_str(),
                dir_fd.as_fd(),
            )
            .unwrap_err();
        assert!(matches!(err, FsError::NotEmpty | FsError::AlreadyExists));

        assert!(diriv::read(dir_fd.as_fd()).unwrap() == iv_before);
        assert!(
            backend_entries(tmp.path())
                .iter()
                .all(|name| !name.starts_with(RMDIR_TEMP_PREFIX))
        );
        assert_eq!(
            names(&core.read_dir(OsStr::new("/a")).unwrap()),
            vec![OsString::from("late")]
        );
    }

    #[test]
    fn root_listing_hides_reserved_files() {
        let (_tmp, core) = test_core(InitOptions::default());
        let listing = core.read_dir(root()).unwrap();
        assert!(listing.entries.is_empty());
        assert_eq!(listing.mitigated, 0);
    }

    #[test]
    fn plaintext_mode_skips_iv_handling() {
        let (tmp, core) = test_core(InitOptions {
            plaintext_names: true,
            ..InitOptions::default()
        });
        core.mkdir(root(), OsStr::new("plain"), 0o700, Caller::current())
            .unwrap();
        assert!(tmp.path().join("plain").is_dir());
        assert!(backend_entries(&tmp.path().join("plain")).is_empty());
        assert_eq!(
            names(&core.read_dir(root()).unwrap()),
            vec![OsString::from("plain")]
        );

        core.rmdir(root(), OsStr::new("plain")).unwrap();
        assert!(!tmp.path().join("plain").exists());
        assert!(matches!(
            core.mkdir(root(), OsStr::new(CONF_NAME), 0o700, Caller::current()),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn opendir_check_reports_underlying_errors() {
        let (tmp, core) = test_core(InitOptions::default());
        core.mkdir(root(), OsStr::new("d"), 0o755, Caller::current())
            .unwrap();
        core.opendir_check(OsStr::new("/d")).unwrap();
        core.opendir_check(root()).unwrap();
        assert!(matches!(
            core.opendir_check(OsStr::new("/missing")),
            Err(FsError::NotFound)
        ));

        let backing = core.open_backing_dir(OsStr::new("/file")).unwrap();
        fs::write(tmp.path().join(backing.c_name.to_str().unwrap()), b"").unwrap();
        assert!(matches!(
            core.opendir_check(OsStr::new("/file")),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn concurrent_create_remove_keeps_listing_clean() {
        let (_tmp, core) = test_core(InitOptions::default());
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let core = &core;
                scope.spawn(move || {
                    let name = format!("w{worker}");
                    for _ in 0..25 {
                        core.mkdir(root(), OsStr::new(&name), 0o755, Caller::current())
                            .unwrap();
                        core.rmdir(root(), OsStr::new(&name)).unwrap();
                    }
                });
            }
            let core = &core;
            scope.spawn(move || {
                for _ in 0..50 {
                    core.read_dir(root()).unwrap();
                }
            });
        });
        assert_eq!(core.mitigated_corruptions(), 0);
        assert!(core.read_dir(root()).unwrap().entries.is_empty());
    }
}
