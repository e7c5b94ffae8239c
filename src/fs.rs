use crate::core::{Caller, CryptCore};
use crate::dirops::DirEntryInfo;
use crate::handle_table::HandleTable;
use crate::pathmap::make_child_path;
use crate::util::{
    access_mask_from_bits, errno_from_nix, fchmodat_nofollow, file_attr_from_stat, retry_eintr,
};
use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::path::reply::DirectoryEntryPlus;
use fuse3::{FileType, SetAttr};
use nix::fcntl::{AtFlags, OFlag, openat};
use nix::sys::stat::{Mode, UtimensatFlags, utimensat};
use nix::sys::statvfs::fstatvfs;
use nix::sys::time::TimeSpec;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{Gid, Uid, faccessat, fchownat, fdatasync, fsync, ftruncate};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const ATTR_TTL: Duration = Duration::from_secs(1);
const MIN_MAX_WRITE: u32 = 4096;

fn bad_handle() -> fuse3::Errno {
    fuse3::Errno::from(libc::EBADF)
}

pub struct CryptNameFs {
    core: Arc<CryptCore>,
    handles: HandleTable,
    max_write: NonZeroU32,
}

impl CryptNameFs {
    pub fn new(core: CryptCore, max_write_kb: u32) -> Self {
        let bytes = max_write_kb.saturating_mul(1024).max(MIN_MAX_WRITE);
        let max_write = NonZeroU32::new(bytes).unwrap_or(NonZeroU32::MIN);
        Self {
            core: Arc::new(core),
            handles: HandleTable::new(),
            max_write,
        }
    }

    fn attr(&self, path: &OsStr) -> Result<FileAttr, fuse3::Errno> {
        let stat = self.core.stat(path)?;
        Ok(file_attr_from_stat(&stat))
    }

    fn file(&self, fh: u64) -> Result<Arc<OwnedFd>, fuse3::Errno> {
        self.handles.get(fh).ok_or_else(bad_handle)
    }

    fn list(&self, path: &OsStr) -> Result<Vec<DirEntryInfo>, fuse3::Errno> {
        let listing = self.core.read_dir(path)?;
        if listing.mitigated > 0 {
            debug!(
                dir = %path.to_string_lossy(),
                skipped = listing.mitigated,
                "listing omitted undecodable entries"
            );
        }
        Ok(listing.entries)
    }
}

impl PathFilesystem for CryptNameFs {
    async fn init(&self, _req: Request) -> Result<ReplyInit, fuse3::Errno> {
        let flags = self.core.flags();
        info!(
            backend = %self.core.config().backend_path.display(),
            plaintext_names = flags.plaintext_names,
            long_names = flags.long_names,
            "filesystem initialized"
        );
        Ok(ReplyInit {
            max_write: self.max_write,
        })
    }

    async fn destroy(&self, _req: Request) {
        info!(
            mitigated_corruptions = self.core.mitigated_corruptions(),
            "filesystem destroyed"
        );
    }

    async fn lookup(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let attr = self.attr(&path)?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        if let Some(fd) = fh.and_then(|id| self.handles.get(id)) {
            let stat = nix::sys::stat::fstat(fd.as_fd()).map_err(errno_from_nix)?;
            return Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr: file_attr_from_stat(&stat),
            });
        }

        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: self.attr(path)?,
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
        let backing = self.core.open_backing_dir(path)?;
        let dir = backing.dir_fd.as_fd();
        let c_name = backing.c_name.as_c_str();

        if let Some(mode) = set_attr.mode {
            fchmodat_nofollow(dir, c_name, Mode::from_bits_truncate(mode as _))?;
        }

        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            fchownat(
                dir,
                c_name,
                set_attr.uid.map(Uid::from_raw),
                set_attr.gid.map(Gid::from_raw),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            )
            .map_err(errno_from_nix)?;
        }

        if let Some(size) = set_attr.size {
            if backing.is_root() {
                return Err(fuse3::Errno::from(libc::EISDIR));
            }
            match fh.and_then(|id| self.handles.get(id)) {
                Some(fd) => ftruncate(fd.as_fd(), size as i64).map_err(errno_from_nix)?,
                None => {
                    let file = openat(
                        dir,
                        c_name,
                        OFlag::O_WRONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                        Mode::empty(),
                    )
                    .map_err(errno_from_nix)?;
                    ftruncate(&file, size as i64).map_err(errno_from_nix)?;
                }
            }
        }

        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let atime = set_attr
                .atime
                .map(|t| TimeSpec::new(t.sec, t.nsec as _))
                .unwrap_or(TimeSpec::UTIME_OMIT);
            let mtime = set_attr
                .mtime
                .map(|t| TimeSpec::new(t.sec, t.nsec as _))
                .unwrap_or(TimeSpec::UTIME_OMIT);
            utimensat(
                dir,
                c_name,
                &atime,
                &mtime,
                UtimensatFlags::NoFollowSymlink,
            )
            .map_err(errno_from_nix)?;
        }

        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: self.attr(path)?,
        })
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let stat = self
            .core
            .mkdir(parent, name, mode, Caller::new(req.uid, req.gid))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: file_attr_from_stat(&stat),
        })
    }

    async fn unlink(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        self.core.unlink(parent, name)?;
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        self.core.rmdir(parent, name)?;
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let from = make_child_path(origin_parent, origin_name);
        let to = make_child_path(parent, name);
        self.core.rename(&from, &to)?;
        Ok(())
    }

    async fn open(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let fd = self.core.open(path, flags)?;
        Ok(ReplyOpen {
            fh: self.handles.insert(fd),
            flags: 0,
        })
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData, fuse3::Errno> {
        let fd = self.file(fh)?;
        let mut buf = vec![0u8; size as usize];
        let read_len =
            retry_eintr(|| pread(fd.as_fd(), &mut buf, offset as i64)).map_err(errno_from_nix)?;
        buf.truncate(read_len);
        Ok(Bytes::from(buf).into())
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite, fuse3::Errno> {
        let fd = self.file(fh)?;
        let written =
            retry_eintr(|| pwrite(fd.as_fd(), data, offset as i64)).map_err(errno_from_nix)?;
        if self.core.config().sync_data() {
            fdatasync(fd.as_fd()).map_err(errno_from_nix)?;
        }
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<(), fuse3::Errno> {
        self.handles.remove(fh);
        Ok(())
    }

    async fn fsync(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        datasync: bool,
    ) -> Result<(), fuse3::Errno> {
        let fd = self.file(fh)?;
        if datasync {
            fdatasync(fd.as_fd()).map_err(errno_from_nix)?;
        } else {
            fsync(fd.as_fd()).map_err(errno_from_nix)?;
        }
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> Result<(), fuse3::Errno> {
        let fd = self.file(fh)?;
        fsync(fd.as_fd()).map_err(errno_from_nix)
    }

    async fn access(&self, _req: Request, path: &OsStr, mask: u32) -> Result<(), fuse3::Errno> {
        let backing = self.core.open_backing_dir(path)?;
        let flags = if backing.is_root() {
            AtFlags::empty()
        } else {
            AtFlags::AT_SYMLINK_NOFOLLOW
        };
        faccessat(
            backing.dir_fd.as_fd(),
            backing.c_name.as_c_str(),
            access_mask_from_bits(mask),
            flags,
        )
        .map_err(errno_from_nix)
    }

    async fn create(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> Result<ReplyCreated, fuse3::Errno> {
        let (fd, stat) =
            self.core
                .create(parent, name, mode, flags, Caller::new(req.uid, req.gid))?;
        Ok(ReplyCreated {
            ttl: ATTR_TTL,
            attr: file_attr_from_stat(&stat),
            generation: 0,
            fh: self.handles.insert(fd),
            flags: 0,
        })
    }

    async fn opendir(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        self.core.opendir_check(path)?;
        Ok(ReplyOpen { fh: 0, flags })
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    /// Offsets are positions in a fresh listing of the backend. An entry
    /// created or removed between two calls shifts the positions, so it can
    /// be skipped or returned twice within one pass over the directory.
    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>, fuse3::Errno> {
        let logical = self.list(path)?;
        let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::with_capacity(logical.len() + 2);

        let mut idx: i64 = 0;
        for dot in [".", ".."] {
            idx += 1;
            entries.push(Ok(DirectoryEntry {
                kind: FileType::Directory,
                name: OsString::from(dot),
                offset: idx,
            }));
        }
        for entry in logical {
            idx += 1;
            entries.push(Ok(DirectoryEntry {
                kind: entry.kind,
                name: entry.name,
                offset: idx,
            }));
        }

        let skip = offset.max(0) as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(entries),
        })
    }

    /// Same offset semantics as `readdir`.
    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: &'a OsStr,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>, fuse3::Errno> {
        let logical = self.list(parent)?;
        let dir_attr = self.attr(parent)?;
        let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> =
            Vec::with_capacity(logical.len() + 2);

        let mut idx: i64 = 0;
        for dot in [".", ".."] {
            idx += 1;
            entries.push(Ok(DirectoryEntryPlus {
                kind: FileType::Directory,
                name: OsString::from(dot),
                offset: idx,
                attr: dir_attr,
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }

        for entry in logical {
            let child = make_child_path(parent, &entry.name);
            let attr = match self.attr(&child) {
                Ok(v) => v,
                Err(err) => {
                    debug!(entry = %child.to_string_lossy(), ?err, "entry vanished before stat");
                    continue;
                }
            };
            idx += 1;
            entries.push(Ok(DirectoryEntryPlus {
                kind: entry.kind,
                name: entry.name,
                offset: idx,
                attr,
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }

        let skip = offset as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _path: &OsStr,
        _fh: u64,
        _flags: u32,
    ) -> Result<(), fuse3::Errno> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        path: &OsStr,
        _fh: u64,
        datasync: bool,
    ) -> Result<(), fuse3::Errno> {
        let fd = self.core.open_dir(path)?;
        if datasync {
            fdatasync(fd.as_fd()).map_err(errno_from_nix)?;
        } else {
            fsync(fd.as_fd()).map_err(errno_from_nix)?;
        }
        Ok(())
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> Result<ReplyStatFs, fuse3::Errno> {
        let stats = fstatvfs(self.core.config().backend_fd()).map_err(errno_from_nix)?;
        Ok(ReplyStatFs {
            blocks: stats.blocks(),
            bfree: stats.blocks_free(),
            bavail: stats.blocks_available(),
            files: stats.files(),
            ffree: stats.files_free(),
            bsize: stats.block_size() as u32,
            namelen: stats.name_max() as u32,
            frsize: stats.fragment_size() as u32,
        })
    }
}
