use crate::error::{FsError, FsResult};
use fuse3::FileType;
use fuse3::path::reply::FileAttr;
use libc;
use nix::dir::{Dir, Type};
use nix::errno::Errno as NixErrno;
use nix::fcntl::{OFlag, openat};
use nix::sys::stat::{FileStat, Mode, fstat};
use nix::unistd::{UnlinkatFlags, fsync, unlinkat};
use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::fd::BorrowedFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// One raw backend directory entry, `.` and `..` excluded.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub name: OsString,
    pub kind: Option<FileType>,
    pub ino: u64,
}

pub fn errno_from_nix(err: nix::Error) -> fuse3::Errno {
    fuse3::Errno::from(err as i32)
}

pub fn string_to_cstring(value: &str) -> FsResult<CString> {
    CString::new(value.as_bytes()).map_err(|_| FsError::InvalidName)
}

pub fn os_to_cstring(value: &OsStr) -> FsResult<CString> {
    CString::new(value.as_bytes()).map_err(|_| FsError::InvalidName)
}

pub fn file_type_from_mode(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn file_type_from_dirent(kind: Type) -> FileType {
    match kind {
        Type::Directory => FileType::Directory,
        Type::Symlink => FileType::Symlink,
        Type::CharacterDevice => FileType::CharDevice,
        Type::BlockDevice => FileType::BlockDevice,
        Type::Fifo => FileType::NamedPipe,
        Type::Socket => FileType::Socket,
        Type::File => FileType::RegularFile,
    }
}

fn system_time_from_raw(sec: i64, nsec: i64) -> SystemTime {
    if sec < 0 {
        return UNIX_EPOCH;
    }
    let nanos = if nsec < 0 { 0 } else { nsec as u32 };
    UNIX_EPOCH + Duration::new(sec as u64, nanos)
}

pub fn file_attr_from_stat(stat: &FileStat) -> FileAttr {
    let kind = file_type_from_mode(stat.st_mode);
    let perm = fuse3::perm_from_mode_and_kind(kind, stat.st_mode as libc::mode_t);

    FileAttr {
        size: stat.st_size as u64,
        blocks: stat.st_blocks as u64,
        atime: system_time_from_raw(stat.st_atime, stat.st_atime_nsec.into()),
        mtime: system_time_from_raw(stat.st_mtime, stat.st_mtime_nsec.into()),
        ctime: system_time_from_raw(stat.st_ctime, stat.st_ctime_nsec.into()),
        kind,
        perm,
        nlink: stat.st_nlink as u32,
        uid: stat.st_uid,
        gid: stat.st_gid,
        rdev: stat.st_rdev as u32,
        blksize: stat.st_blksize as u32,
        #[cfg(target_os = "macos")]
        crtime: UNIX_EPOCH,
        #[cfg(target_os = "macos")]
        flags: 0,
    }
}

pub fn oflag_from_bits(flags: u32) -> OFlag {
    OFlag::from_bits_truncate(flags as i32)
}

pub fn access_mask_from_bits(mask: u32) -> nix::unistd::AccessFlags {
    nix::unistd::AccessFlags::from_bits_truncate(mask as i32)
}

pub fn retry_eintr<T, F>(mut op: F) -> Result<T, nix::Error>
where
    F: FnMut() -> Result<T, nix::Error>,
{
    loop {
        match op() {
            Err(err) if err == NixErrno::EINTR => continue,
            other => return other,
        }
    }
}

/// Opens a directory below `dir` without following a symlink in `name`.
pub fn open_dir_nofollow(dir: BorrowedFd<'_>, name: &CStr) -> FsResult<std::os::fd::OwnedFd> {
    let fd = openat(
        dir,
        name,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    Ok(fd)
}

/// Creates `name` exclusively and writes `data` durably. A partial file is
/// unlinked again before the error is returned.
pub fn write_file_exclusive(
    dir: BorrowedFd<'_>,
    name: &CStr,
    data: &[u8],
    mode: Mode,
) -> FsResult<()> {
    let fd = openat(
        dir,
        name,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        mode,
    )?;

    let result = (|| -> FsResult<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let written = retry_eintr(|| nix::unistd::write(&fd, &data[offset..]))?;
            if written == 0 {
                return Err(FsError::from_errno(libc::EIO));
            }
            offset += written;
        }
        fsync(&fd)?;
        Ok(())
    })();

    if result.is_err() {
        drop(fd);
        discard_partial_file(dir, name);
    }
    result
}

fn discard_partial_file(dir: BorrowedFd<'_>, name: &CStr) {
    if let Err(err) = unlinkat(dir, name, UnlinkatFlags::NoRemoveDir) {
        warn!(name = %name.to_string_lossy(), error = %err, "removing partial file failed");
    }
}

/// Reads at most `limit + 1` bytes so callers can detect oversized files.
pub fn read_small_file(dir: BorrowedFd<'_>, name: &CStr, limit: usize) -> FsResult<Vec<u8>> {
    let fd = openat(
        dir,
        name,
        OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;

    let mut buf = vec![0u8; limit + 1];
    let mut filled = 0usize;
    while filled < buf.len() {
        let read_len = retry_eintr(|| nix::unistd::read(&fd, &mut buf[filled..]))?;
        if read_len == 0 {
            break;
        }
        filled += read_len;
    }
    buf.truncate(filled);
    Ok(buf)
}

pub fn fsync_dir(dir: BorrowedFd<'_>) -> FsResult<()> {
    retry_eintr(|| fsync(dir))?;
    Ok(())
}

/// Lists the raw backend entries of the directory behind `dir`, in the order
/// the backing filesystem reports them.
pub fn read_raw_entries(dir: BorrowedFd<'_>) -> FsResult<Vec<RawEntry>> {
    let mut handle = Dir::openat(
        dir,
        ".",
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;

    let mut entries = Vec::new();
    for entry in handle.iter() {
        let entry = entry?;
        let raw = entry.file_name().to_bytes();
        if raw == b"." || raw == b".." {
            continue;
        }
        entries.push(RawEntry {
            name: OsString::from_vec(raw.to_vec()),
            kind: entry.file_type().map(file_type_from_dirent),
            ino: entry.ino(),
        });
    }
    Ok(entries)
}

/// chmod that refuses to act through a symlink.
#[cfg(target_os = "linux")]
pub fn fchmodat_nofollow(dir: BorrowedFd<'_>, name: &CStr, mode: Mode) -> FsResult<()> {
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::PermissionsExt;

    let fd = openat(
        dir,
        name,
        OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    let stat = fstat(&fd)?;
    if stat.st_mode & libc::S_IFMT == libc::S_IFLNK {
        return Err(FsError::from_errno(libc::ELOOP));
    }
    // O_PATH descriptors cannot be fchmod'ed; go through procfs instead.
    let proc_path = format!("/proc/self/fd/{}", fd.as_raw_fd());
    std::fs::set_permissions(&proc_path, std::fs::Permissions::from_mode(mode.bits() as u32))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn fchmodat_nofollow(dir: BorrowedFd<'_>, name: &CStr, mode: Mode) -> FsResult<()> {
    nix::sys::stat::fchmodat(
        dir,
        name,
        mode,
        nix::sys::stat::FchmodatFlags::NoFollowSymlink,
    )?;
    Ok(())
}
