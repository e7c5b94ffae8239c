use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    PermissionDenied,
    /// An IV file, long-name side file or encrypted name could not be used.
    #[error("corrupt {what}: {reason}")]
    Corrupt { what: &'static str, reason: String },
    /// An entry appeared or vanished between two steps of one operation.
    #[error("entry changed while the operation was in progress")]
    Racing,
    #[error("name too long")]
    NameTooLong,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("invalid name")]
    InvalidName,
    #[error(transparent)]
    Io(io::Error),
}

impl FsError {
    pub fn corrupt(what: &'static str, reason: impl Into<String>) -> Self {
        FsError::Corrupt {
            what,
            reason: reason.into(),
        }
    }

    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => FsError::NotFound,
            libc::ENOTDIR => FsError::NotADirectory,
            libc::ENOTEMPTY => FsError::NotEmpty,
            libc::EACCES | libc::EPERM => FsError::PermissionDenied,
            libc::ENAMETOOLONG => FsError::NameTooLong,
            libc::EEXIST => FsError::AlreadyExists,
            _ => FsError::Io(io::Error::from_raw_os_error(errno)),
        }
    }

    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::PermissionDenied => libc::EPERM,
            FsError::Corrupt { .. } => libc::EIO,
            FsError::Racing => libc::ESTALE,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::InvalidName => libc::EINVAL,
            FsError::Io(ioe) => ioe.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound)
    }
}

impl From<io::Error> for FsError {
    fn from(value: io::Error) -> Self {
        if let Some(errno) = value.raw_os_error() {
            FsError::from_errno(errno)
        } else {
            FsError::Io(value)
        }
    }
}

impl From<nix::Error> for FsError {
    fn from(value: nix::Error) -> Self {
        FsError::from_errno(value as i32)
    }
}

impl From<FsError> for fuse3::Errno {
    fn from(value: FsError) -> Self {
        fuse3::Errno::from(value.to_errno())
    }
}

pub type FsResult<T> = Result<T, FsError>;
