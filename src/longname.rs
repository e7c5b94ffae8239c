use crate::error::{FsError, FsResult};
use crate::util::{fsync_dir, read_small_file, string_to_cstring, write_file_exclusive};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use nix::sys::stat::Mode;
use nix::unistd::{UnlinkatFlags, unlinkat};
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::os::fd::BorrowedFd;
use std::os::unix::ffi::OsStrExt;
use tracing::warn;

pub const LONGNAME_PREFIX: &str = "cryptnamefs.longname.";
pub const LONGNAME_SUFFIX: &str = ".name";
pub const DEFAULT_LONG_NAME_MAX: usize = 255;
const MAX_ENCRYPTED_NAME: usize = 4096;
const SIDE_FILE_PERMS: u32 = 0o400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameType {
    /// Regular ciphertext or a name unrelated to long-name handling.
    None,
    /// Stand-in entry whose real name lives in a side file.
    Placeholder,
    /// The side file itself.
    SideFile,
}

pub fn name_type(raw: &[u8]) -> NameType {
    if !raw.starts_with(LONGNAME_PREFIX.as_bytes()) {
        return NameType::None;
    }
    if raw.ends_with(LONGNAME_SUFFIX.as_bytes()) {
        return NameType::SideFile;
    }
    NameType::Placeholder
}

pub fn is_long(encrypted: &str, long_name_max: usize) -> bool {
    encrypted.len() > long_name_max
}

pub fn placeholder_for(encrypted: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(encrypted.as_bytes());
    let digest = hasher.finalize();
    format!("{LONGNAME_PREFIX}{}", URL_SAFE_NO_PAD.encode(digest))
}

fn side_file_name(placeholder: &str) -> FsResult<std::ffi::CString> {
    let mut composed = String::with_capacity(placeholder.len() + LONGNAME_SUFFIX.len());
    composed.push_str(placeholder);
    composed.push_str(LONGNAME_SUFFIX);
    string_to_cstring(&composed)
}

/// Records `encrypted` in the side file belonging to `placeholder`.
pub fn put(
    dir: BorrowedFd<'_>,
    placeholder: &str,
    encrypted: &str,
    logical_name: &OsStr,
) -> FsResult<()> {
    let fname = side_file_name(placeholder)?;
    write_file_exclusive(
        dir,
        fname.as_c_str(),
        encrypted.as_bytes(),
        Mode::from_bits_truncate(SIDE_FILE_PERMS as _),
    )
    .inspect_err(|err| {
        warn!(
            name = %logical_name.to_string_lossy(),
            placeholder,
            error = %err,
            "failed to write long name side file"
        );
    })?;
    fsync_dir(dir)
}

pub fn get(dir: BorrowedFd<'_>, placeholder: &OsStr) -> FsResult<String> {
    let placeholder = std::str::from_utf8(placeholder.as_bytes())
        .map_err(|_| FsError::corrupt("long name", "placeholder is not utf-8"))?;
    let fname = side_file_name(placeholder)?;
    let data = read_small_file(dir, fname.as_c_str(), MAX_ENCRYPTED_NAME)
        .map_err(|err| FsError::corrupt("long name", err.to_string()))?;
    if data.is_empty() || data.len() > MAX_ENCRYPTED_NAME {
        return Err(FsError::corrupt(
            "long name",
            format!("side file has invalid length {}", data.len()),
        ));
    }
    let encrypted = String::from_utf8(data)
        .map_err(|_| FsError::corrupt("long name", "side file is not utf-8"))?;
    if placeholder_for(&encrypted) != placeholder {
        return Err(FsError::corrupt("long name", "side file does not match placeholder"));
    }
    Ok(encrypted)
}

/// Best effort: the owning entry is already gone when this runs.
pub fn delete(dir: BorrowedFd<'_>, placeholder: &str) {
    let fname = match side_file_name(placeholder) {
        Ok(v) => v,
        Err(err) => {
            warn!(placeholder, error = %err, "invalid long name placeholder");
            return;
        }
    };
    if let Err(err) = unlinkat(dir, fname.as_c_str(), UnlinkatFlags::NoRemoveDir) {
        warn!(placeholder, error = %err, "failed to delete long name side file");
        return;
    }
    if let Err(err) = fsync_dir(dir) {
        warn!(placeholder, error = %err, "fsync after side file delete failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{OFlag, open};
    use std::fs;
    use std::os::fd::AsFd;

    #[test]
    fn classifies_longname_artifacts() {
        let placeholder = placeholder_for("x".repeat(300).as_str());
        assert_eq!(name_type(placeholder.as_bytes()), NameType::Placeholder);
        let side = format!("{placeholder}{LONGNAME_SUFFIX}");
        assert_eq!(name_type(side.as_bytes()), NameType::SideFile);
        assert_eq!(name_type(b"c2VjcmV0"), NameType::None);
    }

    #[test]
    fn placeholder_fits_backend_limit() {
        let placeholder = placeholder_for(&"A".repeat(4000));
        assert!(placeholder.len() + LONGNAME_SUFFIX.len() <= DEFAULT_LONG_NAME_MAX);
        assert!(is_long(&"A".repeat(256), DEFAULT_LONG_NAME_MAX));
        assert!(!is_long(&"A".repeat(255), DEFAULT_LONG_NAME_MAX));
    }

    #[test]
    fn side_file_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let fd = open(
            tmp.path(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .unwrap();
        let encrypted = "B".repeat(300);
        let placeholder = placeholder_for(&encrypted);

        put(fd.as_fd(), &placeholder, &encrypted, OsStr::new("plain")).unwrap();
        assert_eq!(get(fd.as_fd(), OsStr::new(&placeholder)).unwrap(), encrypted);

        delete(fd.as_fd(), &placeholder);
        assert!(matches!(
            get(fd.as_fd(), OsStr::new(&placeholder)),
            Err(FsError::Corrupt { .. })
        ));
        // Deleting twice only logs.
        delete(fd.as_fd(), &placeholder);
    }

    #[test]
    fn mismatched_side_file_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let placeholder = placeholder_for(&"C".repeat(300));
        fs::write(
            tmp.path().join(format!("{placeholder}{LONGNAME_SUFFIX}")),
            "D".repeat(300),
        )
        .unwrap();
        let fd = open(
            tmp.path(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .unwrap();
        assert!(matches!(
            get(fd.as_fd(), OsStr::new(&placeholder)),
            Err(FsError::Corrupt { .. })
        ));
    }
}
