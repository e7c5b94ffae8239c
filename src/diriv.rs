use crate::error::{FsError, FsResult};
use crate::util::{fsync_dir, read_small_file, write_file_exclusive};
use nix::fcntl::renameat;
use nix::sys::stat::Mode;
use rand::RngCore;
use std::ffi::CStr;
use std::os::fd::BorrowedFd;

pub const DIRIV_LEN: usize = 16;
pub const DIRIV_NAME: &str = "cryptnamefs.diriv";
pub const DIRIV_NAME_CSTR: &CStr = c"cryptnamefs.diriv";
/// Prefix of IV files parked in the parent while their directory is removed.
pub const RMDIR_TEMP_PREFIX: &str = "cryptnamefs.diriv.rmdir.";
const DIRIV_PERMS: u32 = 0o400;

/// Per-directory salt for name encryption.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DirIv([u8; DIRIV_LEN]);

impl std::fmt::Debug for DirIv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DirIv({})", hex::encode(self.0))
    }
}

impl DirIv {
    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; DIRIV_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; DIRIV_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Creates the IV file inside `dir`. The caller must hold the instance's
/// dir-IV lock: until this returns the directory has no IV.
pub fn write(dir: BorrowedFd<'_>) -> FsResult<DirIv> {
    let iv = DirIv::generate();
    write_file_exclusive(
        dir,
        DIRIV_NAME_CSTR,
        iv.as_bytes(),
        Mode::from_bits_truncate(DIRIV_PERMS as _),
    )?;
    Ok(iv)
}

pub fn read(dir: BorrowedFd<'_>) -> FsResult<DirIv> {
    let data = read_small_file(dir, DIRIV_NAME_CSTR, DIRIV_LEN).map_err(|err| match err {
        FsError::NotFound => FsError::corrupt("diriv", "missing"),
        other => other,
    })?;
    if data.len() != DIRIV_LEN {
        return Err(FsError::corrupt(
            "diriv",
            format!("wrong length {}", data.len()),
        ));
    }
    let mut bytes = [0u8; DIRIV_LEN];
    bytes.copy_from_slice(&data);
    if bytes.iter().all(|b| *b == 0) {
        return Err(FsError::corrupt("diriv", "all zero"));
    }
    Ok(DirIv(bytes))
}

/// Moves an IV file between two directories by name. Removal uses it to
/// park the IV in the parent and to put it back on rollback.
pub fn relocate(
    from_dir: BorrowedFd<'_>,
    from_name: &CStr,
    to_dir: BorrowedFd<'_>,
    to_name: &CStr,
) -> FsResult<()> {
    renameat(from_dir, from_name, to_dir, to_name)?;
    Ok(())
}

pub fn rmdir_temp_name() -> String {
    format!("{RMDIR_TEMP_PREFIX}{}", rand::random::<u64>())
}

/// Writes the IV of the backend root during `init`.
pub fn write_root(root: BorrowedFd<'_>) -> FsResult<DirIv> {
    let iv = write(root)?;
    fsync_dir(root)?;
    Ok(iv)
}
