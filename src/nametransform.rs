//! Encryption of single path components.
//!
//! Names are sealed with AES-SIV using the owning directory's IV as
//! associated data, so a ciphertext moved into another directory no longer
//! authenticates. The result is base64url without padding, which keeps it
//! free of `/` and NUL.

use crate::diriv::DirIv;
use crate::error::{FsError, FsResult};
use aes_siv::siv::Aes256Siv;
use aes_siv::KeyInit;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use zeroize::Zeroizing;

pub const NAME_KEY_LEN: usize = 64;

pub struct NameTransform {
    key: Zeroizing<[u8; NAME_KEY_LEN]>,
}

impl std::fmt::Debug for NameTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameTransform").finish_non_exhaustive()
    }
}

fn validate_plain_name(raw: &[u8]) -> FsResult<()> {
    if raw.is_empty() || raw == b"." || raw == b".." {
        return Err(FsError::InvalidName);
    }
    if raw.iter().any(|b| *b == b'/' || *b == 0) {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

impl NameTransform {
    pub fn new(key: Zeroizing<[u8; NAME_KEY_LEN]>) -> Self {
        Self { key }
    }

    fn cipher(&self) -> FsResult<Aes256Siv> {
        Aes256Siv::new_from_slice(&self.key[..])
            .map_err(|_| FsError::corrupt("name key", "invalid key length"))
    }

    pub fn encrypt_name(&self, plain: &OsStr, iv: &DirIv) -> FsResult<String> {
        let raw = plain.as_bytes();
        validate_plain_name(raw)?;

        let associated_data: &[&[u8]] = &[iv.as_bytes()];
        let sealed = self
            .cipher()?
            .encrypt(associated_data, raw)
            .map_err(|_| FsError::corrupt("name", "encryption failed"))?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn decrypt_name(&self, encrypted: &str, iv: &DirIv) -> FsResult<OsString> {
        let sealed = URL_SAFE_NO_PAD
            .decode(encrypted.as_bytes())
            .map_err(|e| FsError::corrupt("name", format!("bad base64: {e}")))?;

        let associated_data: &[&[u8]] = &[iv.as_bytes()];
        let raw = self
            .cipher()?
            .decrypt(associated_data, &sealed)
            .map_err(|_| FsError::corrupt("name", "authentication failed"))?;

        // A valid tag over a name we would never have produced still counts
        // as a hostile entry.
        validate_plain_name(&raw)
            .map_err(|_| FsError::corrupt("name", "decrypted to a forbidden name"))?;
        Ok(OsString::from_vec(raw))
    }
}

#[cfg(test)]
pub(crate) fn test_transform() -> NameTransform {
    let mut key = Zeroizing::new([0u8; NAME_KEY_LEN]);
    for (i, b) in key.iter_mut().enumerate() {
        *b = i as u8;
    }
    NameTransform::new(key)
}
