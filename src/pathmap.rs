use crate::core::CryptCore;
use crate::diriv::{self, DirIv};
use crate::error::{FsError, FsResult};
use crate::longname::{is_long, placeholder_for};
use crate::util::{open_dir_nofollow, os_to_cstring, string_to_cstring};
use nix::unistd::dup;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ffi::{CString, OsStr, OsString};
use std::ops::Range;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

pub const MAX_NAME_LENGTH: usize = 4096;
const BACKEND_NAME_MAX: usize = 255;
const DIR_FD_CACHE_CAPACITY: usize = 64;

/// Parent directory handle plus the backend name of the last component.
#[derive(Debug)]
pub struct BackingPath {
    pub dir_fd: OwnedFd,
    pub c_name: CString,
    /// Full ciphertext when `c_name` is a long-name placeholder.
    pub long_name: Option<String>,
}

impl BackingPath {
    pub fn is_root(&self) -> bool {
        self.c_name.as_bytes() == b"."
    }

    pub fn placeholder(&self) -> Option<&str> {
        self.long_name.as_ref()?;
        self.c_name.to_str().ok()
    }
}

#[derive(Debug)]
struct CachedDir {
    fd: OwnedFd,
    iv: Option<DirIv>,
}

/// LRU of logical directory prefix → open descriptor and IV.
#[derive(Debug)]
pub struct DirFdCache {
    entries: Mutex<DirFdCacheInner>,
    capacity: usize,
}

impl DirFdCache {
    pub fn new() -> Self {
        Self::with_capacity(DIR_FD_CACHE_CAPACITY)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(DirFdCacheInner::new(capacity)),
            capacity,
        }
    }

    fn get(&self, key: &[u8]) -> Option<(OwnedFd, Option<DirIv>)> {
        self.entries.lock().get(key)
    }

    /// Bumped by every `clear`. A walk snapshots it before opening anything.
    fn generation(&self) -> u64 {
        self.entries.lock().generation
    }

    /// Stores the entry only if no `clear` ran since `generation` was read.
    fn insert(&self, key: Vec<u8>, fd: OwnedFd, iv: Option<DirIv>, generation: u64) {
        let mut inner = self.entries.lock();
        if inner.generation != generation {
            return;
        }
        inner.insert(key, CachedDir { fd, iv }, self.capacity);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for DirFdCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct DirFdCacheInner {
    map: HashMap<Vec<u8>, CachedDir>,
    order: VecDeque<Vec<u8>>,
    generation: u64,
}

impl DirFdCacheInner {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            generation: 0,
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<(OwnedFd, Option<DirIv>)> {
        let cached = self.map.get(key)?;
        let dup_fd = dup(cached.fd.as_fd()).ok()?;
        let iv = cached.iv;
        self.touch(key);
        Some((dup_fd, iv))
    }

    fn touch(&mut self, key: &[u8]) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn insert(&mut self, key: Vec<u8>, entry: CachedDir, capacity: usize) {
        if self.map.contains_key(&key) {
            self.map.insert(key.clone(), entry);
            self.touch(&key);
            return;
        }

        if self.map.len() >= capacity {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            }
        }

        self.order.push_back(key.clone());
        self.map.insert(key, entry);
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
        self.generation = self.generation.wrapping_add(1);
    }
}

#[derive(Debug)]
struct PathSegments {
    buf: Vec<u8>,
    parts: Vec<Range<usize>>,
}

impl PathSegments {
    fn new(path: &OsStr) -> Self {
        let buf = path.as_bytes().to_vec();
        let mut parts = Vec::new();
        let mut start = 0usize;
        for (idx, b) in buf.iter().enumerate() {
            if *b == b'/' {
                if idx > start {
                    parts.push(start..idx);
                }
                start = idx + 1;
            }
        }
        if start < buf.len() {
            parts.push(start..buf.len());
        }

        Self { buf, parts }
    }

    fn len(&self) -> usize {
        self.parts.len()
    }

    fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn get(&self, idx: usize) -> &[u8] {
        &self.buf[self.parts[idx].clone()]
    }
}

impl CryptCore {
    /// Backend name for one plaintext component inside a directory whose IV
    /// is `iv` (`None` in plaintext-names mode).
    pub(crate) fn encode_component(
        &self,
        plain: &[u8],
        iv: Option<&DirIv>,
    ) -> FsResult<(CString, Option<String>)> {
        if plain.len() >= MAX_NAME_LENGTH {
            return Err(FsError::NameTooLong);
        }
        let Some(iv) = iv else {
            return Ok((os_to_cstring(OsStr::from_bytes(plain))?, None));
        };

        let flags = self.flags();
        let encrypted = self.names.encrypt_name(OsStr::from_bytes(plain), iv)?;
        if !is_long(&encrypted, flags.long_name_max) {
            return Ok((string_to_cstring(&encrypted)?, None));
        }
        if !flags.long_names || encrypted.len() > MAX_NAME_LENGTH {
            return Err(FsError::NameTooLong);
        }
        let placeholder = placeholder_for(&encrypted);
        Ok((string_to_cstring(&placeholder)?, Some(encrypted)))
    }

    fn read_iv_for_walk(&self, dir: std::os::fd::BorrowedFd<'_>) -> FsResult<Option<DirIv>> {
        if self.flags().plaintext_names {
            return Ok(None);
        }
        diriv::read(dir).map(Some)
    }

    fn open_backing_dir_with_cache(&self, path: &OsStr, use_cache: bool) -> FsResult<BackingPath> {
        if self.config.filter.is_filtered(path) {
            return Err(FsError::PermissionDenied);
        }

        let parts = PathSegments::new(path);
        if parts.is_empty() {
            return Ok(BackingPath {
                dir_fd: dup(self.config.backend_fd())?,
                c_name: CString::from(c"."),
                long_name: None,
            });
        }

        let generation = self.dir_cache.generation();
        let mut prefix: Vec<u8> = b"/".to_vec();
        let (mut dir_fd, mut dir_iv) = match use_cache.then(|| self.dir_cache.get(&prefix)).flatten()
        {
            Some(hit) => hit,
            None => {
                let fd = dup(self.config.backend_fd())?;
                let iv = self.read_iv_for_walk(fd.as_fd())?;
                if use_cache {
                    self.dir_cache
                        .insert(prefix.clone(), dup(fd.as_fd())?, iv, generation);
                }
                (fd, iv)
            }
        };

        for idx in 0..parts.len() - 1 {
            let seg = parts.get(idx);
            if prefix.len() > 1 {
                prefix.push(b'/');
            }
            prefix.extend_from_slice(seg);

            if use_cache && let Some((fd, iv)) = self.dir_cache.get(&prefix) {
                dir_fd = fd;
                dir_iv = iv;
                continue;
            }

            let (c_name, _) = self.encode_component(seg, dir_iv.as_ref())?;
            let next_fd = open_dir_nofollow(dir_fd.as_fd(), c_name.as_c_str())?;
            let next_iv = self.read_iv_for_walk(next_fd.as_fd())?;

            if use_cache && let Ok(dup_fd) = dup(next_fd.as_fd()) {
                self.dir_cache
                    .insert(prefix.clone(), dup_fd, next_iv, generation);
            }
            dir_fd = next_fd;
            dir_iv = next_iv;
        }

        let last = parts.get(parts.len() - 1);
        let (c_name, long_name) = self.encode_component(last, dir_iv.as_ref())?;
        if long_name.is_none() && c_name.as_bytes().len() > BACKEND_NAME_MAX {
            return Err(FsError::NameTooLong);
        }

        Ok(BackingPath {
            dir_fd,
            c_name,
            long_name,
        })
    }

    /// Resolves `path` to its parent directory descriptor and the backend
    /// name of the final component. Every intermediate directory is opened
    /// with `O_NOFOLLOW | O_DIRECTORY`; no full path ever reaches the kernel.
    pub fn open_backing_dir(&self, path: &OsStr) -> FsResult<BackingPath> {
        match self.open_backing_dir_with_cache(path, true) {
            Ok(v) => Ok(v),
            Err(FsError::NotFound | FsError::NotADirectory) => {
                self.dir_cache.clear();
                self.open_backing_dir_with_cache(path, false)
            }
            Err(err) => Err(err),
        }
    }
}

pub fn make_child_path(parent: &OsStr, name: &OsStr) -> OsString {
    if parent == OsStr::new("/") {
        let mut composed = OsString::from("/");
        composed.push(name);
        composed
    } else {
        let mut composed = OsString::from(parent);
        composed.push(OsStr::new("/"));
        composed.push(name);
        composed
    }
}
