use crate::config::{Config, FeatureFlags};
use crate::nametransform::NameTransform;
use crate::pathmap::DirFdCache;
use parking_lot::{Mutex, MutexGuard};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Identity of the process on whose behalf an entry is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    #[cfg(test)]
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// State shared by every request against one mounted backend.
#[derive(Debug)]
pub struct CryptCore {
    pub(crate) config: Config,
    pub(crate) names: NameTransform,
    pub(crate) dir_cache: DirFdCache,
    /// Held across the windows in which a directory exists without an IV.
    dir_iv_lock: Mutex<()>,
    mitigated: AtomicU64,
}

impl CryptCore {
    pub fn new(config: Config) -> Self {
        let names = NameTransform::new(config.name_key());
        Self {
            config,
            names,
            dir_cache: DirFdCache::new(),
            dir_iv_lock: Mutex::new(()),
            mitigated: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flags(&self) -> FeatureFlags {
        self.config.flags
    }

    pub(crate) fn lock_dir_iv(&self) -> MutexGuard<'_, ()> {
        self.dir_iv_lock.lock()
    }

    pub(crate) fn report_mitigated_corruption(
        &self,
        dir: &OsStr,
        entry: &OsStr,
        err: &crate::error::FsError,
    ) {
        self.mitigated.fetch_add(1, Ordering::Relaxed);
        warn!(
            dir = %dir.to_string_lossy(),
            entry = %entry.to_string_lossy(),
            error = %err,
            "skipping corrupt directory entry"
        );
    }

    /// Entries dropped from listings since mount because they failed to decode.
    pub fn mitigated_corruptions(&self) -> u64 {
        self.mitigated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) fn test_core_with(
    init: crate::config::InitOptions,
    mount: crate::config::MountOptions,
) -> (tempfile::TempDir, CryptCore) {
    let tmp = tempfile::tempdir().unwrap();
    crate::config::init_backend(tmp.path().to_path_buf(), &init).unwrap();
    let config = Config::open_backend(tmp.path().to_path_buf(), mount).unwrap();
    (tmp, CryptCore::new(config))
}

#[cfg(test)]
pub(crate) fn test_core(init: crate::config::InitOptions) -> (tempfile::TempDir, CryptCore) {
    test_core_with(init, crate::config::MountOptions::default())
}
