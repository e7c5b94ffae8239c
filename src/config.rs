use crate::diriv;
use crate::error::{FsError, FsResult};
use crate::longname::DEFAULT_LONG_NAME_MAX;
use crate::nametransform::NAME_KEY_LEN;
use crate::util::{fsync_dir, read_raw_entries, read_small_file, write_file_exclusive};
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, OsStr, OsString};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroizing;

pub const CONF_NAME: &str = "cryptnamefs.conf";
const CONF_NAME_CSTR: &CStr = c"cryptnamefs.conf";
const CONF_VERSION: u16 = 1;
const CONF_PERMS: u32 = 0o400;
const CONF_MAX_BYTES: usize = 64 * 1024;
pub const MIN_LONG_NAME_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureFlag {
    PlaintextNames,
    LongNames,
}

/// On-disk layout of `cryptnamefs.conf`. The key is stored unwrapped; password
/// based wrapping belongs to a key provider this crate does not ship.
#[derive(Debug, Serialize, Deserialize)]
struct ConfFile {
    version: u16,
    feature_flags: Vec<FeatureFlag>,
    long_name_max: usize,
    master_key: String,
}

/// Mode switches checked at the top of every directory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    pub plaintext_names: bool,
    pub long_names: bool,
    pub long_name_max: usize,
    pub preserve_owner: bool,
    pub remove_stray_files: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            plaintext_names: false,
            long_names: true,
            long_name_max: DEFAULT_LONG_NAME_MAX,
            preserve_owner: false,
            remove_stray_files: cfg!(target_os = "macos"),
        }
    }
}

/// Logical paths that callers may not create or open.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    denied: Vec<OsString>,
}

fn normalize_logical(path: &OsStr) -> OsString {
    let trimmed: Vec<&[u8]> = path
        .as_bytes()
        .split(|b| *b == b'/')
        .filter(|seg| !seg.is_empty())
        .collect();
    let mut out = Vec::with_capacity(path.len() + 1);
    for seg in trimmed {
        out.push(b'/');
        out.extend_from_slice(seg);
    }
    if out.is_empty() {
        out.push(b'/');
    }
    OsStr::from_bytes(&out).to_owned()
}

impl PathFilter {
    pub fn new(plaintext_names: bool, deny: &[PathBuf]) -> Self {
        let mut denied: Vec<OsString> = deny
            .iter()
            .map(|p| normalize_logical(p.as_os_str()))
            .filter(|p| p != "/")
            .collect();
        if plaintext_names {
            // Without name encryption the config file shows up under its own
            // name and must not be reachable through the mount.
            denied.push(OsString::from(format!("/{CONF_NAME}")));
        }
        Self { denied }
    }

    pub fn is_filtered(&self, path: &OsStr) -> bool {
        let path = normalize_logical(path);
        let raw = path.as_bytes();
        self.denied.iter().any(|deny| {
            let deny = deny.as_bytes();
            raw == deny || (raw.starts_with(deny) && raw.get(deny.len()) == Some(&b'/'))
        })
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub plaintext_names: bool,
    pub long_names: bool,
    pub long_name_max: usize,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            plaintext_names: false,
            long_names: true,
            long_name_max: DEFAULT_LONG_NAME_MAX,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub preserve_owner: bool,
    pub remove_stray_files: Option<bool>,
    pub deny: Vec<PathBuf>,
    pub sync_data: bool,
}

#[derive(Debug)]
pub struct Config {
    pub backend_path: PathBuf,
    pub backend_fd: OwnedFd,
    pub flags: FeatureFlags,
    pub filter: PathFilter,
    pub sync_data: bool,
    name_key: Zeroizing<[u8; NAME_KEY_LEN]>,
}

fn open_backend_dir(path: &Path) -> FsResult<OwnedFd> {
    let fd = open(
        path,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY,
        Mode::empty(),
    )?;
    Ok(fd)
}

fn check_long_name_max(value: usize) -> FsResult<()> {
    if !(MIN_LONG_NAME_MAX..=DEFAULT_LONG_NAME_MAX).contains(&value) {
        return Err(FsError::corrupt(
            "config",
            format!("long_name_max {value} outside {MIN_LONG_NAME_MAX}..={DEFAULT_LONG_NAME_MAX}"),
        ));
    }
    Ok(())
}

/// Prepares an empty backend directory: config file plus root IV.
pub fn init_backend(path: PathBuf, options: &InitOptions) -> FsResult<()> {
    check_long_name_max(options.long_name_max)?;
    let fd = open_backend_dir(&path)?;
    if !read_raw_entries(fd.as_fd())?.is_empty() {
        return Err(FsError::NotEmpty);
    }

    let mut key = Zeroizing::new([0u8; NAME_KEY_LEN]);
    rand::rng().fill_bytes(&mut key[..]);

    let mut feature_flags = Vec::new();
    if options.plaintext_names {
        feature_flags.push(FeatureFlag::PlaintextNames);
    }
    if options.long_names {
        feature_flags.push(FeatureFlag::LongNames);
    }
    let conf = ConfFile {
        version: CONF_VERSION,
        feature_flags,
        long_name_max: options.long_name_max,
        master_key: hex::encode(&key[..]),
    };
    let encoded = Zeroizing::new(
        serde_json::to_vec_pretty(&conf)
            .map_err(|e| FsError::corrupt("config", e.to_string()))?,
    );
    write_file_exclusive(
        fd.as_fd(),
        CONF_NAME_CSTR,
        &encoded,
        Mode::from_bits_truncate(CONF_PERMS as _),
    )?;

    if !options.plaintext_names {
        diriv::write_root(fd.as_fd())?;
    }
    fsync_dir(fd.as_fd())?;
    info!(backend = %path.display(), plaintext_names = options.plaintext_names, "initialized backend");
    Ok(())
}

fn parse_conf(data: &[u8]) -> FsResult<(ConfFile, Zeroizing<[u8; NAME_KEY_LEN]>)> {
    if data.len() > CONF_MAX_BYTES {
        return Err(FsError::corrupt("config", "file too large"));
    }
    let conf: ConfFile =
        serde_json::from_slice(data).map_err(|e| FsError::corrupt("config", e.to_string()))?;
    if conf.version != CONF_VERSION {
        return Err(FsError::corrupt(
            "config",
            format!("unsupported version {}", conf.version),
        ));
    }
    check_long_name_max(conf.long_name_max)?;

    let raw = Zeroizing::new(
        hex::decode(&conf.master_key).map_err(|e| FsError::corrupt("config", e.to_string()))?,
    );
    if raw.len() != NAME_KEY_LEN {
        return Err(FsError::corrupt("config", "master key has wrong length"));
    }
    let mut key = Zeroizing::new([0u8; NAME_KEY_LEN]);
    key.copy_from_slice(&raw);
    Ok((conf, key))
}

impl Config {
    pub fn open_backend(path: PathBuf, options: MountOptions) -> FsResult<Self> {
        let fd = open_backend_dir(&path)?;
        let data = read_small_file(fd.as_fd(), CONF_NAME_CSTR, CONF_MAX_BYTES).map_err(
            |err| match err {
                FsError::NotFound => FsError::corrupt("config", format!("{CONF_NAME} missing")),
                other => other,
            },
        )?;
        let (conf, name_key) = parse_conf(&data)?;

        let plaintext_names = conf.feature_flags.contains(&FeatureFlag::PlaintextNames);
        let defaults = FeatureFlags::default();
        let flags = FeatureFlags {
            plaintext_names,
            long_names: conf.feature_flags.contains(&FeatureFlag::LongNames),
            long_name_max: conf.long_name_max,
            preserve_owner: options.preserve_owner,
            remove_stray_files: options
                .remove_stray_files
                .unwrap_or(defaults.remove_stray_files),
        };

        Ok(Self {
            backend_path: path,
            backend_fd: fd,
            flags,
            filter: PathFilter::new(plaintext_names, &options.deny),
            sync_data: options.sync_data,
            name_key,
        })
    }

    pub fn backend_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.backend_fd.as_fd()
    }

    pub fn sync_data(&self) -> bool {
        self.sync_data
    }

    pub fn name_key(&self) -> Zeroizing<[u8; NAME_KEY_LEN]> {
        self.name_key.clone()
    }
}
