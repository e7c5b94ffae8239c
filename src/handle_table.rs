use parking_lot::RwLock;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Open backend files keyed by FUSE file handle. Directory handles carry no
/// state: every listing re-reads the backend.
#[derive(Debug)]
pub struct HandleTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Arc<OwnedFd>>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            // 0 is the handle handed out by opendir.
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fd: OwnedFd) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(id, Arc::new(fd));
        id
    }

    pub fn get(&self, id: u64) -> Option<Arc<OwnedFd>> {
        self.entries.read().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<OwnedFd>> {
        self.entries.write().remove(&id)
    }
}
