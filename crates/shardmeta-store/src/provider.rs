//! Access to the global store and the per-shard local stores.

use crate::store::{MetaStore, MetaStoreError, MetaStoreResult, StoreRead};
use parking_lot::{Mutex, RwLock};
use shardmeta_common::ShardLocation;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolves the stores a manager talks to
pub trait StoreProvider: Send + Sync {
    /// The global shard map store
    fn global(&self) -> MetaStoreResult<Arc<MetaStore>>;

    /// The local store living next to the shard at `location`
    fn local(&self, location: &ShardLocation) -> MetaStoreResult<Arc<MetaStore>>;

    /// Locations that currently have a local store
    fn local_locations(&self) -> MetaStoreResult<Vec<ShardLocation>>;
}

/// Stores kept as redb files under one data directory:
/// `global.redb` and `local/<location>.redb`
pub struct DiskStoreProvider {
    data_dir: PathBuf,
    global: Mutex<Option<Arc<MetaStore>>>,
    locals: Mutex<HashMap<ShardLocation, Arc<MetaStore>>>,
}

impl DiskStoreProvider {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            global: Mutex::new(None),
            locals: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn local_dir(&self) -> PathBuf {
        self.data_dir.join("local")
    }

    fn local_path(&self, location: &ShardLocation) -> PathBuf {
        self.local_dir().join(format!("{}.redb", location.file_stem()))
    }
}

impl StoreProvider for DiskStoreProvider {
    fn global(&self) -> MetaStoreResult<Arc<MetaStore>> {
        let mut global = self.global.lock();
        if let Some(store) = global.as_ref() {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(MetaStore::open(self.data_dir.join("global.redb"))?);
        *global = Some(Arc::clone(&store));
        Ok(store)
    }

    fn local(&self, location: &ShardLocation) -> MetaStoreResult<Arc<MetaStore>> {
        let mut locals = self.locals.lock();
        if let Some(store) = locals.get(location) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(MetaStore::open(self.local_path(location))?);
        debug!("Opened local store for {}", location);
        locals.insert(location.clone(), Arc::clone(&store));
        Ok(store)
    }

    fn local_locations(&self) -> MetaStoreResult<Vec<ShardLocation>> {
        let dir = self.local_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut locations = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "redb") {
                continue;
            }
            let open = {
                let locals = self.locals.lock();
                locals
                    .values()
                    .find(|s| Path::new(s.label()) == path)
                    .map(Arc::clone)
            };
            let store = match open {
                Some(store) => store,
                None => Arc::new(MetaStore::open(&path)?),
            };
            let location: Option<ShardLocation> =
                store.read(|s| -> MetaStoreResult<_> { s.store_location() })?;
            match location {
                Some(location) => {
                    self.locals.lock().entry(location.clone()).or_insert(store);
                    locations.push(location);
                }
                None => warn!("Skipping local store without identity: {}", path.display()),
            }
        }
        locations.sort();
        Ok(locations)
    }
}

/// Stores held entirely in memory.
///
/// Any store can be marked unavailable, in which case opening it fails
/// with a transient error until it is marked available again.
#[derive(Default)]
pub struct MemoryStoreProvider {
    global: Mutex<Option<Arc<MetaStore>>>,
    locals: Mutex<HashMap<ShardLocation, Arc<MetaStore>>>,
    global_unavailable: RwLock<bool>,
    unavailable: RwLock<HashSet<ShardLocation>>,
}

impl MemoryStoreProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global_available(&self, available: bool) {
        *self.global_unavailable.write() = !available;
    }

    pub fn set_local_available(&self, location: &ShardLocation, available: bool) {
        let mut unavailable = self.unavailable.write();
        if available {
            unavailable.remove(location);
        } else {
            info!("Marking local store {} unavailable", location);
            unavailable.insert(location.clone());
        }
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn global(&self) -> MetaStoreResult<Arc<MetaStore>> {
        if *self.global_unavailable.read() {
            return Err(MetaStoreError::Unavailable("global".into()));
        }
        let mut global = self.global.lock();
        if let Some(store) = global.as_ref() {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(MetaStore::in_memory("global")?);
        *global = Some(Arc::clone(&store));
        Ok(store)
    }

    fn local(&self, location: &ShardLocation) -> MetaStoreResult<Arc<MetaStore>> {
        if self.unavailable.read().contains(location) {
            return Err(MetaStoreError::Unavailable(location.to_string()));
        }
        let mut locals = self.locals.lock();
        if let Some(store) = locals.get(location) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(MetaStore::in_memory(location.to_string())?);
        locals.insert(location.clone(), Arc::clone(&store));
        Ok(store)
    }

    fn local_locations(&self) -> MetaStoreResult<Vec<ShardLocation>> {
        let mut locations: Vec<_> = self.locals.lock().keys().cloned().collect();
        locations.sort();
        Ok(locations)
    }
}
