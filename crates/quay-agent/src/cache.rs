//! Bounded local model cache
//!
//! At most `capacity` model versions are resident on the inference server at
//! once. A miss on a full cache evicts the least recently used entry that is
//! not currently serving a request, then loads the requested model.
//!
//! Check, evict and load run as one critical section per server so two
//! concurrent misses can never pick the same victim or overshoot capacity.
//! The critical section runs in its own task: if the request that triggered
//! a load goes away, the load still completes and is registered.

use crate::backend::BackendClient;
use crate::error::{CacheError, CacheResult};
use crate::registry::ModelRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct CacheEntry {
    last_access: Instant,
    /// Logical access clock; strictly increasing, so it orders accesses
    /// even when two `Instant`s compare equal
    access_tick: u64,
    inserted: u64,
    in_flight: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lease(&mut self, backend_name: &str) -> Option<CacheLease> {
        let tick = self.tick();
        let entry = self.entries.get_mut(backend_name)?;
        entry.last_access = Instant::now();
        entry.access_tick = tick;
        Some(CacheLease::new(backend_name, &entry.in_flight))
    }

    fn insert(&mut self, backend_name: &str) -> CacheLease {
        let tick = self.tick();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let lease = CacheLease::new(backend_name, &in_flight);
        self.entries.insert(
            backend_name.to_string(),
            CacheEntry {
                last_access: Instant::now(),
                access_tick: tick,
                inserted: tick,
                in_flight,
            },
        );
        lease
    }

    /// Least recently used entry with no request in flight
    fn lru_victim(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.in_flight.load(Ordering::Acquire) == 0)
            .min_by_key(|(_, e)| (e.last_access, e.access_tick, e.inserted))
            .map(|(name, _)| name.clone())
    }
}

/// A resident model pinned against eviction while held
#[derive(Debug)]
pub struct CacheLease {
    backend_name: String,
    in_flight: Arc<AtomicUsize>,
}

impl CacheLease {
    fn new(backend_name: &str, in_flight: &Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            backend_name: backend_name.to_string(),
            in_flight: Arc::clone(in_flight),
        }
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of one resident model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentModel {
    pub backend_name: String,
    pub idle: Duration,
    pub in_flight: usize,
}

struct CacheInner {
    backend: Arc<dyn BackendClient>,
    registry: Arc<ModelRegistry>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl CacheInner {
    async fn ensure_resident(&self, backend_name: &str) -> CacheResult<CacheLease> {
        let mut state = self.state.lock().await;
        if let Some(lease) = state.lease(backend_name) {
            return Ok(lease);
        }

        if state.entries.len() >= self.capacity {
            let victim = state.lru_victim().ok_or(CacheError::CapacityExhausted {
                capacity: self.capacity,
            })?;
            info!(evict = %victim, load = backend_name, "Evicting least recently used model");
            self.backend
                .unload(&victim)
                .await
                .map_err(|source| CacheError::Unload {
                    model: victim.clone(),
                    source,
                })?;
            state.entries.remove(&victim);
        }

        self.backend
            .load(backend_name)
            .await
            .map_err(|source| CacheError::Load {
                model: backend_name.to_string(),
                source,
            })?;
        debug!(model = backend_name, resident = state.entries.len() + 1, "Model loaded");
        Ok(state.insert(backend_name))
    }

    async fn remove(&self, backend_name: &str) -> CacheResult<bool> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get(backend_name) else {
            return Ok(false);
        };
        let in_flight = entry.in_flight.load(Ordering::Acquire);
        if in_flight > 0 {
            warn!(model = backend_name, in_flight, "Unloading model with requests in flight");
        }
        self.backend
            .unload(backend_name)
            .await
            .map_err(|source| CacheError::Unload {
                model: backend_name.to_string(),
                source,
            })?;
        state.entries.remove(backend_name);
        Ok(true)
    }
}

/// Per-server model cache; cheap to clone
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        registry: Arc<ModelRegistry>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                registry,
                capacity,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    /// Resolve a logical model name to its backend name, loading it on a miss
    pub async fn get(&self, model_name: &str) -> CacheResult<String> {
        let lease = self.acquire(model_name).await?;
        Ok(lease.backend_name().to_string())
    }

    /// Like [`get`](Self::get), but keeps the model pinned until the
    /// returned lease is dropped
    pub async fn acquire(&self, model_name: &str) -> CacheResult<CacheLease> {
        let registered = self
            .inner
            .registry
            .resolve(model_name)
            .ok_or_else(|| CacheError::NotRegistered(model_name.to_string()))?;
        self.run_resident(registered.backend_name).await
    }

    /// Make `backend_name` resident, evicting if needed
    pub async fn load(&self, backend_name: &str) -> CacheResult<()> {
        self.run_resident(backend_name.to_string()).await.map(|_| ())
    }

    /// Unload `backend_name`; `Ok(false)` if it was not resident
    pub async fn unload(&self, backend_name: &str) -> CacheResult<bool> {
        let inner = Arc::clone(&self.inner);
        let name = backend_name.to_string();
        tokio::spawn(async move { inner.remove(&name).await })
            .await
            .map_err(|e| CacheError::Aborted(e.to_string()))?
    }

    pub async fn contains(&self, backend_name: &str) -> bool {
        self.inner.state.lock().await.entries.contains_key(backend_name)
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    /// Resident models, most recently used first
    pub async fn resident(&self) -> Vec<ResidentModel> {
        let state = self.inner.state.lock().await;
        let mut entries: Vec<_> = state.entries.iter().collect();
        entries.sort_by_key(|(_, e)| std::cmp::Reverse(e.access_tick));
        entries
            .into_iter()
            .map(|(name, e)| ResidentModel {
                backend_name: name.clone(),
                idle: e.last_access.elapsed(),
                in_flight: e.in_flight.load(Ordering::Acquire),
            })
            .collect()
    }

    async fn run_resident(&self, backend_name: String) -> CacheResult<CacheLease> {
        let inner = Arc::clone(&self.inner);
        // A dropped caller drops only the JoinHandle; the lease returned by
        // an orphaned task is dropped with the task output
        tokio::spawn(async move { inner.ensure_resident(&backend_name).await })
            .await
            .map_err(|e| CacheError::Aborted(e.to_string()))?
    }
}
