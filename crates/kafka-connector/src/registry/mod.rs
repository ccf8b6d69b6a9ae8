//! Function registry kept in sync with the gateway's function listing.
//!
//! The registry holds an immutable [`RegistrySnapshot`] behind a lock that
//! only guards the pointer. A refresh builds a complete new snapshot and swaps
//! it in, so readers see either the old mapping or the new one, never a mix.

mod gateway;

pub use gateway::GatewayClient;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConnectorResult;

/// A deployed function as seen by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub name: String,
    /// Synchronous invocation URL.
    pub endpoint: String,
    /// Asynchronous (queued) invocation URL.
    pub async_endpoint: String,
    pub annotations: BTreeMap<String, String>,
}

impl FunctionDescriptor {
    /// Builds a descriptor whose endpoints live under `gateway_url`.
    pub fn new(
        name: impl Into<String>,
        gateway_url: &str,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        let name = name.into();
        let base = gateway_url.trim_end_matches('/');
        Self {
            endpoint: format!("{base}/function/{name}"),
            async_endpoint: format!("{base}/async-function/{name}"),
            name,
            annotations,
        }
    }

    /// Returns the annotation stored under `key`, ignoring empty values.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Point-in-time view of all known functions.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    version: u64,
    functions: HashMap<String, Arc<FunctionDescriptor>>,
}

impl RegistrySnapshot {
    fn build(version: u64, descriptors: Vec<FunctionDescriptor>) -> Self {
        let functions = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect();
        Self { version, functions }
    }

    /// Monotonic version, bumped on every install. The empty initial
    /// snapshot is version 0.
    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionDescriptor>> {
        self.functions.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Iterates over all descriptors in unspecified order.
    pub fn functions(&self) -> impl Iterator<Item = &Arc<FunctionDescriptor>> {
        self.functions.values()
    }

    /// Function names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether two snapshots hold the same name-to-descriptor mapping,
    /// regardless of version.
    pub fn same_functions(&self, other: &Self) -> bool {
        self.functions.len() == other.functions.len()
            && self
                .functions
                .iter()
                .all(|(name, d)| other.functions.get(name).is_some_and(|o| o == d))
    }
}

/// Source of function descriptors.
#[async_trait]
pub trait FunctionLister: Send + Sync + std::fmt::Debug {
    async fn list_functions(&self) -> ConnectorResult<Vec<FunctionDescriptor>>;
}

/// Shared, atomically swapped function registry.
#[derive(Debug)]
pub struct FunctionRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    next_version: AtomicU64,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    /// Creates a registry holding an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
            next_version: AtomicU64::new(1),
        }
    }

    /// Returns the current snapshot. The snapshot stays valid and unchanged
    /// for as long as the caller holds it.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the current snapshot with one built from `descriptors`.
    pub fn install(&self, descriptors: Vec<FunctionDescriptor>) -> Arc<RegistrySnapshot> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let snapshot = Arc::new(RegistrySnapshot::build(version, descriptors));
        *self.current.write() = Arc::clone(&snapshot);
        snapshot
    }

    /// Fetches the listing and installs it. On failure the previous snapshot
    /// is left in place.
    pub async fn refresh(
        &self,
        lister: &dyn FunctionLister,
    ) -> ConnectorResult<Arc<RegistrySnapshot>> {
        let descriptors = lister.list_functions().await?;
        let previous = self.snapshot();
        let snapshot = self.install(descriptors);

        if snapshot.same_functions(&previous) {
            debug!(
                version = snapshot.version(),
                functions = snapshot.len(),
                "Function registry refreshed (unchanged)"
            );
        } else {
            info!(
                version = snapshot.version(),
                functions = ?snapshot.names(),
                "Function registry updated"
            );
        }
        Ok(snapshot)
    }
}

/// Spawns the periodic refresh task. The first refresh happens one
/// `interval` after the call.
pub fn spawn_sync(
    registry: Arc<FunctionRegistry>,
    lister: Arc<dyn FunctionLister>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = registry.refresh(lister.as_ref()).await {
                warn!(
                    error = %e,
                    error_type = e.error_type(),
                    version = registry.snapshot().version(),
                    "Error when fetching functions, keeping previous registry"
                );
            }
        }

        debug!("Function registry sync stopped");
    })
}
