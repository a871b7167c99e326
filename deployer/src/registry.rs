// deployer/src/registry.rs
use crate::deployment::{Deployment, DeploymentId};
use common::BundleSpec;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use uuid::Uuid;

/// A deployment plus the signals attached to it.
///
/// State sits behind a per-deployment lock: reads are concurrent, updates
/// are serialized for this deployment only.
pub struct DeploymentEntry {
    id: DeploymentId,
    owner: Uuid,
    state: RwLock<Deployment>,
    // Number of events recorded so far; watchers wait on it.
    events: watch::Sender<usize>,
    cancel: watch::Sender<bool>,
}

impl DeploymentEntry {
    fn new(deployment: Deployment) -> Self {
        let (events, _) = watch::channel(deployment.events.len());
        let (cancel, _) = watch::channel(false);
        Self {
            id: deployment.id,
            owner: deployment.owner,
            state: RwLock::new(deployment),
            events,
            cancel,
        }
    }

    pub fn id(&self) -> DeploymentId {
        self.id
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn read<R>(&self, f: impl FnOnce(&Deployment) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    /// Mutate the deployment and wake watchers if events were recorded.
    pub fn update<R>(&self, f: impl FnOnce(&mut Deployment) -> R) -> R {
        let (result, event_count) = {
            let mut guard = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let result = f(&mut guard);
            (result, guard.events.len())
        };
        self.events.send_if_modified(|count| {
            let changed = *count != event_count;
            *count = event_count;
            changed
        });
        result
    }

    pub fn snapshot(&self) -> Deployment {
        self.read(Deployment::clone)
    }

    /// Mark the deployment cancelled and tell its driver to stop starting
    /// steps. Returns false when it had already terminated.
    pub fn cancel(&self) -> bool {
        let cancelled = self.update(Deployment::cancel);
        if cancelled {
            self.cancel.send_replace(true);
        }
        cancelled
    }

    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub(crate) fn event_signal(&self) -> watch::Receiver<usize> {
        self.events.subscribe()
    }
}

/// Process-wide registry of live deployments.
#[derive(Default)]
pub struct DeploymentRegistry {
    entries: DashMap<DeploymentId, Arc<DeploymentEntry>>,
    next_id: AtomicU64,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, owner: Uuid, bundle: BundleSpec, name: Option<String>) -> Arc<DeploymentEntry> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(DeploymentEntry::new(Deployment::new(id, owner, bundle, name)));
        self.entries.insert(id, entry.clone());
        tracing::info!("Registered deployment {} for connection {}", id, owner);
        entry
    }

    pub fn get(&self, id: DeploymentId) -> Option<Arc<DeploymentEntry>> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    /// Deployments started by one connection, oldest first.
    pub fn owned_by(&self, owner: Uuid) -> Vec<Arc<DeploymentEntry>> {
        let mut owned: Vec<Arc<DeploymentEntry>> = self
            .entries
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .map(|entry| entry.value().clone())
            .collect();
        owned.sort_by_key(|entry| entry.id);
        owned
    }

    pub fn remove(&self, id: DeploymentId) -> Option<Arc<DeploymentEntry>> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    /// Cancel and drop every deployment of a closed connection.
    pub fn release_owner(&self, owner: Uuid) -> usize {
        let owned = self.owned_by(owner);
        for entry in &owned {
            if entry.cancel() {
                tracing::info!("Cancelled deployment {} of closed connection {}", entry.id, owner);
            }
            self.entries.remove(&entry.id);
        }
        owned.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
