// deployer/src/lib.rs
pub mod deployment;
pub mod driver;
pub mod registry;
pub mod steps;
pub mod watch;

pub use deployment::{
    Deployment, DeploymentId, DeploymentStatus, DeploymentSummary, StatusEvent, StepEvent, StepStatus,
};
pub use registry::{DeploymentEntry, DeploymentRegistry};

use common::{Backend, BundleSpec, Credentials, DeployerError};
use futures::Stream;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// Imports bundles into the environment, one background driver per
/// deployment, each on its own backend session.
#[derive(Clone)]
pub struct Deployer {
    backend: Arc<dyn Backend>,
    registry: Arc<DeploymentRegistry>,
}

impl Deployer {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            registry: Arc::new(DeploymentRegistry::new()),
        }
    }

    /// Parse and check a bundle without deploying it.
    pub fn validate(&self, content: &str, name: Option<&str>) -> Result<BundleSpec, DeployerError> {
        Ok(BundleSpec::parse(content, name)?)
    }

    /// Validate the bundle and start deploying it on behalf of `owner`.
    ///
    /// Validation errors are returned before any deployment state exists.
    pub fn deploy(
        &self,
        owner: Uuid,
        credentials: Credentials,
        content: &str,
        name: Option<&str>,
    ) -> Result<DeploymentHandle, DeployerError> {
        let bundle = self.validate(content, name)?;
        let entry = self.registry.insert(owner, bundle, name.map(str::to_string));
        info!(deployment = entry.id(), backend = %self.backend.describe(), "starting deployment");

        let driver = tokio::spawn(driver::run(entry.clone(), self.backend.clone(), credentials));
        let supervised = entry.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = driver.await {
                if e.is_panic() {
                    error!(deployment = supervised.id(), "deployment driver panicked");
                    supervised.update(|d| d.finish(Some("internal error while deploying".into())));
                }
            }
        });

        Ok(DeploymentHandle { entry, task })
    }

    /// Status events of a deployment started by `owner`.
    pub fn watch(
        &self,
        owner: Uuid,
        id: DeploymentId,
    ) -> Result<impl Stream<Item = StatusEvent> + Send + 'static, DeployerError> {
        Ok(watch::events(self.owned(owner, id)?))
    }

    /// Cancel a deployment started by `owner`. Cancelling a terminal
    /// deployment is a no-op.
    pub fn cancel(&self, owner: Uuid, id: DeploymentId) -> Result<DeploymentStatus, DeployerError> {
        let entry = self.owned(owner, id)?;
        entry.cancel();
        Ok(entry.read(|d| d.status))
    }

    // Other connections' deployments are reported as missing.
    fn owned(&self, owner: Uuid, id: DeploymentId) -> Result<Arc<DeploymentEntry>, DeployerError> {
        self.registry
            .get(id)
            .filter(|entry| entry.owner() == owner)
            .ok_or(DeployerError::NotFound(id))
    }

    /// Summaries of the deployments started by `owner`, oldest first.
    /// Terminal deployments are forgotten once reported.
    pub fn status(&self, owner: Uuid) -> Vec<DeploymentSummary> {
        self.registry
            .owned_by(owner)
            .into_iter()
            .map(|entry| {
                let summary = entry.read(Deployment::summary);
                if summary.status.is_terminal() {
                    self.registry.remove(entry.id());
                }
                summary
            })
            .collect()
    }

    /// Cancel and drop everything a closed connection started.
    pub fn release(&self, owner: Uuid) -> usize {
        self.registry.release_owner(owner)
    }

    pub fn registry(&self) -> &DeploymentRegistry {
        &self.registry
    }
}

/// A started deployment.
pub struct DeploymentHandle {
    entry: Arc<DeploymentEntry>,
    task: JoinHandle<()>,
}

impl DeploymentHandle {
    pub fn id(&self) -> DeploymentId {
        self.entry.id()
    }

    pub fn status(&self) -> DeploymentStatus {
        self.entry.read(|d| d.status)
    }

    pub fn snapshot(&self) -> Deployment {
        self.entry.snapshot()
    }

    pub fn watch(&self) -> impl Stream<Item = StatusEvent> + Send + 'static {
        watch::events(self.entry.clone())
    }

    pub fn cancel(&self) -> bool {
        self.entry.cancel()
    }

    /// Wait for the driver to stop, including any steps drained after a
    /// cancellation.
    pub async fn finished(self) -> Deployment {
        let _ = self.task.await;
        self.entry.snapshot()
    }
}
