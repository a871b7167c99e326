// sandbox/src/lib.rs
//! In-process stand-in for the cluster-management API, used when no live
//! backend is configured.
pub mod changeset;
pub mod environment;
pub mod responder;

use async_trait::async_trait;
use common::{Backend, BackendLink, ProxyError};
use std::sync::Arc;

pub use environment::SandboxEnvironment;

/// Backend variant answering from a simulated environment.
#[derive(Clone)]
pub struct SandboxBackend {
    env: Arc<SandboxEnvironment>,
}

impl SandboxBackend {
    pub fn new(env: Arc<SandboxEnvironment>) -> Self {
        Self { env }
    }

    pub fn environment(&self) -> &Arc<SandboxEnvironment> {
        &self.env
    }
}

#[async_trait]
impl Backend for SandboxBackend {
    async fn connect(&self) -> Result<BackendLink, ProxyError> {
        let (link, rx, tx) = BackendLink::pair();
        tokio::spawn(responder::run(self.env.clone(), rx, tx));
        tracing::debug!("Opened sandbox backend link");
        Ok(link)
    }

    fn describe(&self) -> String {
        "sandbox".to_string()
    }
}
