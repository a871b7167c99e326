// common/src/backend.rs
use crate::error::ProxyError;
use crate::messages::Frame;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capacity of the frame channels of a backend link.
pub const LINK_CAPACITY: usize = 100;

/// An open, framed channel to the cluster-management API.
///
/// Dropping `tx` closes the backend leg; `rx` yields `None` once the
/// backend is gone.
pub struct BackendLink {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

impl BackendLink {
    /// Build both halves of an in-process link. Returns the link handed to
    /// the gateway and the opposite ends used by whoever plays the backend.
    pub fn pair() -> (Self, mpsc::Receiver<Frame>, mpsc::Sender<Frame>) {
        let (to_backend_tx, to_backend_rx) = mpsc::channel(LINK_CAPACITY);
        let (from_backend_tx, from_backend_rx) = mpsc::channel(LINK_CAPACITY);
        let link = Self {
            tx: to_backend_tx,
            rx: from_backend_rx,
        };
        (link, to_backend_rx, from_backend_tx)
    }
}

/// Something able to open backend links: the live WebSocket API or the
/// in-process sandbox. Selected once at startup.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn connect(&self) -> Result<BackendLink, ProxyError>;

    /// Short name used in logs.
    fn describe(&self) -> String;
}
