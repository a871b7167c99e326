// common/src/api_client.rs
use crate::backend::BackendLink;
use crate::error::ApiError;
use crate::messages::{Frame, RequestFrame, ResponseFrame};
use crate::models::Credentials;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Request/response client over a backend link.
///
/// Responses are matched to callers by `RequestId`, so any number of calls
/// may be in flight at once.
pub struct ApiClient {
    tx: mpsc::Sender<Frame>,
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, oneshot::Sender<ResponseFrame>>>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl ApiClient {
    pub fn new(link: BackendLink) -> Self {
        let BackendLink { tx, mut rx } = link;
        let pending: Arc<DashMap<u64, oneshot::Sender<ResponseFrame>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Frame::Text(text) => match ResponseFrame::parse(&text) {
                        Some(response) => {
                            if let Some((_, waiter)) = reader_pending.remove(&response.request_id) {
                                let _ = waiter.send(response);
                            } else {
                                tracing::debug!("Dropping unsolicited backend response {}", response.request_id);
                            }
                        }
                        None => tracing::debug!("Ignoring non-response backend frame"),
                    },
                    Frame::Binary(_) => {}
                    Frame::Close => break,
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the waiters wakes every caller with `Closed`.
            reader_pending.clear();
        });

        Self {
            tx,
            next_id: AtomicU64::new(1),
            pending,
            closed,
            reader,
        }
    }

    /// Issue one request and wait for its response object.
    pub async fn call(&self, kind: &str, request: &str, params: Value) -> Result<Map<String, Value>, ApiError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.insert(request_id, waiter_tx);

        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&request_id);
            return Err(ApiError::Closed);
        }

        let frame = RequestFrame::new(request_id, kind, request, params);
        if self.tx.send(Frame::Text(frame.to_text())).await.is_err() {
            self.pending.remove(&request_id);
            return Err(ApiError::Closed);
        }

        let response = waiter_rx.await.map_err(|_| ApiError::Closed)?;
        if response.is_error() {
            return Err(ApiError::Remote {
                message: response.error.unwrap_or_default(),
                code: response.error_code,
            });
        }
        Ok(response.response)
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<(), ApiError> {
        self.call("Admin", "Login", credentials.login_params()).await?;
        Ok(())
    }
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_call_matches_responses_by_request_id() {
        let (link, mut backend_rx, backend_tx) = BackendLink::pair();
        let client = Arc::new(ApiClient::new(link));

        // Answer requests in reverse order of arrival.
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 2 {
                if let Some(Frame::Text(text)) = backend_rx.recv().await {
                    seen.push(RequestFrame::parse(&text).unwrap());
                }
            }
            for req in seen.into_iter().rev() {
                let resp = ResponseFrame::ok(req.request_id, json!({"Echo": req.request}));
                backend_tx.send(Frame::Text(resp.to_text())).await.unwrap();
            }
        });

        let first = client.call("Client", "First", json!({}));
        let second = client.call("Client", "Second", json!({}));
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap()["Echo"], "First");
        assert_eq!(second.unwrap()["Echo"], "Second");
    }

    #[tokio::test]
    async fn test_remote_error_and_closed() {
        let (link, mut backend_rx, backend_tx) = BackendLink::pair();
        let client = ApiClient::new(link);

        tokio::spawn(async move {
            if let Some(Frame::Text(text)) = backend_rx.recv().await {
                let req = RequestFrame::parse(&text).unwrap();
                let resp = ResponseFrame::error(req.request_id, "nope", Some("not found"));
                backend_tx.send(Frame::Text(resp.to_text())).await.unwrap();
            }
            // Dropping both ends closes the link.
        });

        let err = client.call("Client", "Thing", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            ApiError::Remote {
                message: "nope".into(),
                code: Some("not found".into())
            }
        );
        let err = client.call("Client", "Thing", json!({})).await.unwrap_err();
        assert_eq!(err, ApiError::Closed);
    }
}
