// gateway/src/backend.rs
//! Live backend leg: a secure WebSocket to the cluster-management API.
use async_trait::async_trait;
use common::{Backend, BackendLink, Frame, ProxyError};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};

pub struct WsBackend {
    url: String,
    /// Accept self-signed certificates, as cluster API servers use them.
    insecure: bool,
}

impl WsBackend {
    pub fn new(url: impl Into<String>, insecure: bool) -> Self {
        Self {
            url: url.into(),
            insecure,
        }
    }

    fn connector(&self) -> Result<Option<Connector>, ProxyError> {
        if !self.insecure {
            return Ok(None);
        }
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ProxyError::Unreachable(format!("cannot set up TLS: {}", e)))?;
        Ok(Some(Connector::NativeTls(tls)))
    }
}

#[async_trait]
impl Backend for WsBackend {
    async fn connect(&self) -> Result<BackendLink, ProxyError> {
        let (stream, _) = connect_async_tls_with_config(self.url.as_str(), None, self.connector()?)
            .await
            .map_err(classify)?;
        tracing::info!("Connected to backend {}", self.url);

        let (mut sink, mut source) = stream.split();
        let (link, mut outbound, inbound) = BackendLink::pair();

        // Gateway -> backend
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let message = match frame {
                    Frame::Text(text) => WsMessage::Text(text),
                    Frame::Binary(data) => WsMessage::Binary(data),
                    Frame::Close => break,
                };
                if let Err(e) = sink.send(message).await {
                    tracing::error!("Error sending to backend: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Backend -> gateway
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(WsMessage::Text(text)) => Frame::Text(text),
                    Ok(WsMessage::Binary(data)) => Frame::Binary(data),
                    Ok(WsMessage::Close(_)) => Frame::Close,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!("Backend WebSocket error: {}", e);
                        break;
                    }
                };
                let closing = matches!(frame, Frame::Close);
                if inbound.send(frame).await.is_err() || closing {
                    break;
                }
            }
            tracing::debug!("Backend reader finished");
        });

        Ok(link)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn classify(err: WsError) -> ProxyError {
    match err {
        WsError::Http(response) => ProxyError::HandshakeRejected(format!("HTTP {}", response.status())),
        WsError::Url(e) => ProxyError::InvalidUrl(e.to_string()),
        WsError::Protocol(e) => ProxyError::HandshakeRejected(e.to_string()),
        other => ProxyError::Unreachable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_backend() {
        // Nothing listens on port 1.
        let backend = WsBackend::new("ws://127.0.0.1:1/", false);
        let err = backend.connect().await.err().unwrap();
        assert_eq!(err.close_code(), common::CLOSE_BACKEND_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let backend = WsBackend::new("http://example.com/", true);
        assert!(matches!(backend.connect().await, Err(ProxyError::InvalidUrl(_))));
    }
}
