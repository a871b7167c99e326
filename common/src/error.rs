// common/src/error.rs
use thiserror::Error;

/// Close code sent when the backend cannot be reached.
pub const CLOSE_BACKEND_UNREACHABLE: u16 = 1011;
/// Close code sent when the backend rejects the WebSocket handshake.
pub const CLOSE_BAD_GATEWAY: u16 = 1014;
/// Close code sent when the client leg breaks the framing protocol.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close code sent when the client uses frames the gateway cannot relay.
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;

/// Authentication failures. Always recovered locally: the client is asked
/// to log in again and the connection stays open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown, fulfilled, or expired token")]
    TokenNotFound,
    #[error("invalid login request: {0}")]
    MalformedLogin(String),
    #[error("authentication timed out")]
    Timeout,
}

impl AuthError {
    /// Error code reported to the client next to the message.
    pub fn code(&self) -> &'static str {
        "unauthorized access"
    }
}

/// Fatal failures of a connection pair.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("frame error on {leg} leg: {reason}")]
    Frame { leg: &'static str, reason: String },
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
    #[error("unsupported client frame: {0}")]
    Unsupported(String),
    #[error("login {0} answered after it timed out")]
    LateLogin(u64),
}

impl ProxyError {
    /// Diagnostic close code sent to the client before tearing the pair down.
    pub fn close_code(&self) -> u16 {
        match self {
            ProxyError::Unreachable(_) | ProxyError::InvalidUrl(_) => CLOSE_BACKEND_UNREACHABLE,
            ProxyError::HandshakeRejected(_) => CLOSE_BAD_GATEWAY,
            ProxyError::Frame { leg: "client", .. } => CLOSE_PROTOCOL_ERROR,
            ProxyError::Frame { .. } | ProxyError::LateLogin(_) => CLOSE_BACKEND_UNREACHABLE,
            ProxyError::Unsupported(_) => CLOSE_UNSUPPORTED_DATA,
        }
    }
}

/// A bundle that cannot be deployed. Raised before any deployment state
/// exists.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BundleValidationError {
    #[error("malformed bundle: {0}")]
    Malformed(String),
    #[error("bundle does not contain any services")]
    NoServices,
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),
    #[error("service {0} has no charm")]
    MissingCharm(String),
    #[error("service {service} asks for {units} units, at most {max} are allowed")]
    TooManyUnits { service: String, units: u32, max: u32 },
    #[error("invalid placement {placement} for service {service}")]
    InvalidPlacement { service: String, placement: String },
    #[error("invalid relation: {0}")]
    InvalidRelation(String),
    #[error("relation endpoint {endpoint} refers to unknown service {service}")]
    UnknownService { endpoint: String, service: String },
    #[error("bundle {0} not found")]
    UnknownBundle(String),
    #[error("multiple bundles found, a bundle name must be provided")]
    AmbiguousBundle,
}

/// Failure of a single backend call issued through the API client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("{message}")]
    Remote { message: String, code: Option<String> },
    #[error("backend connection closed")]
    Closed,
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

/// Failure of one change-set step. Recorded on the step, never fatal to the
/// deployment's other branches or to the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeploymentStepError {
    #[error("{method} failed: {source}")]
    Call { method: String, source: ApiError },
    #[error("unsupported change method {0}")]
    UnsupportedMethod(String),
    #[error("invalid arguments for {method}: {reason}")]
    InvalidArgs { method: String, reason: String },
    #[error("unresolved placeholder {0}")]
    UnresolvedPlaceholder(String),
    #[error("required change {0} failed")]
    DependencyFailed(String),
}

/// Failures surfaced by the deployer's public operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeployerError {
    #[error(transparent)]
    Validation(#[from] BundleValidationError),
    #[error("deployment {0} not found")]
    NotFound(u64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("a backend url is required unless sandbox mode is enabled")]
    MissingBackend,
    #[error("invalid backend url {url}: {reason}")]
    InvalidBackend { url: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(ProxyError::Unreachable("x".into()).close_code(), 1011);
        assert_eq!(ProxyError::HandshakeRejected("x".into()).close_code(), 1014);
        let client = ProxyError::Frame { leg: "client", reason: "bad".into() };
        assert_eq!(client.close_code(), 1002);
        let backend = ProxyError::Frame { leg: "backend", reason: "bad".into() };
        assert_eq!(backend.close_code(), 1011);
        assert_eq!(ProxyError::Unsupported("fragmented message".into()).close_code(), 1003);
        assert_eq!(ProxyError::LateLogin(1).close_code(), 1011);
    }

    #[test]
    fn test_token_error_message() {
        assert_eq!(
            AuthError::TokenNotFound.to_string(),
            "unknown, fulfilled, or expired token"
        );
    }
}
