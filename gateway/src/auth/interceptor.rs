// gateway/src/auth/interceptor.rs
use super::tokens::TokenStore;
use common::{AuthError, Credentials, ProxyError, RequestFrame, ResponseFrame};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;

/// Keys removed from a login response when the credentials were replayed
/// from a token.
const CREDENTIAL_KEYS: [&str; 3] = ["AuthTag", "Password", "Credentials"];

#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub request_id: u64,
    pub credentials: Credentials,
    /// Credentials were substituted from a redeemed token.
    pub via_token: bool,
    pub started: Instant,
}

#[derive(Debug, Clone)]
pub enum AuthState {
    Unauthenticated,
    Pending(PendingLogin),
    Authenticated,
}

/// Where a client frame goes after inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Forward this text to the backend.
    Backend(String),
    /// Answer the client directly; nothing reaches the backend.
    Client(String),
}

/// Per-connection watcher of the login exchange.
pub struct AuthInterceptor {
    tokens: Arc<TokenStore>,
    state: AuthState,
    credentials: Option<Credentials>,
    /// Login given up on; its answer may still come.
    expired: Option<u64>,
}

impl AuthInterceptor {
    pub fn new(tokens: Arc<TokenStore>) -> Self {
        Self {
            tokens,
            state: AuthState::Unauthenticated,
            credentials: None,
            expired: None,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated)
    }

    /// Credentials of the authenticated user.
    pub fn credentials(&self) -> Option<&Credentials> {
        match self.state {
            AuthState::Authenticated => self.credentials.as_ref(),
            _ => None,
        }
    }

    pub fn pending_request_id(&self) -> Option<u64> {
        match &self.state {
            AuthState::Pending(pending) => Some(pending.request_id),
            _ => None,
        }
    }

    /// Inspect a text frame sent by the client.
    pub fn on_client_text(&mut self, text: String) -> Route {
        if self.is_authenticated() {
            return Route::Backend(text);
        }
        let Some(request) = RequestFrame::parse(&text) else {
            return Route::Backend(text);
        };

        if request.is("Admin", "Login") {
            match (request.param_str("AuthTag"), request.param_str("Password")) {
                (Some(user), Some(password)) => {
                    let credentials = Credentials::new(user, password);
                    self.start_login(request.request_id, credentials, false);
                    Route::Backend(text)
                }
                _ => reject(request.request_id, AuthError::MalformedLogin("missing AuthTag or Password".into())),
            }
        } else if request.is("GUIToken", "Login") {
            let Some(token) = request.param_str("Token") else {
                return reject(request.request_id, AuthError::MalformedLogin("missing Token".into()));
            };
            match self.tokens.redeem(token) {
                Ok(credentials) => {
                    tracing::info!("Login token redeemed for {}", credentials.user);
                    let login = RequestFrame::new(request.request_id, "Admin", "Login", credentials.login_params());
                    self.start_login(request.request_id, credentials, true);
                    Route::Backend(login.to_text())
                }
                Err(e) => {
                    tracing::info!("Login token refused: {}", e);
                    reject(request.request_id, e)
                }
            }
        } else {
            Route::Backend(text)
        }
    }

    /// Inspect a text frame sent by the backend, rewriting the answer to a
    /// pending login.
    ///
    /// A successful answer to a login that already timed out means the
    /// backend session is logged in while the client was told otherwise;
    /// that is an error and the pair has to go.
    pub fn on_backend_text(&mut self, text: String) -> Result<String, ProxyError> {
        if self.expired.is_none() && !matches!(self.state, AuthState::Pending(_)) {
            return Ok(text);
        }
        let Some(response) = ResponseFrame::parse(&text) else {
            return Ok(text);
        };
        if self.expired == Some(response.request_id) {
            self.expired = None;
            if !response.is_error() {
                return Err(ProxyError::LateLogin(response.request_id));
            }
            return Ok(text);
        }
        let AuthState::Pending(pending) = &self.state else {
            return Ok(text);
        };
        if response.request_id != pending.request_id {
            return Ok(text);
        }

        let pending = pending.clone();
        if response.is_error() {
            tracing::info!("Backend refused login for {}", pending.credentials.user);
            self.state = AuthState::Unauthenticated;
            return Ok(text);
        }

        tracing::info!("Connection authenticated as {}", pending.credentials.user);
        self.state = AuthState::Authenticated;
        let credentials = pending.credentials.clone();
        self.credentials = Some(pending.credentials);

        let Ok(mut value) = serde_json::from_str::<Value>(&text) else {
            return Ok(text);
        };
        if let Some(body) = value.get_mut("Response").and_then(Value::as_object_mut) {
            if pending.via_token {
                for key in CREDENTIAL_KEYS {
                    body.remove(key);
                }
            } else {
                body.insert("GUIToken".to_string(), self.tokens.issue(credentials).to_json());
            }
        }
        Ok(serde_json::to_string(&value).unwrap_or(text))
    }

    /// Give up on the login `request_id` if it is still pending. Returns the
    /// error reply for the client.
    pub fn expire_pending(&mut self, request_id: u64) -> Option<String> {
        match &self.state {
            AuthState::Pending(pending) if pending.request_id == request_id => {
                tracing::warn!(
                    "Login {} timed out after {:?}",
                    request_id,
                    pending.started.elapsed()
                );
                self.state = AuthState::Unauthenticated;
                self.expired = Some(request_id);
                let err = AuthError::Timeout;
                Some(ResponseFrame::error(request_id, err.to_string(), Some(err.code())).to_text())
            }
            _ => None,
        }
    }

    fn start_login(&mut self, request_id: u64, credentials: Credentials, via_token: bool) {
        self.expired = None;
        self.state = AuthState::Pending(PendingLogin {
            request_id,
            credentials,
            via_token,
            started: Instant::now(),
        });
    }
}

fn reject(request_id: u64, err: AuthError) -> Route {
    Route::Client(ResponseFrame::error(request_id, err.to_string(), Some(err.code())).to_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn interceptor() -> (AuthInterceptor, Arc<TokenStore>) {
        let tokens = Arc::new(TokenStore::new(Duration::from_secs(120)));
        (AuthInterceptor::new(tokens.clone()), tokens)
    }

    fn login(id: u64) -> String {
        RequestFrame::new(id, "Admin", "Login", json!({"AuthTag": "user-admin", "Password": "pw"})).to_text()
    }

    fn backend_ok(id: u64, body: Value) -> String {
        ResponseFrame::ok(id, body).to_text()
    }

    #[tokio::test]
    async fn test_credential_login_mints_token() {
        let (mut auth, tokens) = interceptor();
        assert_eq!(auth.on_client_text(login(1)), Route::Backend(login(1)));
        assert_eq!(auth.pending_request_id(), Some(1));

        let reply = auth.on_backend_text(backend_ok(1, json!({"EnvironTag": "env"}))).unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert!(auth.is_authenticated());
        assert_eq!(reply["Response"]["EnvironTag"], "env");
        let token = reply["Response"]["GUIToken"]["Token"].as_str().unwrap();
        assert_eq!(tokens.redeem(token).unwrap(), Credentials::new("user-admin", "pw"));
    }

    #[tokio::test]
    async fn test_failed_login_returns_to_unauthenticated() {
        let (mut auth, tokens) = interceptor();
        auth.on_client_text(login(1));
        let refusal = ResponseFrame::error(1, "invalid entity name or password", Some("unauthorized access")).to_text();
        assert_eq!(auth.on_backend_text(refusal.clone()).unwrap(), refusal);
        assert!(matches!(auth.state(), AuthState::Unauthenticated));
        assert!(tokens.is_empty());
    }

    #[tokio::test]
    async fn test_token_login_substitutes_and_strips_credentials() {
        let (mut auth, tokens) = interceptor();
        let token = tokens.issue(Credentials::new("user-admin", "pw"));
        let frame = RequestFrame::new(5, "GUIToken", "Login", json!({"Token": token.value})).to_text();

        let Route::Backend(forwarded) = auth.on_client_text(frame) else {
            panic!("token login must reach the backend");
        };
        let forwarded = RequestFrame::parse(&forwarded).unwrap();
        assert!(forwarded.is("Admin", "Login"));
        assert_eq!(forwarded.request_id, 5);
        assert_eq!(forwarded.param_str("Password"), Some("pw"));

        let reply = auth
            .on_backend_text(backend_ok(5, json!({"AuthTag": "user-admin", "Password": "pw", "Facades": []})))
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        let body = reply["Response"].as_object().unwrap();
        assert!(!body.contains_key("AuthTag"));
        assert!(!body.contains_key("Password"));
        assert!(!body.contains_key("GUIToken"));
        assert!(body.contains_key("Facades"));
        assert_eq!(auth.credentials().map(|c| c.user.as_str()), Some("user-admin"));
    }

    #[tokio::test]
    async fn test_unknown_token_answered_locally() {
        let (mut auth, _) = interceptor();
        let frame = RequestFrame::new(2, "GUIToken", "Login", json!({"Token": "bogus"})).to_text();
        let Route::Client(reply) = auth.on_client_text(frame) else {
            panic!("unknown token must not reach the backend");
        };
        let reply = ResponseFrame::parse(&reply).unwrap();
        assert_eq!(reply.error.as_deref(), Some("unknown, fulfilled, or expired token"));
        assert_eq!(reply.error_code.as_deref(), Some("unauthorized access"));
        assert!(matches!(auth.state(), AuthState::Unauthenticated));
    }

    #[tokio::test]
    async fn test_malformed_login_answered_locally() {
        let (mut auth, _) = interceptor();
        let frame = RequestFrame::new(3, "Admin", "Login", json!({"AuthTag": "user-admin"})).to_text();
        assert!(matches!(auth.on_client_text(frame), Route::Client(_)));
        let frame = RequestFrame::new(4, "GUIToken", "Login", json!({})).to_text();
        assert!(matches!(auth.on_client_text(frame), Route::Client(_)));
        assert!(matches!(auth.state(), AuthState::Unauthenticated));
    }

    #[tokio::test]
    async fn test_authenticated_connection_is_pass_through() {
        let (mut auth, tokens) = interceptor();
        auth.on_client_text(login(1));
        auth.on_backend_text(backend_ok(1, json!({}))).unwrap();
        let issued = tokens.len();

        // A later login-looking exchange is relayed untouched.
        assert_eq!(auth.on_client_text(login(2)), Route::Backend(login(2)));
        let response = backend_ok(2, json!({}));
        assert_eq!(auth.on_backend_text(response.clone()).unwrap(), response);
        assert_eq!(tokens.len(), issued);
    }

    #[tokio::test]
    async fn test_unrelated_responses_do_not_settle_login() {
        let (mut auth, _) = interceptor();
        auth.on_client_text(login(7));
        let other = backend_ok(6, json!({}));
        assert_eq!(auth.on_backend_text(other.clone()).unwrap(), other);
        assert_eq!(auth.pending_request_id(), Some(7));
    }

    #[tokio::test]
    async fn test_expire_pending_login() {
        let (mut auth, _) = interceptor();
        auth.on_client_text(login(8));
        assert!(auth.expire_pending(9).is_none());
        let reply = ResponseFrame::parse(&auth.expire_pending(8).unwrap()).unwrap();
        assert_eq!(reply.error.as_deref(), Some("authentication timed out"));
        assert!(matches!(auth.state(), AuthState::Unauthenticated));

        // A late success leaves the backend logged in behind our back.
        let late = backend_ok(8, json!({}));
        assert!(matches!(auth.on_backend_text(late), Err(ProxyError::LateLogin(8))));
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn test_late_refusal_is_relayed() {
        let (mut auth, tokens) = interceptor();
        auth.on_client_text(login(8));
        auth.expire_pending(8).unwrap();

        let refusal = ResponseFrame::error(8, "invalid entity name or password", None).to_text();
        assert_eq!(auth.on_backend_text(refusal.clone()).unwrap(), refusal);
        // Only the first answer to the expired login is special.
        let again = backend_ok(8, json!({}));
        assert_eq!(auth.on_backend_text(again.clone()).unwrap(), again);
        assert!(!auth.is_authenticated());
        assert!(tokens.is_empty());
    }

    #[tokio::test]
    async fn test_new_login_after_timeout_is_tracked() {
        let (mut auth, _) = interceptor();
        auth.on_client_text(login(8));
        auth.expire_pending(8).unwrap();
        auth.on_client_text(login(9));

        assert!(auth.on_backend_text(backend_ok(9, json!({}))).is_ok());
        assert!(auth.is_authenticated());
    }
}
