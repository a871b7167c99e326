// gateway/tests/gateway_flow.rs
//! Login, token resumption and deployer traffic through the same pieces the
//! proxy actor wires together, against the sandbox backend.
use common::{BackendLink, Frame, RequestFrame, ResponseFrame};
use deployer::Deployer;
use futures::StreamExt;
use gateway::apps::GatewayState;
use gateway::auth::{AuthInterceptor, Route, TokenStore};
use gateway::deployer_api::{DeployerApi, DeployerReply};
use sandbox::{SandboxBackend, SandboxEnvironment};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const BUNDLE: &str = r#"
services:
  wordpress: {charm: "cs:wordpress", num_units: 1}
  mysql: {charm: "cs:mysql", num_units: 1}
relations:
  - ["wordpress:db", "mysql:server"]
"#;

fn gateway() -> (GatewayState, Arc<SandboxEnvironment>) {
    let env = Arc::new(SandboxEnvironment::default());
    let backend = Arc::new(SandboxBackend::new(env.clone()));
    let state = GatewayState {
        deployer: Deployer::new(backend.clone()),
        backend,
        tokens: Arc::new(TokenStore::new(Duration::from_secs(120))),
        auth_timeout: Duration::from_secs(30),
    };
    (state, env)
}

/// One client connection: the relay loop of the proxy without the sockets.
struct Connection {
    auth: AuthInterceptor,
    deployer_api: DeployerApi,
    link: BackendLink,
}

impl Connection {
    async fn open(state: &GatewayState) -> Self {
        let conn_id = Uuid::new_v4();
        Self {
            auth: AuthInterceptor::new(state.tokens.clone()),
            deployer_api: DeployerApi::new(state.deployer.clone(), conn_id),
            link: state.backend.connect().await.unwrap(),
        }
    }

    /// Send a client frame; return what the client receives for it.
    async fn send(&mut self, text: String) -> ResponseFrame {
        if let Some(request) = DeployerApi::parse_request(&text) {
            return match self.deployer_api.handle(&request, self.auth.credentials()) {
                DeployerReply::Done(reply) => reply,
                DeployerReply::Watch { ack, .. } => ack,
            };
        }
        let reply = match self.auth.on_client_text(text) {
            Route::Client(reply) => reply,
            Route::Backend(text) => {
                self.link.tx.send(Frame::Text(text)).await.unwrap();
                loop {
                    match self.link.rx.recv().await {
                        Some(Frame::Text(text)) => break self.auth.on_backend_text(text).unwrap(),
                        Some(_) => continue,
                        None => panic!("backend leg closed"),
                    }
                }
            }
        };
        ResponseFrame::parse(&reply).unwrap()
    }

    async fn watch(&mut self, request: RequestFrame) -> Vec<ResponseFrame> {
        match self.deployer_api.handle(&request, self.auth.credentials()) {
            DeployerReply::Watch { updates, .. } => updates
                .map(|text| ResponseFrame::parse(&text).unwrap())
                .collect()
                .await,
            DeployerReply::Done(reply) => panic!("watch refused: {:?}", reply.error),
        }
    }

    fn close(self) -> usize {
        self.deployer_api.release()
    }
}

fn login(id: u64, password: &str) -> String {
    RequestFrame::new(id, "Admin", "Login", json!({"AuthTag": "user-admin", "Password": password})).to_text()
}

fn token_login(id: u64, token: &str) -> String {
    RequestFrame::new(id, "GUIToken", "Login", json!({"Token": token})).to_text()
}

fn request(id: u64, kind: &str, name: &str, params: Value) -> String {
    RequestFrame::new(id, kind, name, params).to_text()
}

fn token_of(reply: &ResponseFrame) -> String {
    reply.response["GUIToken"]["Token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_reconnect_with_token() {
    let (state, env) = gateway();

    let mut first = Connection::open(&state).await;
    let reply = first.send(login(1, "sandbox")).await;
    assert!(!reply.is_error());
    let token = token_of(&reply);
    assert!(reply.response["GUIToken"]["Expires"].is_string());
    first.close();

    let mut second = Connection::open(&state).await;
    let reply = second.send(token_login(1, &token)).await;
    assert!(!reply.is_error());
    assert!(!reply.response.contains_key("GUIToken"));
    assert!(!reply.response.contains_key("AuthTag"));
    assert!(!reply.response.contains_key("Password"));
    assert!(second.auth.is_authenticated());

    let status = second.send(request(2, "Client", "FullStatus", json!({}))).await;
    assert!(!status.is_error());

    // The token is spent.
    let mut third = Connection::open(&state).await;
    let reply = third.send(token_login(1, &token)).await;
    assert_eq!(reply.error.as_deref(), Some("unknown, fulfilled, or expired token"));
    assert_eq!(reply.error_code.as_deref(), Some("unauthorized access"));
    assert!(!third.auth.is_authenticated());
    assert_eq!(env.call_count("Admin.Login"), 2);
}

#[tokio::test]
async fn test_token_and_password_sessions_behave_the_same() {
    let (state, _env) = gateway();

    let mut direct = Connection::open(&state).await;
    let token = token_of(&direct.send(login(1, "sandbox")).await);
    let mut resumed = Connection::open(&state).await;
    resumed.send(token_login(1, &token)).await;

    let a = direct.send(request(2, "Client", "AddCharm", json!({"URL": "cs:mysql"}))).await;
    let b = resumed.send(request(2, "Client", "AddCharm", json!({"URL": "cs:mysql"}))).await;
    assert_eq!(a, b);

    let a = direct.send(request(3, "Client", "FullStatus", json!({}))).await;
    let b = resumed.send(request(3, "Client", "FullStatus", json!({}))).await;
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_sandbox_login_token_and_deploy() {
    let (state, env) = gateway();

    let mut conn = Connection::open(&state).await;
    let refused = conn.send(login(1, "wrong")).await;
    assert!(refused.is_error());
    assert!(!refused.response.contains_key("GUIToken"));

    let reply = conn.send(login(2, "sandbox")).await;
    let token = token_of(&reply);
    conn.close();

    let mut conn = Connection::open(&state).await;
    assert!(!conn.send(token_login(1, &token)).await.is_error());

    let imported = conn.send(request(2, "Deployer", "Import", json!({"YAML": BUNDLE}))).await;
    let deployment_id = imported.response["DeploymentId"].as_u64().unwrap();

    let updates = conn
        .watch(RequestFrame::new(3, "Deployer", "Watch", json!({"DeploymentId": deployment_id})))
        .await;
    assert!(updates.iter().all(|u| u.request_id == 3));
    let last = &updates.last().unwrap().response["Changes"][0];
    assert_eq!(last["Status"], "finished");
    assert!(last.get("Error").is_none());

    assert_eq!(env.service_units("wordpress"), Some(vec!["wordpress/0".to_string()]));
    assert_eq!(env.call_count("Client.AddRelation"), 1);

    let status = conn.send(request(4, "Deployer", "Status", json!({}))).await;
    assert_eq!(status.response["LastChanges"][0]["Status"], "finished");
    assert_eq!(conn.close(), 0);
}

#[tokio::test]
async fn test_invalid_bundle_rejected_before_any_step() {
    let (state, env) = gateway();
    let mut conn = Connection::open(&state).await;
    conn.send(login(1, "sandbox")).await;

    let bundle = "services:\n  wordpress: {charm: \"cs:wordpress\"}\n  mysql: {charm: \"cs:mysql\"}\nrelations:\n  - [\"wordpress:db\", \"pgsql:db\"]\n";
    let reply = conn.send(request(2, "Deployer", "Import", json!({"YAML": bundle}))).await;
    assert!(reply.error.unwrap().contains("unknown service pgsql"));
    assert_eq!(env.call_count("Client.GetBundleChanges"), 0);
    assert!(state.deployer.registry().is_empty());
}

#[tokio::test]
async fn test_malformed_login_never_reaches_backend() {
    let (state, env) = gateway();
    let mut conn = Connection::open(&state).await;

    let reply = conn
        .send(request(1, "Admin", "Login", json!({"AuthTag": "user-admin"})))
        .await;
    assert_eq!(reply.error_code.as_deref(), Some("unauthorized access"));
    let reply = conn.send(request(2, "GUIToken", "Login", json!({}))).await;
    assert!(reply.is_error());
    assert!(env.calls().is_empty());
}

#[tokio::test]
async fn test_deployer_refused_before_login() {
    let (state, env) = gateway();
    let mut conn = Connection::open(&state).await;

    let reply = conn.send(request(1, "Deployer", "Import", json!({"YAML": BUNDLE}))).await;
    assert_eq!(reply.error.as_deref(), Some("unauthorized access: no user logged in"));
    assert!(env.calls().is_empty());
    assert!(state.deployer.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_requires_fresh_login() {
    let (state, env) = gateway();
    let mut conn = Connection::open(&state).await;
    let token = token_of(&conn.send(login(1, "sandbox")).await);

    tokio::time::advance(Duration::from_secs(121)).await;

    let mut conn = Connection::open(&state).await;
    let reply = conn.send(token_login(1, &token)).await;
    assert_eq!(reply.error.as_deref(), Some("unknown, fulfilled, or expired token"));
    assert_eq!(env.call_count("Admin.Login"), 1);

    // A fresh login still works on the same connection.
    assert!(!conn.send(login(2, "sandbox")).await.is_error());
}
