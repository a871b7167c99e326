// gateway/src/apps.rs
//! Route table of the gateway and of the HTTPS redirector.
use crate::auth::TokenStore;
use crate::backend::WsBackend;
use crate::proxy::ProxyActor;
use crate::static_files::{self, StaticFilesConfig};
use actix_web::http::header;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use common::{Backend, Config};
use deployer::Deployer;
use sandbox::{SandboxBackend, SandboxEnvironment};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const WS_PATTERN: &str = "/ws{tail:.*}";
pub const TESTS_PATH: &str = "/test";
pub const GUI_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Live,
    Sandbox,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteHandler {
    WebSocket(BackendKind),
    TestFiles(PathBuf),
    GuiFiles(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub path: &'static str,
    pub handler: RouteHandler,
}

/// Routes served by the gateway for `config`, most specific first.
pub fn route_plan(config: &Config) -> Vec<RouteSpec> {
    let kind = if config.sandbox {
        BackendKind::Sandbox
    } else {
        BackendKind::Live
    };
    let mut plan = vec![RouteSpec {
        path: WS_PATTERN,
        handler: RouteHandler::WebSocket(kind),
    }];
    if let Some(root) = &config.tests_root {
        plan.push(RouteSpec {
            path: TESTS_PATH,
            handler: RouteHandler::TestFiles(PathBuf::from(root)),
        });
    }
    if let Some(root) = &config.gui_root {
        plan.push(RouteSpec {
            path: GUI_PATH,
            handler: RouteHandler::GuiFiles(PathBuf::from(root)),
        });
    }
    plan
}

/// Process-wide state shared by every connection.
#[derive(Clone)]
pub struct GatewayState {
    pub backend: Arc<dyn Backend>,
    pub tokens: Arc<TokenStore>,
    pub deployer: Deployer,
    pub auth_timeout: Duration,
}

impl GatewayState {
    /// Pick the backend once, from configuration.
    pub fn from_config(config: &Config) -> Self {
        let backend: Arc<dyn Backend> = if config.sandbox {
            let env = SandboxEnvironment::new(&config.sandbox_user, &config.sandbox_password);
            Arc::new(SandboxBackend::new(Arc::new(env)))
        } else {
            let url = config.backend_url.clone().unwrap_or_default();
            Arc::new(WsBackend::new(url, config.backend_insecure))
        };
        tracing::info!("Using backend {}", backend.describe());

        Self {
            deployer: Deployer::new(backend.clone()),
            backend,
            tokens: Arc::new(TokenStore::new(config.token_ttl())),
            auth_timeout: config.auth_timeout(),
        }
    }
}

/// Bind every route of `plan`.
pub fn configure(cfg: &mut web::ServiceConfig, plan: &[RouteSpec], state: web::Data<GatewayState>) {
    cfg.app_data(state);
    for route in plan {
        match &route.handler {
            RouteHandler::WebSocket(_) => {
                cfg.route(route.path, web::get().to(ws_route));
            }
            RouteHandler::TestFiles(root) => static_files::configure_tests(cfg, root),
            RouteHandler::GuiFiles(root) => static_files::configure_gui(cfg, StaticFilesConfig::new(root)),
        }
    }
}

/// Redirector app: every path goes to the same place over HTTPS.
pub fn redirector(cfg: &mut web::ServiceConfig) {
    cfg.route("/{tail:.*}", web::to(redirect_to_https));
}

async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse, Error> {
    let conn_id = Uuid::new_v4();
    tracing::debug!("WebSocket connection {} on {}", conn_id, req.path());

    let proxy = ProxyActor::new(
        conn_id,
        state.backend.clone(),
        state.tokens.clone(),
        state.deployer.clone(),
        state.auth_timeout,
    );
    ws::start(proxy, &req, stream)
}

async fn redirect_to_https(req: HttpRequest) -> HttpResponse {
    let host = req.connection_info().host().split(':').next().unwrap_or_default().to_string();
    let target = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    HttpResponse::MovedPermanently()
        .insert_header((header::LOCATION, format!("https://{}{}", host, target)))
        .finish()
}
