// gateway/src/proxy.rs
use crate::auth::{AuthInterceptor, Route, TokenStore};
use crate::deployer_api::{DeployerApi, DeployerReply};
use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, Handler, Message, StreamHandler, WrapFuture};
use actix_web_actors::ws;
use common::{Backend, BackendLink, Frame, ProxyError};
use deployer::Deployer;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// Messages delivered to the actor by its helper tasks
#[derive(Message)]
#[rtype(result = "()")]
pub enum ProxyMessage {
    BackendText(String),
    BackendBinary(Vec<u8>),
    BackendClosed,
    WatcherUpdate(String),
}

/// One client connection and the backend leg paired with it.
///
/// Client frames go through the auth interceptor (or the deployer API) and
/// on to the backend in arrival order; backend frames come back through the
/// interceptor. When either leg goes away, the whole pair is torn down.
pub struct ProxyActor {
    conn_id: Uuid,
    backend: Arc<dyn Backend>,
    backend_tx: Option<mpsc::Sender<Frame>>,
    interceptor: AuthInterceptor,
    deployer_api: DeployerApi,
    auth_timeout: Duration,
    last_heartbeat: Instant,
    tasks: Vec<JoinHandle<()>>,
}

impl ProxyActor {
    pub fn new(
        conn_id: Uuid,
        backend: Arc<dyn Backend>,
        tokens: Arc<TokenStore>,
        deployer: Deployer,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            conn_id,
            backend,
            backend_tx: None,
            interceptor: AuthInterceptor::new(tokens),
            deployer_api: DeployerApi::new(deployer, conn_id),
            auth_timeout,
            last_heartbeat: Instant::now(),
            tasks: Vec::new(),
        }
    }

    // Ping the client and drop the pair once it goes silent
    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                tracing::warn!("Client heartbeat timeout: {}", act.conn_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn open_backend(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let backend = self.backend.clone();
        // No client frame is handled until the backend leg is up.
        ctx.wait(
            async move { backend.connect().await }
                .into_actor(self)
                .map(|result, act, ctx| match result {
                    Ok(link) => act.attach_backend(link, ctx),
                    Err(e) => act.fail(e, ctx),
                }),
        );
    }

    fn attach_backend(&mut self, link: BackendLink, ctx: &mut ws::WebsocketContext<Self>) {
        let BackendLink { tx, mut rx } = link;
        self.backend_tx = Some(tx);

        let addr = ctx.address();
        self.tasks.push(actix::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Frame::Text(text) => addr.do_send(ProxyMessage::BackendText(text)),
                    Frame::Binary(data) => addr.do_send(ProxyMessage::BackendBinary(data)),
                    Frame::Close => break,
                }
            }
            addr.do_send(ProxyMessage::BackendClosed);
        }));
        tracing::debug!("Backend leg attached for connection {}", self.conn_id);
    }

    fn to_backend(&mut self, frame: Frame, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(tx) = self.backend_tx.clone() else {
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                // Hold later client frames back until this one is queued.
                ctx.wait(
                    async move { tx.send(frame).await.is_ok() }
                        .into_actor(self)
                        .map(|sent, act, ctx| {
                            if !sent {
                                act.backend_gone(ctx);
                            }
                        }),
                );
            }
            Err(TrySendError::Closed(_)) => self.backend_gone(ctx),
        }
    }

    fn backend_gone(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.fail(
            ProxyError::Frame {
                leg: "backend",
                reason: "backend connection closed".into(),
            },
            ctx,
        );
    }

    /// Close the client with a diagnostic code and tear the pair down.
    fn fail(&mut self, err: ProxyError, ctx: &mut ws::WebsocketContext<Self>) {
        tracing::error!("Connection {}: {}", self.conn_id, err);
        self.backend_tx = None;
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::from(err.close_code()),
            description: Some(err.to_string()),
        }));
        ctx.stop();
    }

    fn client_text(&mut self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(request) = DeployerApi::parse_request(&text) {
            match self.deployer_api.handle(&request, self.interceptor.credentials()) {
                DeployerReply::Done(reply) => ctx.text(reply.to_text()),
                DeployerReply::Watch { ack, mut updates } => {
                    ctx.text(ack.to_text());
                    let addr = ctx.address();
                    self.tasks.push(actix::spawn(async move {
                        while let Some(update) = updates.next().await {
                            addr.do_send(ProxyMessage::WatcherUpdate(update));
                        }
                    }));
                }
            }
            return;
        }

        let pending_before = self.interceptor.pending_request_id();
        match self.interceptor.on_client_text(text) {
            Route::Backend(text) => self.to_backend(Frame::Text(text), ctx),
            Route::Client(reply) => ctx.text(reply),
        }

        if let Some(request_id) = self.interceptor.pending_request_id() {
            if pending_before != Some(request_id) {
                ctx.run_later(self.auth_timeout, move |act, ctx| {
                    if let Some(reply) = act.interceptor.expire_pending(request_id) {
                        ctx.text(reply);
                    }
                });
            }
        }
    }
}

impl Actor for ProxyActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            "Proxy started for connection {} via {}",
            self.conn_id,
            self.backend.describe()
        );
        self.heartbeat(ctx);
        self.open_backend(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender closes the backend leg.
        self.backend_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let released = self.deployer_api.release();
        tracing::info!(
            "Proxy stopped for connection {} ({} deployments released)",
            self.conn_id,
            released
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ProxyActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                self.fail(
                    ProxyError::Frame {
                        leg: "client",
                        reason: e.to_string(),
                    },
                    ctx,
                );
                return;
            }
        };
        self.last_heartbeat = Instant::now();

        match msg {
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) => {}
            ws::Message::Text(text) => self.client_text(text.to_string(), ctx),
            ws::Message::Binary(bin) => self.to_backend(Frame::Binary(bin.to_vec()), ctx),
            ws::Message::Close(reason) => {
                if let Some(ref r) = reason {
                    tracing::debug!("Client requested close: code={:?}, reason={:?}", r.code, r.description);
                }
                ctx.close(reason);
                ctx.stop();
            }
            // Fragments cannot go through the interceptor one by one.
            ws::Message::Continuation(_) => {
                self.fail(ProxyError::Unsupported("fragmented message".into()), ctx);
            }
            ws::Message::Nop => {}
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        tracing::debug!("Client stream finished: {}", self.conn_id);
        ctx.stop();
    }
}

impl Handler<ProxyMessage> for ProxyActor {
    type Result = ();

    fn handle(&mut self, msg: ProxyMessage, ctx: &mut Self::Context) -> Self::Result {
        match msg {
            ProxyMessage::BackendText(text) => match self.interceptor.on_backend_text(text) {
                Ok(text) => ctx.text(text),
                Err(e) => self.fail(e, ctx),
            },
            ProxyMessage::BackendBinary(data) => ctx.binary(data),
            ProxyMessage::BackendClosed => {
                if self.backend_tx.is_some() {
                    self.backend_gone(ctx);
                }
            }
            ProxyMessage::WatcherUpdate(text) => ctx.text(text),
        }
    }
}
