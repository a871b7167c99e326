// gateway/src/deployer_api.rs
//! Client-facing `Deployer` requests, answered by the gateway itself.
use common::{Credentials, RequestFrame, ResponseFrame};
use deployer::Deployer;
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;
use uuid::Uuid;

pub const DEPLOYER_TYPE: &str = "Deployer";

const NOT_LOGGED_IN: &str = "unauthorized access: no user logged in";
const UNKNOWN_REQUEST: &str = "invalid request: unknown deployer request";

pub enum DeployerReply {
    /// Answer sent right away.
    Done(ResponseFrame),
    /// Acknowledge a watch, then push every update under the same request id.
    Watch {
        ack: ResponseFrame,
        updates: BoxStream<'static, String>,
    },
}

/// Deployer endpoint of one client connection.
pub struct DeployerApi {
    deployer: Deployer,
    owner: Uuid,
    next_watcher: u64,
}

impl DeployerApi {
    pub fn new(deployer: Deployer, owner: Uuid) -> Self {
        Self {
            deployer,
            owner,
            next_watcher: 0,
        }
    }

    /// Whether a client text frame is meant for the deployer. Cheap check
    /// first, so ordinary traffic is not parsed.
    pub fn parse_request(text: &str) -> Option<RequestFrame> {
        if !text.contains(DEPLOYER_TYPE) {
            return None;
        }
        RequestFrame::parse(text).filter(|request| request.kind == DEPLOYER_TYPE)
    }

    pub fn handle(&mut self, request: &RequestFrame, credentials: Option<&Credentials>) -> DeployerReply {
        let id = request.request_id;
        let Some(credentials) = credentials else {
            return DeployerReply::Done(ResponseFrame::error(id, NOT_LOGGED_IN, Some("unauthorized access")));
        };
        let yaml = request.param_str("YAML").unwrap_or_default();
        let name = request.param_str("Name");

        let result = match request.request.as_str() {
            "Validate" => self.deployer.validate(yaml, name).map(|_| json!({})),
            "Import" => self
                .deployer
                .deploy(self.owner, credentials.clone(), yaml, name)
                .map(|handle| json!({"DeploymentId": handle.id()})),
            "Watch" => {
                let Some(deployment_id) = request.param_u64("DeploymentId") else {
                    return missing_id(id);
                };
                match self.deployer.watch(self.owner, deployment_id) {
                    Ok(events) => {
                        let watcher_id = self.next_watcher;
                        self.next_watcher += 1;
                        let updates = events
                            .map(move |event| {
                                ResponseFrame::ok(id, json!({"WatcherId": watcher_id, "Changes": [event]})).to_text()
                            })
                            .boxed();
                        return DeployerReply::Watch {
                            ack: ResponseFrame::ok(id, json!({"WatcherId": watcher_id})),
                            updates,
                        };
                    }
                    Err(e) => Err(e),
                }
            }
            "Cancel" => {
                let Some(deployment_id) = request.param_u64("DeploymentId") else {
                    return missing_id(id);
                };
                self.deployer.cancel(self.owner, deployment_id).map(|_| json!({}))
            }
            "Status" => Ok(json!({"LastChanges": self.deployer.status(self.owner)})),
            _ => return DeployerReply::Done(ResponseFrame::error(id, UNKNOWN_REQUEST, None)),
        };

        DeployerReply::Done(match result {
            Ok(response) => ResponseFrame::ok(id, response),
            Err(e) => ResponseFrame::error(id, e.to_string(), None),
        })
    }

    /// Cancel and forget every deployment this connection started.
    pub fn release(&self) -> usize {
        self.deployer.release(self.owner)
    }
}

fn missing_id(id: u64) -> DeployerReply {
    DeployerReply::Done(ResponseFrame::error(id, "invalid request: missing DeploymentId", None))
}
