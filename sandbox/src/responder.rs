// sandbox/src/responder.rs
use crate::changeset::compute_changes;
use crate::environment::SandboxEnvironment;
use common::{BundleSpec, Frame, RequestFrame, ResponseFrame, MAX_UNITS_PER_SERVICE};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const UNAUTHORIZED: &str = "unauthorized access";
const NOT_IMPLEMENTED: &str = "not implemented";

/// Serve one simulated backend connection until the gateway side goes away.
pub async fn run(env: Arc<SandboxEnvironment>, mut rx: mpsc::Receiver<Frame>, tx: mpsc::Sender<Frame>) {
    let authenticated = Arc::new(AtomicBool::new(false));

    while let Some(frame) = rx.recv().await {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(_) => continue,
            Frame::Close => break,
        };

        let request = match RequestFrame::parse(&text) {
            Some(request) => request,
            None => {
                tracing::warn!("Sandbox received a frame that is not a request");
                continue;
            }
        };
        env.record_call(format!("{}.{}", request.kind, request.request));

        // Logins are answered in order, everything else concurrently so that
        // slow calls do not hold back independent ones.
        if request.is("Admin", "Login") {
            let response = login(&env, &request, &authenticated);
            if tx.send(Frame::Text(response.to_text())).await.is_err() {
                break;
            }
            continue;
        }

        if !authenticated.load(Ordering::SeqCst) {
            let response = ResponseFrame::error(request.request_id, "not logged in", Some(UNAUTHORIZED));
            if tx.send(Frame::Text(response.to_text())).await.is_err() {
                break;
            }
            continue;
        }

        let env = env.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = dispatch(&env, &request).await;
            let _ = tx.send(Frame::Text(response.to_text())).await;
        });
    }

    tracing::debug!("Sandbox connection closed");
}

fn login(env: &SandboxEnvironment, request: &RequestFrame, authenticated: &AtomicBool) -> ResponseFrame {
    let user = request.param_str("AuthTag").unwrap_or_default();
    let password = request.param_str("Password").unwrap_or_default();
    if env.authenticate(user, password) {
        authenticated.store(true, Ordering::SeqCst);
        tracing::info!("Sandbox login accepted for {}", user);
        ResponseFrame::ok(request.request_id, json!({"EnvironTag": "environment-sandbox", "Servers": []}))
    } else {
        tracing::info!("Sandbox login rejected for {}", user);
        ResponseFrame::error(request.request_id, "invalid entity name or password", Some(UNAUTHORIZED))
    }
}

async fn dispatch(env: &SandboxEnvironment, request: &RequestFrame) -> ResponseFrame {
    let id = request.request_id;
    if request.kind != "Client" {
        return unknown(request);
    }

    if request.request != "FullStatus" && request.request != "GetBundleChanges" {
        if let Some(delay) = env.step_delay() {
            tokio::time::sleep(delay).await;
        }
    }

    let result = match request.request.as_str() {
        "FullStatus" => Ok(env.full_status()),
        "GetBundleChanges" => Ok(bundle_changes(request)),
        "AddCharm" => {
            let url = request.param_str("URL").unwrap_or_default();
            env.add_charm(url).map(|_| json!({}))
        }
        "ServiceDeploy" => service_deploy(env, request),
        "AddServiceUnits" => {
            let service = request.param_str("ServiceName").unwrap_or_default();
            unit_count(request, 1)
                .and_then(|count| env.add_units(service, count))
                .map(|units| json!({"Units": units}))
        }
        "AddRelation" => {
            let endpoints: Vec<&str> = request
                .params
                .get("Endpoints")
                .and_then(Value::as_array)
                .map(|eps| eps.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            match endpoints.as_slice() {
                [first, second] => env
                    .add_relation(first, second)
                    .map(|endpoints| json!({"Endpoints": endpoints})),
                _ => Err("a relation needs exactly two endpoints".to_string()),
            }
        }
        "SetAnnotations" => {
            let tag = request.param_str("Tag").unwrap_or_default();
            let service = tag.strip_prefix("service-").unwrap_or(tag);
            let pairs = request
                .params
                .get("Pairs")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            env.set_annotations(service, pairs).map(|_| json!({}))
        }
        _ => return unknown(request),
    };

    match result {
        Ok(response) => ResponseFrame::ok(id, response),
        Err(message) => ResponseFrame::error(id, message, None),
    }
}

fn service_deploy(env: &SandboxEnvironment, request: &RequestFrame) -> Result<Value, String> {
    let name = request.param_str("ServiceName").unwrap_or_default();
    let charm = request.param_str("CharmUrl").unwrap_or_default();
    let config = request
        .params
        .get("Config")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    let units = unit_count(request, 0)?;
    env.deploy_service(name, charm, config)?;
    if units > 0 {
        env.add_units(name, units)?;
    }
    Ok(json!({}))
}

fn unit_count(request: &RequestFrame, default: u64) -> Result<u32, String> {
    let requested = request.param_u64("NumUnits").unwrap_or(default);
    u32::try_from(requested)
        .ok()
        .filter(|&count| count <= MAX_UNITS_PER_SERVICE)
        .ok_or_else(|| format!("cannot add {} units, at most {} are allowed", requested, MAX_UNITS_PER_SERVICE))
}

fn bundle_changes(request: &RequestFrame) -> Value {
    let yaml = request.param_str("YAML").unwrap_or_default();
    match BundleSpec::parse(yaml, None) {
        Ok(bundle) => json!({"Changes": compute_changes(&bundle)}),
        Err(e) => json!({"Errors": [e.to_string()]}),
    }
}

fn unknown(request: &RequestFrame) -> ResponseFrame {
    ResponseFrame::error(
        request.request_id,
        format!("unknown request {}.{}", request.kind, request.request),
        Some(NOT_IMPLEMENTED),
    )
}
