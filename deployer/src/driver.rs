// deployer/src/driver.rs
//! Background task executing one deployment against its own backend session.
use crate::deployment::DeploymentStatus;
use crate::registry::DeploymentEntry;
use crate::steps::{self, StepCall};
use common::{ApiClient, Backend, Change, Credentials, DeploymentStepError};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

type StepOutcome = (usize, Result<Option<String>, DeploymentStepError>);

/// Drive a deployment from `Started` to a terminal state.
///
/// Steps whose requirements completed are dispatched together; steps
/// depending on a failed one are failed without being sent. Once the
/// deployment is cancelled nothing new is dispatched, but calls already in
/// flight are awaited and their outcome recorded.
pub async fn run(entry: Arc<DeploymentEntry>, backend: Arc<dyn Backend>, credentials: Credentials) {
    let id = entry.id();
    let api = match open_session(backend.as_ref(), &credentials).await {
        Ok(api) => api,
        Err(e) => {
            warn!(deployment = id, error = %e, "cannot open deployment session");
            entry.update(|d| d.finish(Some(e)));
            return;
        }
    };

    let changes = match bundle_changes(&entry, &api).await {
        Ok(changes) => changes,
        Err(e) => {
            entry.update(|d| d.finish(Some(e)));
            return;
        }
    };

    if !entry.update(|d| d.activate(changes)) {
        debug!(deployment = id, "deployment ended before activation");
        return;
    }

    let mut cancel = entry.cancel_signal();
    let mut in_flight = FuturesUnordered::new();
    loop {
        if !*cancel.borrow() {
            for (index, call) in entry.update(dispatch_ready) {
                in_flight.push(run_step(&api, index, call));
            }
        }

        if in_flight.is_empty() {
            break;
        }

        tokio::select! {
            Some((index, outcome)) = in_flight.next() => {
                entry.update(|d| match outcome {
                    Ok(result) => d.step_completed(index, result),
                    Err(e) => d.step_failed(index, e.to_string()),
                });
            }
            changed = cancel.changed(), if !*cancel.borrow() => {
                if changed.is_ok() {
                    info!(deployment = id, pending = in_flight.len(), "cancelled, draining in-flight steps");
                }
            }
            else => break,
        }
    }

    if !*cancel.borrow() {
        entry.update(|d| {
            d.propagate_failures();
            d.fail_stranded();
            let error = d.failure_summary();
            d.finish(error)
        });
    }
}

async fn open_session(backend: &dyn Backend, credentials: &Credentials) -> Result<ApiClient, String> {
    let link = backend
        .connect()
        .await
        .map_err(|e| format!("cannot connect to {}: {}", backend.describe(), e))?;
    let api = ApiClient::new(link);
    api.login(credentials)
        .await
        .map_err(|e| format!("cannot log in to {}: {}", backend.describe(), e))?;
    Ok(api)
}

async fn bundle_changes(entry: &DeploymentEntry, api: &ApiClient) -> Result<Vec<Change>, String> {
    let yaml = entry.read(|d| d.bundle.to_yaml()).map_err(|e| e.to_string())?;
    let response = api
        .call("Client", "GetBundleChanges", json!({ "YAML": yaml }))
        .await
        .map_err(|e| format!("cannot compute bundle changes: {}", e))?;

    if let Some(errors) = response.get("Errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<&str> = errors.iter().filter_map(Value::as_str).collect();
            return Err(format!("invalid bundle: {}", messages.join("; ")));
        }
    }
    let changes = response.get("Changes").cloned().unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(changes).map_err(|e| format!("invalid bundle changes: {}", e))
}

/// Fail doomed steps, then move every ready step to `Running` and return
/// the calls to send. Steps whose arguments cannot be prepared fail here.
fn dispatch_ready(d: &mut crate::Deployment) -> Vec<(usize, StepCall)> {
    // Checked under the lock, so a cancel landing after the driver's own
    // check still stops the dispatch.
    if d.status != DeploymentStatus::Active {
        return Vec::new();
    }
    d.propagate_failures();
    let results = d.results();
    let mut calls = Vec::new();
    for index in d.ready_steps() {
        match steps::prepare(&d.steps[index].change, &results) {
            Ok(call) => {
                if d.step_running(index) {
                    calls.push((index, call));
                }
            }
            Err(e) => {
                d.step_failed(index, e.to_string());
            }
        }
    }
    d.propagate_failures();
    calls
}

async fn run_step(api: &ApiClient, index: usize, call: StepCall) -> StepOutcome {
    (index, steps::execute(api, call).await)
}
