// deployer/src/deployment.rs
//! Deployment state machine: `Started -> Active -> Finished | Cancelled`,
//! with every change-set step going `Queued -> Running -> Completed | Failed`.
use chrono::{DateTime, Utc};
use common::{BundleSpec, Change, DeploymentStepError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type DeploymentId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Started,
    Active,
    Finished,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Finished | DeploymentStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// One change-set step and what happened to it.
#[derive(Debug, Clone)]
pub struct Step {
    pub change: Change,
    pub status: StepStatus,
    /// Value substituted for `$<id>` placeholders in later steps.
    pub result: Option<String>,
    pub error: Option<String>,
    /// Whether the step was ever dispatched to the backend.
    pub dispatched: bool,
}

/// Step details carried by a status event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepEvent {
    pub id: String,
    pub method: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One status update pushed to watchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusEvent {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<StepEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status report returned to `Status` queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentSummary {
    pub deployment_id: DeploymentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: DeploymentStatus,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: DeploymentId,
    pub owner: Uuid,
    pub name: Option<String>,
    pub bundle: BundleSpec,
    pub status: DeploymentStatus,
    pub error: Option<String>,
    pub steps: Vec<Step>,
    pub events: Vec<StatusEvent>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(id: DeploymentId, owner: Uuid, bundle: BundleSpec, name: Option<String>) -> Self {
        let mut deployment = Self {
            id,
            owner,
            name,
            bundle,
            status: DeploymentStatus::Started,
            error: None,
            steps: Vec::new(),
            events: Vec::new(),
            created_at: Utc::now(),
        };
        deployment.push_event(None);
        deployment
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Install the change set computed by the backend and go `Active`.
    pub fn activate(&mut self, changes: Vec<Change>) -> bool {
        if self.status != DeploymentStatus::Started {
            debug!(deployment = self.id, status = ?self.status, "not activating");
            return false;
        }
        self.steps = changes
            .into_iter()
            .map(|change| Step {
                change,
                status: StepStatus::Queued,
                result: None,
                error: None,
                dispatched: false,
            })
            .collect();
        self.status = DeploymentStatus::Active;
        info!(deployment = self.id, steps = self.steps.len(), "deployment active");
        self.push_event(None);
        true
    }

    /// Queued steps whose requirements all completed, in change-set order.
    /// Only an active deployment has ready steps.
    pub fn ready_steps(&self) -> Vec<usize> {
        if self.status != DeploymentStatus::Active {
            return Vec::new();
        }
        let by_id = self.index_by_id();
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.status == StepStatus::Queued)
            .filter(|(_, step)| {
                step.change.requires.iter().all(|req| {
                    by_id
                        .get(req.as_str())
                        .map_or(false, |&i| self.steps[i].status == StepStatus::Completed)
                })
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Fail every queued step that depends, directly or not, on a failed or
    /// unknown change. Returns how many steps were failed.
    pub fn propagate_failures(&mut self) -> usize {
        let mut failed = 0;
        loop {
            let doomed: Vec<(usize, String)> = {
                let by_id = self.index_by_id();
                self.steps
                    .iter()
                    .enumerate()
                    .filter(|(_, step)| step.status == StepStatus::Queued)
                    .filter_map(|(i, step)| {
                        step.change
                            .requires
                            .iter()
                            .find(|req| {
                                by_id
                                    .get(req.as_str())
                                    .map_or(true, |&j| self.steps[j].status == StepStatus::Failed)
                            })
                            .map(|req| (i, req.clone()))
                    })
                    .collect()
            };

            if doomed.is_empty() {
                return failed;
            }
            for (i, req) in doomed {
                let reason = DeploymentStepError::DependencyFailed(req).to_string();
                self.set_step(i, StepStatus::Failed, None, Some(reason));
                failed += 1;
            }
        }
    }

    pub fn step_running(&mut self, index: usize) -> bool {
        let ok = self.set_step(index, StepStatus::Running, None, None);
        if ok {
            self.steps[index].dispatched = true;
        }
        ok
    }

    pub fn step_completed(&mut self, index: usize, result: Option<String>) -> bool {
        self.set_step(index, StepStatus::Completed, result, None)
    }

    pub fn step_failed(&mut self, index: usize, error: String) -> bool {
        self.set_step(index, StepStatus::Failed, None, Some(error))
    }

    fn set_step(&mut self, index: usize, status: StepStatus, result: Option<String>, error: Option<String>) -> bool {
        let Some(step) = self.steps.get_mut(index) else {
            error!(deployment = self.id, index, "no such step");
            return false;
        };

        // Nothing starts once the deployment ended; in-flight steps still land.
        let allowed = match (step.status, status) {
            (StepStatus::Queued, StepStatus::Running) => self.status == DeploymentStatus::Active,
            (StepStatus::Queued, StepStatus::Failed)
            | (StepStatus::Running, StepStatus::Completed)
            | (StepStatus::Running, StepStatus::Failed) => true,
            _ => false,
        };
        if !allowed {
            error!(
                deployment = self.id,
                step = %step.change.id,
                from = ?step.status,
                to = ?status,
                "invalid step transition"
            );
            return false;
        }

        step.status = status;
        step.result = result;
        step.error = error;
        let event = StepEvent {
            id: step.change.id.clone(),
            method: step.change.method.clone(),
            status,
            error: step.error.clone(),
        };
        match status {
            StepStatus::Failed => warn!(
                deployment = self.id,
                step = %event.id,
                error = event.error.as_deref().unwrap_or_default(),
                "step failed"
            ),
            _ => debug!(deployment = self.id, step = %event.id, status = ?status, "step updated"),
        }

        // Steps finishing after a cancellation are recorded but not announced.
        if !self.is_terminal() {
            self.push_event(Some(event));
        }
        true
    }

    /// Results of completed steps, keyed by change id.
    pub fn results(&self) -> HashMap<String, String> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .filter_map(|step| step.result.clone().map(|r| (step.change.id.clone(), r)))
            .collect()
    }

    /// Fail steps that can never run (e.g. requirement cycles).
    pub fn fail_stranded(&mut self) -> usize {
        let stranded: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.status == StepStatus::Queued)
            .map(|(i, _)| i)
            .collect();
        for &i in &stranded {
            self.set_step(i, StepStatus::Failed, None, Some("requirements cannot be satisfied".into()));
        }
        stranded.len()
    }

    /// Summary of failed steps, if any.
    pub fn failure_summary(&self) -> Option<String> {
        let failed: Vec<&str> = self
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Failed)
            .map(|step| step.change.id.as_str())
            .collect();
        if failed.is_empty() {
            None
        } else {
            Some(format!("{} change(s) failed: {}", failed.len(), failed.join(", ")))
        }
    }

    pub fn finish(&mut self, error: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = DeploymentStatus::Finished;
        self.error = error;
        match &self.error {
            Some(e) => warn!(deployment = self.id, error = %e, "deployment finished with errors"),
            None => info!(deployment = self.id, "deployment finished"),
        }
        self.push_event(None);
        true
    }

    /// Mark the deployment cancelled. No-op on terminal deployments.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = DeploymentStatus::Cancelled;
        info!(deployment = self.id, "deployment cancelled");
        self.push_event(None);
        true
    }

    pub fn step(&self, change_id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.change.id == change_id)
    }

    pub fn summary(&self) -> DeploymentSummary {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();
        DeploymentSummary {
            deployment_id: self.id,
            name: self.name.clone(),
            status: self.status,
            time: self.events.last().map_or(self.created_at, |e| e.time),
            error: self.error.clone(),
            queued: count(StepStatus::Queued),
            running: count(StepStatus::Running),
            completed: count(StepStatus::Completed),
            failed: count(StepStatus::Failed),
        }
    }

    fn index_by_id(&self) -> HashMap<&str, usize> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.change.id.as_str(), i))
            .collect()
    }

    fn push_event(&mut self, step: Option<StepEvent>) {
        self.events.push(StatusEvent {
            deployment_id: self.id,
            status: self.status,
            time: Utc::now(),
            step,
            error: self.error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle() -> BundleSpec {
        BundleSpec::parse("services:\n  mysql: {charm: \"cs:mysql\"}\n", None).unwrap()
    }

    fn change(id: &str, requires: &[&str]) -> Change {
        Change::new(id, "addCharm", vec![json!("cs:x")], requires.iter().map(|r| r.to_string()).collect())
    }

    fn deployment(changes: Vec<Change>) -> Deployment {
        let mut d = Deployment::new(1, Uuid::new_v4(), bundle(), None);
        assert!(d.activate(changes));
        d
    }

    #[test]
    fn test_ready_steps_follow_requirements() {
        let mut d = deployment(vec![change("a", &[]), change("b", &["a"]), change("c", &[])]);
        assert_eq!(d.ready_steps(), vec![0, 2]);

        assert!(d.step_running(0));
        assert!(d.step_completed(0, Some("cs:x".into())));
        assert_eq!(d.ready_steps(), vec![1, 2]);
        assert_eq!(d.results()["a"], "cs:x");
    }

    #[test]
    fn test_failure_propagates_transitively() {
        let mut d = deployment(vec![
            change("a", &[]),
            change("b", &["a"]),
            change("c", &["b"]),
            change("d", &[]),
        ]);
        d.step_running(0);
        d.step_failed(0, "boom".into());
        assert_eq!(d.propagate_failures(), 2);

        assert_eq!(d.steps[1].status, StepStatus::Failed);
        assert_eq!(d.steps[2].status, StepStatus::Failed);
        assert!(!d.steps[1].dispatched);
        assert_eq!(d.steps[1].error.as_deref(), Some("required change a failed"));
        assert_eq!(d.steps[3].status, StepStatus::Queued);
    }

    #[test]
    fn test_unknown_requirement_fails_step() {
        let mut d = deployment(vec![change("a", &["ghost"])]);
        assert!(d.ready_steps().is_empty());
        assert_eq!(d.propagate_failures(), 1);
    }

    #[test]
    fn test_invalid_transitions_are_refused() {
        let mut d = deployment(vec![change("a", &[])]);
        assert!(!d.step_completed(0, None));
        assert!(d.step_running(0));
        assert!(!d.step_running(0));
        assert!(!d.step_failed(7, "missing".into()));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut d = deployment(vec![change("a", &[])]);
        assert!(d.finish(None));
        assert!(!d.cancel());
        assert_eq!(d.status, DeploymentStatus::Finished);

        let mut d = deployment(vec![change("a", &[])]);
        assert!(d.cancel());
        assert!(!d.finish(None));
        assert!(!d.activate(vec![]));
        assert_eq!(d.status, DeploymentStatus::Cancelled);
    }

    #[test]
    fn test_nothing_starts_after_cancel() {
        let mut d = deployment(vec![change("a", &[]), change("b", &[])]);
        assert!(d.step_running(0));
        assert!(d.cancel());

        assert!(d.ready_steps().is_empty());
        assert!(!d.step_running(1));
        assert_eq!(d.steps[1].status, StepStatus::Queued);
        assert!(!d.steps[1].dispatched);
        assert!(d.step_completed(0, None));
    }

    #[test]
    fn test_steps_after_cancel_are_recorded_silently() {
        let mut d = deployment(vec![change("a", &[])]);
        d.step_running(0);
        let events = d.events.len();
        d.cancel();
        assert!(d.step_completed(0, None));
        assert_eq!(d.steps[0].status, StepStatus::Completed);
        assert_eq!(d.events.len(), events + 1);
        assert_eq!(d.events.last().unwrap().status, DeploymentStatus::Cancelled);
    }

    #[test]
    fn test_event_serialization() {
        let d = deployment(vec![change("a", &[])]);
        let value = serde_json::to_value(d.events.last().unwrap()).unwrap();
        assert_eq!(value["DeploymentId"], 1);
        assert_eq!(value["Status"], "active");
        assert!(value.get("Step").is_none());
    }
}
