// common/src/models/changes.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One change-set step as computed by the backend's `GetBundleChanges`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub requires: Vec<String>,
}

impl Change {
    pub fn new(id: impl Into<String>, method: &str, args: Vec<Value>, requires: Vec<String>) -> Self {
        Self {
            id: id.into(),
            method: method.to_string(),
            args,
            requires,
        }
    }
}

/// Placeholder referencing the result of an earlier change, e.g. `$deploy-1`.
pub fn placeholder(change_id: &str) -> String {
    format!("${}", change_id)
}
