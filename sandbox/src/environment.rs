// sandbox/src/environment.rs
use dashmap::{DashMap, DashSet};
use serde_json::{json, Map, Value};
use std::sync::Mutex;
use std::time::Duration;

/// A simulated service and its units.
#[derive(Debug, Clone)]
struct ServiceData {
    charm: String,
    config: Map<String, Value>,
    units: Vec<String>,
    next_unit: u32,
    annotations: Map<String, Value>,
}

/// Process-wide state of the simulated environment, shared by every sandbox
/// connection.
pub struct SandboxEnvironment {
    users: DashMap<String, String>,
    charms: DashSet<String>,
    services: DashMap<String, ServiceData>,
    // Keyed by the sorted endpoint pair.
    relations: DashMap<(String, String), ()>,
    failing_charms: DashSet<String>,
    step_delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl Default for SandboxEnvironment {
    fn default() -> Self {
        Self::new("user-admin", "sandbox")
    }
}

impl SandboxEnvironment {
    pub fn new(user: &str, password: &str) -> Self {
        let users = DashMap::new();
        users.insert(user.to_string(), password.to_string());
        Self {
            users,
            charms: DashSet::new(),
            services: DashMap::new(),
            relations: DashMap::new(),
            failing_charms: DashSet::new(),
            step_delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make `Client.AddCharm` fail for the given charm URL.
    pub fn with_failing_charm(self, charm: &str) -> Self {
        self.failing_charms.insert(charm.to_string());
        self
    }

    /// Delay every environment-changing call, to keep steps in flight.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn step_delay(&self) -> Option<Duration> {
        self.step_delay
    }

    pub fn authenticate(&self, user: &str, password: &str) -> bool {
        self.users
            .get(user)
            .map_or(false, |expected| !password.is_empty() && *expected == password)
    }

    /// Record a handled request as `Type.Request`.
    pub fn record_call(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    /// Every request handled so far, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn add_charm(&self, url: &str) -> Result<(), String> {
        if self.failing_charms.contains(url) {
            return Err(format!("cannot retrieve charm {}: charm not found", url));
        }
        self.charms.insert(url.to_string());
        tracing::debug!("Sandbox charm added: {}", url);
        Ok(())
    }

    pub fn deploy_service(&self, name: &str, charm: &str, config: Map<String, Value>) -> Result<(), String> {
        if !self.charms.contains(charm) {
            return Err(format!("charm {} has not been added", charm));
        }
        if self.services.contains_key(name) {
            return Err(format!("service {} already exists", name));
        }
        self.services.insert(
            name.to_string(),
            ServiceData {
                charm: charm.to_string(),
                config,
                units: Vec::new(),
                next_unit: 0,
                annotations: Map::new(),
            },
        );
        tracing::info!("Sandbox service deployed: {} ({})", name, charm);
        Ok(())
    }

    pub fn add_units(&self, service: &str, count: u32) -> Result<Vec<String>, String> {
        let mut entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| format!("service {} not found", service))?;
        let data = entry.value_mut();
        let mut added = Vec::new();
        for _ in 0..count {
            let unit = format!("{}/{}", service, data.next_unit);
            data.next_unit += 1;
            data.units.push(unit.clone());
            added.push(unit);
        }
        Ok(added)
    }

    pub fn add_relation(&self, first: &str, second: &str) -> Result<Value, String> {
        let mut endpoints = Map::new();
        for endpoint in [first, second] {
            let mut parts = endpoint.splitn(2, ':');
            let service = parts.next().unwrap_or_default();
            let relation = parts.next().unwrap_or(service);
            if !self.services.contains_key(service) {
                return Err(format!("service {} not found", service));
            }
            endpoints.insert(service.to_string(), json!({"Name": relation}));
        }

        let key = if first <= second {
            (first.to_string(), second.to_string())
        } else {
            (second.to_string(), first.to_string())
        };
        if self.relations.contains_key(&key) {
            return Err(format!("relation {} {} already exists", key.0, key.1));
        }
        self.relations.insert(key, ());
        Ok(Value::Object(endpoints))
    }

    pub fn set_annotations(&self, service: &str, pairs: Map<String, Value>) -> Result<(), String> {
        let mut entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| format!("service {} not found", service))?;
        entry.value_mut().annotations.extend(pairs);
        Ok(())
    }

    pub fn service_units(&self, service: &str) -> Option<Vec<String>> {
        self.services.get(service).map(|s| s.units.clone())
    }

    /// Snapshot answered to `Client.FullStatus`.
    pub fn full_status(&self) -> Value {
        let mut services = Map::new();
        for entry in self.services.iter() {
            let data = entry.value();
            services.insert(
                entry.key().clone(),
                json!({
                    "Charm": data.charm,
                    "Config": data.config,
                    "Units": data.units,
                    "Annotations": data.annotations,
                }),
            );
        }
        let relations: Vec<Value> = self
            .relations
            .iter()
            .map(|entry| json!([entry.key().0, entry.key().1]))
            .collect();
        json!({"Services": services, "Relations": relations})
    }
}
