// common/src/models/bundle.rs
//! Declarative bundle specification: services, relations and configuration.
use crate::error::BundleValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Upper bound on the units one service or one call may ask for.
pub const MAX_UNITS_PER_SERVICE: u32 = 1000;

const SERVICE_NAME_PATTERN: &str = r"^[a-z][a-z0-9]*(-[a-z0-9]*[a-z][a-z0-9]*)*$";

fn service_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SERVICE_NAME_PATTERN).expect("service name pattern is valid"))
}

/// A service to instantiate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub charm: String,
    #[serde(default)]
    pub num_units: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// A parsed and validated bundle. Immutable once built through [`BundleSpec::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default)]
    pub relations: Vec<Vec<String>>,
}

/// Service part of a relation endpoint (`wordpress:db` -> `wordpress`).
pub fn endpoint_service(endpoint: &str) -> &str {
    endpoint.split(':').next().unwrap_or(endpoint)
}

/// Machine or service a placement directive points at:
/// `lxc:mysql=0` -> `mysql`, `kvm:2` -> `2`.
pub fn placement_target(placement: &str) -> &str {
    let target = match placement.split_once(':') {
        Some(("lxc" | "kvm", rest)) => rest,
        _ => placement,
    };
    target.split('=').next().unwrap_or(target)
}

impl BundleSpec {
    /// Parse YAML content holding either a single bundle or a basket of named
    /// bundles, select the requested one and validate it.
    pub fn parse(content: &str, name: Option<&str>) -> Result<Self, BundleValidationError> {
        let doc: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| BundleValidationError::Malformed(e.to_string()))?;

        let mapping = doc
            .as_mapping()
            .ok_or_else(|| BundleValidationError::Malformed("bundle must be a mapping".into()))?;

        let selected = if mapping.contains_key("services") {
            doc.clone()
        } else {
            select_from_basket(mapping, name)?
        };

        let bundle: BundleSpec = serde_yaml::from_value(selected)
            .map_err(|e| BundleValidationError::Malformed(e.to_string()))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Check that every reference in the bundle resolves.
    pub fn validate(&self) -> Result<(), BundleValidationError> {
        if self.services.is_empty() {
            return Err(BundleValidationError::NoServices);
        }

        for (name, service) in &self.services {
            if !service_name_regex().is_match(name) {
                return Err(BundleValidationError::InvalidServiceName(name.clone()));
            }
            if service.charm.trim().is_empty() {
                return Err(BundleValidationError::MissingCharm(name.clone()));
            }
            if service.num_units > MAX_UNITS_PER_SERVICE {
                return Err(BundleValidationError::TooManyUnits {
                    service: name.clone(),
                    units: service.num_units,
                    max: MAX_UNITS_PER_SERVICE,
                });
            }
            if let Some(placement) = &service.to {
                self.validate_placement(name, placement)?;
            }
        }

        for relation in &self.relations {
            if relation.len() != 2 {
                return Err(BundleValidationError::InvalidRelation(format!(
                    "expected two endpoints, got [{}]",
                    relation.join(", ")
                )));
            }
            for endpoint in relation {
                let service = endpoint_service(endpoint);
                if !self.services.contains_key(service) {
                    return Err(BundleValidationError::UnknownService {
                        endpoint: endpoint.clone(),
                        service: service.to_string(),
                    });
                }
            }
            if endpoint_service(&relation[0]) == endpoint_service(&relation[1]) {
                return Err(BundleValidationError::InvalidRelation(format!(
                    "service {} cannot be related to itself",
                    endpoint_service(&relation[0])
                )));
            }
        }

        Ok(())
    }

    // Units go to a machine number or next to another service's units.
    fn validate_placement(&self, service: &str, placement: &str) -> Result<(), BundleValidationError> {
        let target = placement_target(placement);
        let is_machine = !target.is_empty() && target.bytes().all(|b| b.is_ascii_digit());
        if is_machine || (target != service && self.services.contains_key(target)) {
            return Ok(());
        }
        Err(BundleValidationError::InvalidPlacement {
            service: service.to_string(),
            placement: placement.to_string(),
        })
    }

    /// Serialize back to YAML, the form the backend's change-set call expects.
    pub fn to_yaml(&self) -> Result<String, BundleValidationError> {
        serde_yaml::to_string(self).map_err(|e| BundleValidationError::Malformed(e.to_string()))
    }
}

fn select_from_basket(
    mapping: &serde_yaml::Mapping,
    name: Option<&str>,
) -> Result<serde_yaml::Value, BundleValidationError> {
    match name {
        Some(name) => mapping
            .get(name)
            .cloned()
            .ok_or_else(|| BundleValidationError::UnknownBundle(name.to_string())),
        None => {
            let mut bundles = mapping.values();
            match (bundles.next(), bundles.next()) {
                (Some(only), None) => Ok(only.clone()),
                (None, _) => Err(BundleValidationError::NoServices),
                _ => Err(BundleValidationError::AmbiguousBundle),
            }
        }
    }
}
