// deployer/src/steps.rs
//! Translation of change-set steps into backend calls.
use common::{ApiClient, Change, DeploymentStepError};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// A step ready to be sent: placeholders resolved, request chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCall {
    pub method: String,
    pub request: &'static str,
    pub params: Value,
    /// Result known before the call is made (charm URL, service name).
    known_result: Option<String>,
}

/// Resolve placeholders in `change` against the results of completed
/// changes and build the backend request for it.
pub fn prepare(change: &Change, results: &HashMap<String, String>) -> Result<StepCall, DeploymentStepError> {
    let args = change
        .args
        .iter()
        .map(|arg| resolve(arg, results))
        .collect::<Result<Vec<Value>, _>>()?;
    let method = change.method.as_str();
    let invalid = |reason: &str| DeploymentStepError::InvalidArgs {
        method: method.to_string(),
        reason: reason.to_string(),
    };
    let string_arg = |index: usize, name: &str| -> Result<String, DeploymentStepError> {
        args.get(index)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid(&format!("missing {}", name)))
    };

    let (request, params, known_result) = match method {
        "addCharm" => {
            let url = string_arg(0, "charm url")?;
            ("AddCharm", json!({"URL": url}), Some(url))
        }
        "deploy" => {
            let charm = string_arg(0, "charm url")?;
            let service = string_arg(1, "service name")?;
            let config = match args.get(2) {
                None | Some(Value::Null) => Value::Object(Map::new()),
                Some(Value::Object(options)) => Value::Object(options.clone()),
                Some(_) => return Err(invalid("options must be a mapping")),
            };
            (
                "ServiceDeploy",
                json!({"CharmUrl": charm, "ServiceName": service, "Config": config, "NumUnits": 0}),
                Some(service),
            )
        }
        "addUnit" => {
            let service = string_arg(0, "service name")?;
            let count = args.get(1).and_then(Value::as_u64).unwrap_or(1);
            let mut params = json!({"ServiceName": service, "NumUnits": count});
            if let Some(to) = args.get(2).and_then(Value::as_str) {
                params["ToMachineSpec"] = json!(to);
            }
            ("AddServiceUnits", params, None)
        }
        "addRelation" => {
            let first = string_arg(0, "first endpoint")?;
            let second = string_arg(1, "second endpoint")?;
            ("AddRelation", json!({"Endpoints": [first, second]}), None)
        }
        "setAnnotations" => {
            let entity = string_arg(0, "entity")?;
            let kind = string_arg(1, "entity type")?;
            let pairs = args.get(2).cloned().unwrap_or_else(|| json!({}));
            ("SetAnnotations", json!({"Tag": format!("{}-{}", kind, entity), "Pairs": pairs}), None)
        }
        other => return Err(DeploymentStepError::UnsupportedMethod(other.to_string())),
    };

    Ok(StepCall {
        method: method.to_string(),
        request,
        params,
        known_result,
    })
}

/// Send the call and return the value later steps refer to.
pub async fn execute(api: &ApiClient, call: StepCall) -> Result<Option<String>, DeploymentStepError> {
    let response = api
        .call("Client", call.request, call.params)
        .await
        .map_err(|source| DeploymentStepError::Call {
            method: call.method.clone(),
            source,
        })?;

    if call.request == "AddServiceUnits" {
        let unit = response
            .get("Units")
            .and_then(Value::as_array)
            .and_then(|units| units.first())
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(unit);
    }
    Ok(call.known_result)
}

/// Replace `$<id>` and `$<id>:<suffix>` strings, recursing into arrays and
/// objects.
fn resolve(value: &Value, results: &HashMap<String, String>) -> Result<Value, DeploymentStepError> {
    match value {
        Value::String(s) if s.starts_with('$') => {
            let reference = &s[1..];
            let (id, suffix) = match reference.split_once(':') {
                Some((id, suffix)) => (id, Some(suffix)),
                None => (reference, None),
            };
            let resolved = results
                .get(id)
                .ok_or_else(|| DeploymentStepError::UnresolvedPlaceholder(s.clone()))?;
            Ok(Value::String(match suffix {
                Some(suffix) => format!("{}:{}", resolved, suffix),
                None => resolved.clone(),
            }))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, results))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve(v, results).map(|v| (k.clone(), v)))
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results() -> HashMap<String, String> {
        HashMap::from([
            ("addCharm-0".to_string(), "cs:trusty/mysql-1".to_string()),
            ("deploy-1".to_string(), "mysql".to_string()),
            ("deploy-2".to_string(), "wordpress".to_string()),
        ])
    }

    #[test]
    fn test_deploy_resolves_charm() {
        let change = Change::new(
            "deploy-1",
            "deploy",
            vec![json!("$addCharm-0"), json!("mysql"), json!({"port": 3306})],
            vec!["addCharm-0".into()],
        );
        let call = prepare(&change, &results()).unwrap();
        assert_eq!(call.request, "ServiceDeploy");
        assert_eq!(call.params["CharmUrl"], "cs:trusty/mysql-1");
        assert_eq!(call.params["Config"]["port"], 3306);
        assert_eq!(call.known_result.as_deref(), Some("mysql"));
    }

    #[test]
    fn test_relation_keeps_endpoint_suffix() {
        let change = Change::new(
            "addRelation-3",
            "addRelation",
            vec![json!("$deploy-2:db"), json!("$deploy-1:server")],
            vec![],
        );
        let call = prepare(&change, &results()).unwrap();
        assert_eq!(call.params["Endpoints"], json!(["wordpress:db", "mysql:server"]));
    }

    #[test]
    fn test_unresolved_placeholder() {
        let change = Change::new("addUnit-4", "addUnit", vec![json!("$deploy-9")], vec![]);
        assert_eq!(
            prepare(&change, &results()).unwrap_err(),
            DeploymentStepError::UnresolvedPlaceholder("$deploy-9".into())
        );
    }

    #[test]
    fn test_unsupported_method_and_bad_args() {
        let change = Change::new("x-1", "destroyEnvironment", vec![], vec![]);
        assert!(matches!(
            prepare(&change, &results()),
            Err(DeploymentStepError::UnsupportedMethod(_))
        ));
        let change = Change::new("addCharm-1", "addCharm", vec![json!(42)], vec![]);
        assert!(matches!(
            prepare(&change, &results()),
            Err(DeploymentStepError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_annotations_tag() {
        let change = Change::new(
            "setAnnotations-5",
            "setAnnotations",
            vec![json!("$deploy-1"), json!("service"), json!({"gui-x": "10"})],
            vec![],
        );
        let call = prepare(&change, &results()).unwrap();
        assert_eq!(call.params["Tag"], "service-mysql");
    }
}
