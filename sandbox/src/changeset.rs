// sandbox/src/changeset.rs
//! Change-set computation, as the backend's `GetBundleChanges` does it.
use common::models::bundle::endpoint_service;
use common::models::changes::placeholder;
use common::{BundleSpec, Change};
use serde_json::{json, Value};
use std::collections::HashMap;

struct Ids {
    next: usize,
}

impl Ids {
    fn next(&mut self, method: &str) -> String {
        let id = format!("{}-{}", method, self.next);
        self.next += 1;
        id
    }
}

/// Compute the ordered change set needed to instantiate `bundle`.
///
/// Charms come first, then services, annotations, relations and finally
/// units; every change lists the changes it depends on.
pub fn compute_changes(bundle: &BundleSpec) -> Vec<Change> {
    let mut ids = Ids { next: 0 };
    let mut changes = Vec::new();

    let mut charm_changes: HashMap<&str, String> = HashMap::new();
    for service in bundle.services.values() {
        if charm_changes.contains_key(service.charm.as_str()) {
            continue;
        }
        let id = ids.next("addCharm");
        changes.push(Change::new(id.clone(), "addCharm", vec![json!(service.charm)], vec![]));
        charm_changes.insert(service.charm.as_str(), id);
    }

    let mut deploy_changes: HashMap<&str, String> = HashMap::new();
    for (name, service) in &bundle.services {
        let charm_id = &charm_changes[service.charm.as_str()];
        let id = ids.next("deploy");
        changes.push(Change::new(
            id.clone(),
            "deploy",
            vec![json!(placeholder(charm_id)), json!(name), json!(service.options)],
            vec![charm_id.clone()],
        ));
        deploy_changes.insert(name.as_str(), id);
    }

    for (name, service) in &bundle.services {
        if service.annotations.is_empty() {
            continue;
        }
        let deploy_id = &deploy_changes[name.as_str()];
        changes.push(Change::new(
            ids.next("setAnnotations"),
            "setAnnotations",
            vec![json!(placeholder(deploy_id)), json!("service"), json!(service.annotations)],
            vec![deploy_id.clone()],
        ));
    }

    for relation in &bundle.relations {
        let mut args = Vec::new();
        let mut requires = Vec::new();
        for endpoint in relation {
            let service = endpoint_service(endpoint);
            let deploy_id = &deploy_changes[service];
            let arg = match endpoint.split_once(':') {
                Some((_, name)) => format!("{}:{}", placeholder(deploy_id), name),
                None => placeholder(deploy_id),
            };
            args.push(Value::String(arg));
            requires.push(deploy_id.clone());
        }
        changes.push(Change::new(ids.next("addRelation"), "addRelation", args, requires));
    }

    for (name, service) in &bundle.services {
        let deploy_id = &deploy_changes[name.as_str()];
        for _ in 0..service.num_units {
            let to = service.to.clone().map_or(Value::Null, Value::String);
            changes.push(Change::new(
                ids.next("addUnit"),
                "addUnit",
                vec![json!(placeholder(deploy_id)), json!(1), to],
                vec![deploy_id.clone()],
            ));
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_for_related_services() {
        let bundle = BundleSpec::parse(
            r#"
services:
  mysql: {charm: "cs:mysql", num_units: 1}
  wordpress: {charm: "cs:wordpress", num_units: 2, annotations: {gui-x: "10"}}
relations:
  - ["wordpress:db", "mysql:server"]
"#,
            None,
        )
        .unwrap();

        let changes = compute_changes(&bundle);
        let methods: Vec<&str> = changes.iter().map(|c| c.method.as_str()).collect();
        assert_eq!(
            methods,
            vec![
                "addCharm", "addCharm", "deploy", "deploy", "setAnnotations", "addRelation",
                "addUnit", "addUnit", "addUnit"
            ]
        );

        // Services are ordered by name: mysql is deploy-2, wordpress deploy-3.
        let relation = &changes[5];
        assert_eq!(relation.args, vec![json!("$deploy-3:db"), json!("$deploy-2:server")]);
        assert_eq!(relation.requires, vec!["deploy-3", "deploy-2"]);
        assert_eq!(changes[2].requires, vec!["addCharm-0"]);
    }

    #[test]
    fn test_shared_charm_added_once() {
        let bundle = BundleSpec::parse(
            "services:\n  a: {charm: \"cs:x\"}\n  b: {charm: \"cs:x\"}\n",
            None,
        )
        .unwrap();
        let changes = compute_changes(&bundle);
        assert_eq!(changes.iter().filter(|c| c.method == "addCharm").count(), 1);
        assert_eq!(changes.len(), 3);
    }
}
