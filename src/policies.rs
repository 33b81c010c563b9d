use serde_json::{json, Map, Value};
use structopt::StructOpt;

use crate::error::{Error, Result};
use crate::request::{require_index, EsRequest};

/// Phases of a generated lifecycle policy. The hot phase is always present;
/// the others only when their age is set.
#[derive(Debug, StructOpt, Clone, PartialEq)]
pub struct PhaseOptions {
    /// Roll over the write index after this age
    #[structopt(long, default_value = "1d")]
    pub rollover_max_age: String,
    /// Roll over when a primary shard reaches this size
    #[structopt(long, default_value = "50gb")]
    pub rollover_max_size: String,
    /// Enter the warm phase after this age
    #[structopt(long)]
    pub warm_after: Option<String>,
    /// Replica count once warm
    #[structopt(long)]
    pub warm_replicas: Option<u32>,
    /// Enter the cold phase after this age
    #[structopt(long)]
    pub cold_after: Option<String>,
    /// Delete indices after this age
    #[structopt(long)]
    pub delete_after: Option<String>,
}

impl Default for PhaseOptions {
    fn default() -> Self {
        PhaseOptions {
            rollover_max_age: "1d".to_string(),
            rollover_max_size: "50gb".to_string(),
            warm_after: None,
            warm_replicas: None,
            cold_after: None,
            delete_after: None,
        }
    }
}

impl PhaseOptions {
    pub fn policy_body(&self) -> Value {
        let mut phases = Map::new();
        phases.insert(
            "hot".to_string(),
            json!({
                "min_age": "0ms",
                "actions": {
                    "rollover": {
                        "max_age": self.rollover_max_age,
                        "max_primary_shard_size": self.rollover_max_size
                    },
                    "set_priority": { "priority": 100 }
                }
            }),
        );
        if let Some(age) = &self.warm_after {
            let mut actions = json!({
                "forcemerge": { "max_num_segments": 1 },
                "set_priority": { "priority": 50 }
            });
            if let Some(replicas) = self.warm_replicas {
                actions["allocate"] = json!({ "number_of_replicas": replicas });
            }
            phases.insert("warm".to_string(), json!({ "min_age": age, "actions": actions }));
        }
        if let Some(age) = &self.cold_after {
            phases.insert(
                "cold".to_string(),
                json!({
                    "min_age": age,
                    "actions": {
                        "readonly": {},
                        "set_priority": { "priority": 0 }
                    }
                }),
            );
        }
        if let Some(age) = &self.delete_after {
            phases.insert(
                "delete".to_string(),
                json!({ "min_age": age, "actions": { "delete": {} } }),
            );
        }
        json!({ "policy": { "phases": Value::Object(phases) } })
    }
}

/// Index lifecycle management calls.
#[derive(Debug, StructOpt, Clone, PartialEq)]
#[structopt(rename_all = "kebab-case")]
pub enum PolicyAction {
    List,
    Get { name: String },
    /// Create or replace a policy
    Create {
        name: String,
        #[structopt(flatten)]
        phases: PhaseOptions,
    },
    Delete { name: String },
    /// Lifecycle step of each index
    Explain { index: String },
    /// Manage an existing index with a policy
    Attach { index: String, name: String },
    Status,
    Start,
    Stop,
}

impl PolicyAction {
    pub fn request(&self) -> Result<EsRequest> {
        let req = match self {
            PolicyAction::List => EsRequest::get("/_ilm/policy"),
            PolicyAction::Get { name } => EsRequest::get(format!("/_ilm/policy/{}", policy_name(name)?)),
            PolicyAction::Create { name, phases } => {
                EsRequest::put_json(format!("/_ilm/policy/{}", policy_name(name)?), phases.policy_body())
            }
            PolicyAction::Delete { name } => EsRequest::delete(format!("/_ilm/policy/{}", policy_name(name)?)),
            PolicyAction::Explain { index } => EsRequest::get(format!("/{}/_ilm/explain", require_index(index)?)),
            PolicyAction::Attach { index, name } => EsRequest::put_json(
                format!("/{}/_settings", require_index(index)?),
                json!({ "index.lifecycle.name": policy_name(name)? }),
            ),
            PolicyAction::Status => EsRequest::get("/_ilm/status"),
            PolicyAction::Start => EsRequest::post("/_ilm/start"),
            PolicyAction::Stop => EsRequest::post("/_ilm/stop"),
        };
        Ok(req)
    }
}

fn policy_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidArgument("policy name must not be empty".to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    #[test]
    fn crud_paths() {
        assert_eq!(PolicyAction::List.request().unwrap(), EsRequest::get("/_ilm/policy"));
        assert_eq!(
            PolicyAction::Get { name: "logs".to_string() }.request().unwrap(),
            EsRequest::get("/_ilm/policy/logs")
        );
        let req = PolicyAction::Delete { name: "logs".to_string() }.request().unwrap();
        assert_eq!(req.method, Method::DELETE);
        assert_eq!(req.path, "/_ilm/policy/logs");
        assert!(PolicyAction::Get { name: "".to_string() }.request().is_err());
    }

    #[test]
    fn hot_only_policy() {
        let req = PolicyAction::Create {
            name: "hot".to_string(),
            phases: PhaseOptions::default(),
        }
        .request()
        .unwrap();
        assert_eq!(req.method, Method::PUT);
        assert_eq!(req.path, "/_ilm/policy/hot");
        assert_eq!(
            req.body,
            Some(json!({
                "policy": {
                    "phases": {
                        "hot": {
                            "min_age": "0ms",
                            "actions": {
                                "rollover": { "max_age": "1d", "max_primary_shard_size": "50gb" },
                                "set_priority": { "priority": 100 }
                            }
                        }
                    }
                }
            }))
        );
    }

    #[test]
    fn all_phases() {
        let phases = PhaseOptions {
            warm_after: Some("7d".to_string()),
            warm_replicas: Some(0),
            cold_after: Some("30d".to_string()),
            delete_after: Some("90d".to_string()),
            ..PhaseOptions::default()
        };
        let body = phases.policy_body();
        let phases = &body["policy"]["phases"];
        assert_eq!(phases["warm"]["min_age"], "7d");
        assert_eq!(phases["warm"]["actions"]["forcemerge"]["max_num_segments"], 1);
        assert_eq!(phases["warm"]["actions"]["allocate"]["number_of_replicas"], 0);
        assert_eq!(phases["cold"]["min_age"], "30d");
        assert_eq!(phases["cold"]["actions"]["readonly"], json!({}));
        assert_eq!(phases["delete"], json!({"min_age": "90d", "actions": {"delete": {}}}));
    }

    #[test]
    fn warm_without_replica_change() {
        let body = PhaseOptions {
            warm_after: Some("2d".to_string()),
            ..PhaseOptions::default()
        }
        .policy_body();
        assert!(body["policy"]["phases"]["warm"]["actions"].get("allocate").is_none());
        assert!(body["policy"]["phases"].get("cold").is_none());
    }

    #[test]
    fn index_level_calls() {
        assert_eq!(
            PolicyAction::Explain { index: "logs-*".to_string() }.request().unwrap().path,
            "/logs-*/_ilm/explain"
        );
        let req = PolicyAction::Attach {
            index: "logs-000001".to_string(),
            name: "logs".to_string(),
        }
        .request()
        .unwrap();
        assert_eq!(req.path, "/logs-000001/_settings");
        assert_eq!(req.body, Some(json!({"index.lifecycle.name": "logs"})));
    }

    #[test]
    fn ilm_service_toggles() {
        assert_eq!(PolicyAction::Status.request().unwrap(), EsRequest::get("/_ilm/status"));
        assert_eq!(PolicyAction::Start.request().unwrap(), EsRequest::post("/_ilm/start"));
        assert_eq!(PolicyAction::Stop.request().unwrap(), EsRequest::post("/_ilm/stop"));
    }

    #[test]
    fn parses_phase_flags() {
        let action = PolicyAction::from_iter(vec![
            "policy",
            "create",
            "logs",
            "--warm-after",
            "7d",
            "--delete-after",
            "30d",
        ]);
        match action {
            PolicyAction::Create { name, phases } => {
                assert_eq!(name, "logs");
                assert_eq!(phases.warm_after.as_deref(), Some("7d"));
                assert_eq!(phases.delete_after.as_deref(), Some("30d"));
                assert_eq!(phases.rollover_max_age, "1d");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }
}
