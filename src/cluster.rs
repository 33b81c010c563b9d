use std::fmt;
use std::str::FromStr;

use serde_json::{json, Map, Value};
use structopt::StructOpt;

use crate::error::{Error, Result};
use crate::request::EsRequest;

const RECOVERY_RATE: &str = "indices.recovery.max_bytes_per_sec";
const CONCURRENT_RECOVERIES: &str = "cluster.routing.allocation.node_concurrent_recoveries";
const ALLOCATION_ENABLE: &str = "cluster.routing.allocation.enable";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AllocationMode {
    All,
    Primaries,
    NewPrimaries,
    None,
}

impl FromStr for AllocationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(AllocationMode::All),
            "primaries" => Ok(AllocationMode::Primaries),
            "new_primaries" => Ok(AllocationMode::NewPrimaries),
            "none" => Ok(AllocationMode::None),
            other => Err(Error::InvalidArgument(format!("unknown allocation mode: {}", other))),
        }
    }
}

impl fmt::Display for AllocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocationMode::All => "all",
            AllocationMode::Primaries => "primaries",
            AllocationMode::NewPrimaries => "new_primaries",
            AllocationMode::None => "none",
        };
        f.write_str(s)
    }
}

#[derive(Debug, StructOpt, Clone, PartialEq)]
#[structopt(rename_all = "kebab-case")]
pub enum ClusterAction {
    Health,
    /// Persistent and transient settings, flattened
    Settings,
    /// Cluster state, optionally restricted to one metric (metadata, routing_table, ...)
    State { metric: Option<String> },
    Stats,
    /// Limit recovery bandwidth per node, e.g. `100mb`
    RecoveryThrottle { max_bytes_per_sec: String },
    /// Concurrent incoming and outgoing recoveries per node
    ConcurrentRecoveries { count: u32 },
    /// Shard allocation: all, primaries, new_primaries or none
    Allocation {
        #[structopt(possible_values = &["all", "primaries", "new_primaries", "none"])]
        mode: AllocationMode,
    },
    /// Drop the recovery and allocation overrides set by this tool
    ResetRecovery,
    /// Create or replace a composable index template
    PutTemplate {
        name: String,
        /// Index pattern, repeatable
        #[structopt(long = "pattern", required = true, number_of_values = 1)]
        patterns: Vec<String>,
        #[structopt(long, default_value = "1")]
        shards: u32,
        #[structopt(long, default_value = "1")]
        replicas: u32,
        /// ILM policy applied to matching indices
        #[structopt(long)]
        policy: Option<String>,
        #[structopt(long, default_value = "100")]
        priority: u32,
    },
    GetTemplate { name: Option<String> },
    DeleteTemplate { name: String },
}

impl ClusterAction {
    pub fn request(&self) -> Result<EsRequest> {
        let req = match self {
            ClusterAction::Health => EsRequest::get("/_cluster/health"),
            ClusterAction::Settings => EsRequest::get("/_cluster/settings?flat_settings=true"),
            ClusterAction::State { metric: None } => EsRequest::get("/_cluster/state"),
            ClusterAction::State { metric: Some(metric) } => EsRequest::get(format!("/_cluster/state/{}", metric)),
            ClusterAction::Stats => EsRequest::get("/_cluster/stats"),
            ClusterAction::RecoveryThrottle { max_bytes_per_sec } => {
                persistent(json!({ RECOVERY_RATE: max_bytes_per_sec }))
            }
            ClusterAction::ConcurrentRecoveries { count } => {
                if *count == 0 {
                    return Err(Error::InvalidArgument("concurrent recoveries must be at least 1".to_string()));
                }
                persistent(json!({ CONCURRENT_RECOVERIES: count }))
            }
            ClusterAction::Allocation { mode } => persistent(json!({ ALLOCATION_ENABLE: mode.to_string() })),
            ClusterAction::ResetRecovery => persistent(json!({
                RECOVERY_RATE: null,
                CONCURRENT_RECOVERIES: null,
                ALLOCATION_ENABLE: null
            })),
            ClusterAction::PutTemplate {
                name,
                patterns,
                shards,
                replicas,
                policy,
                priority,
            } => {
                let name = template_name(name)?;
                if patterns.is_empty() {
                    return Err(Error::InvalidArgument("at least one index pattern is required".to_string()));
                }
                let mut settings = Map::new();
                settings.insert("index.number_of_shards".to_string(), json!(shards));
                settings.insert("index.number_of_replicas".to_string(), json!(replicas));
                if let Some(policy) = policy {
                    settings.insert("index.lifecycle.name".to_string(), json!(policy));
                }
                EsRequest::put_json(
                    format!("/_index_template/{}", name),
                    json!({
                        "index_patterns": patterns,
                        "priority": priority,
                        "template": { "settings": Value::Object(settings) }
                    }),
                )
            }
            ClusterAction::GetTemplate { name: None } => EsRequest::get("/_index_template"),
            ClusterAction::GetTemplate { name: Some(name) } => {
                EsRequest::get(format!("/_index_template/{}", template_name(name)?))
            }
            ClusterAction::DeleteTemplate { name } => {
                EsRequest::delete(format!("/_index_template/{}", template_name(name)?))
            }
        };
        Ok(req)
    }
}

fn persistent(settings: Value) -> EsRequest {
    EsRequest::put_json("/_cluster/settings", json!({ "persistent": settings }))
}

fn template_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidArgument("template name must not be empty".to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    #[test]
    fn read_only_endpoints() {
        assert_eq!(ClusterAction::Health.request().unwrap(), EsRequest::get("/_cluster/health"));
        assert_eq!(
            ClusterAction::Settings.request().unwrap().path,
            "/_cluster/settings?flat_settings=true"
        );
        assert_eq!(
            ClusterAction::State { metric: Some("metadata".to_string()) }.request().unwrap().path,
            "/_cluster/state/metadata"
        );
        assert_eq!(ClusterAction::State { metric: None }.request().unwrap().path, "/_cluster/state");
        assert_eq!(ClusterAction::Stats.request().unwrap().path, "/_cluster/stats");
    }

    #[test]
    fn recovery_settings_are_persistent() {
        let req = ClusterAction::RecoveryThrottle {
            max_bytes_per_sec: "200mb".to_string(),
        }
        .request()
        .unwrap();
        assert_eq!(req.method, Method::PUT);
        assert_eq!(req.path, "/_cluster/settings");
        assert_eq!(
            req.body,
            Some(json!({"persistent": {"indices.recovery.max_bytes_per_sec": "200mb"}}))
        );

        let req = ClusterAction::ConcurrentRecoveries { count: 4 }.request().unwrap();
        assert_eq!(
            req.body,
            Some(json!({"persistent": {"cluster.routing.allocation.node_concurrent_recoveries": 4}}))
        );
        assert!(ClusterAction::ConcurrentRecoveries { count: 0 }.request().is_err());
    }

    #[test]
    fn allocation_and_reset() {
        let req = ClusterAction::Allocation {
            mode: AllocationMode::Primaries,
        }
        .request()
        .unwrap();
        assert_eq!(
            req.body,
            Some(json!({"persistent": {"cluster.routing.allocation.enable": "primaries"}}))
        );

        let req = ClusterAction::ResetRecovery.request().unwrap();
        let persistent = &req.body.unwrap()["persistent"];
        assert!(persistent[RECOVERY_RATE].is_null());
        assert!(persistent[CONCURRENT_RECOVERIES].is_null());
        assert!(persistent[ALLOCATION_ENABLE].is_null());
        assert_eq!(persistent.as_object().unwrap().len(), 3);
    }

    #[test]
    fn allocation_mode_parsing() {
        assert_eq!("new_primaries".parse::<AllocationMode>().unwrap(), AllocationMode::NewPrimaries);
        assert_eq!(AllocationMode::None.to_string(), "none");
        assert!("some".parse::<AllocationMode>().is_err());
    }

    #[test]
    fn template_body() {
        let req = ClusterAction::PutTemplate {
            name: "logs".to_string(),
            patterns: vec!["logs-*".to_string(), "app-*".to_string()],
            shards: 3,
            replicas: 1,
            policy: Some("logs-policy".to_string()),
            priority: 200,
        }
        .request()
        .unwrap();
        assert_eq!(req.path, "/_index_template/logs");
        assert_eq!(
            req.body,
            Some(json!({
                "index_patterns": ["logs-*", "app-*"],
                "priority": 200,
                "template": {
                    "settings": {
                        "index.number_of_shards": 3,
                        "index.number_of_replicas": 1,
                        "index.lifecycle.name": "logs-policy"
                    }
                }
            }))
        );
    }

    #[test]
    fn template_without_policy_or_pattern() {
        let req = ClusterAction::PutTemplate {
            name: "t".to_string(),
            patterns: vec!["t-*".to_string()],
            shards: 1,
            replicas: 0,
            policy: None,
            priority: 100,
        }
        .request()
        .unwrap();
        let settings = &req.body.unwrap()["template"]["settings"];
        assert!(settings.get("index.lifecycle.name").is_none());

        let missing = ClusterAction::PutTemplate {
            name: "t".to_string(),
            patterns: vec![],
            shards: 1,
            replicas: 0,
            policy: None,
            priority: 100,
        };
        assert!(missing.request().is_err());
    }

    #[test]
    fn template_lookup_and_delete() {
        assert_eq!(ClusterAction::GetTemplate { name: None }.request().unwrap().path, "/_index_template");
        let req = ClusterAction::DeleteTemplate { name: "logs".to_string() }.request().unwrap();
        assert_eq!(req.method, Method::DELETE);
        assert_eq!(req.path, "/_index_template/logs");
        assert!(ClusterAction::DeleteTemplate { name: " ".to_string() }.request().is_err());
    }

    #[test]
    fn parses_repeated_patterns() {
        let action = ClusterAction::from_iter(vec![
            "cluster",
            "put-template",
            "logs",
            "--pattern",
            "logs-*",
            "--pattern",
            "audit-*",
            "--policy",
            "hot-delete",
        ]);
        match action {
            ClusterAction::PutTemplate { patterns, policy, shards, .. } => {
                assert_eq!(patterns, vec!["logs-*", "audit-*"]);
                assert_eq!(policy.as_deref(), Some("hot-delete"));
                assert_eq!(shards, 1);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }
}
