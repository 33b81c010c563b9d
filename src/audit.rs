//! Best-practice review of indices, templates, nodes and lifecycle policies.

use std::fmt;

use chrono::Utc;
use humansize::{format_size, BINARY};
use serde::Deserialize;
use serde_json::Value;
use structopt::StructOpt;

use crate::client::EsClient;
use crate::error::Result;
use crate::json::{as_u64, lookup};
use crate::request::require_index;

const GIB: u64 = 1024 * 1024 * 1024;
const MAX_SHARD_BYTES: u64 = 50 * GIB;
const MIN_SHARD_BYTES: u64 = GIB;
const MAX_AGE_DAYS: i64 = 365;
const MAX_FIELDS: usize = 1000;
const SEGMENTS_PER_PRIMARY: u64 = 50;
const MAX_DELETED_RATIO: f64 = 0.1;
const MAX_HEAP_PERCENT: f64 = 75.0;
const MIN_NODES: u64 = 3;
const MS_PER_DAY: i64 = 86_400_000;
const LISTED_WITHOUT_POLICY: usize = 10;

#[derive(Debug, StructOpt, Clone)]
pub struct AuditOptions {
    /// Index name or pattern to review
    #[structopt(long, default_value = "*")]
    pub index: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatIndex {
    pub index: String,
    #[serde(default)]
    pub health: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pri: Option<String>,
    #[serde(default)]
    pub rep: Option<String>,
    #[serde(rename = "store.size", default)]
    pub store_size: Option<String>,
    #[serde(rename = "docs.count", default)]
    pub docs_count: Option<String>,
    #[serde(rename = "creation.date", default)]
    pub creation_date: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatAlias {
    pub alias: String,
    pub index: String,
    #[serde(default)]
    pub is_write_index: Option<String>,
}

/// Either the fetched value or why it could not be fetched.
pub type Fetched<T> = std::result::Result<T, String>;

/// Everything the per-index rules look at.
#[derive(Debug, Clone)]
pub struct IndexFacts {
    pub name: String,
    pub primaries: u64,
    pub replicas: u64,
    pub size_bytes: u64,
    pub age_days: Option<i64>,
    pub has_alias: bool,
    pub has_write_alias: bool,
    pub mappings: Fetched<Value>,
    pub settings: Fetched<Value>,
    pub segments: Option<u64>,
    /// Primary (live, deleted) document counts.
    pub docs: Fetched<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Issue {
    NoReplicas,
    OversizedShards(u64),
    Stale(i64),
    NoAlias,
    NonStandardName,
    TooManyFields(usize),
    DynamicMapping,
    TextWithoutKeyword(String),
    MappingUnavailable(String),
    DefaultRefreshInterval,
    UndersizedShards,
    SettingsUnavailable(String),
    DeprecatedField(&'static str),
    NoWriteAlias,
    TooManySegments(u64),
    DeletedDocs { deleted: u64, ratio: f64 },
    DocStatsUnavailable(String),
    OversizedSystemIndex,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::NoReplicas => write!(f, "no replicas (risk of data loss)"),
            Issue::OversizedShards(bytes) => write!(f, "shards too large: {}", format_size(*bytes, BINARY)),
            Issue::Stale(days) => write!(f, "very old index: {} days", days),
            Issue::NoAlias => write!(f, "no alias (makes reindexing harder)"),
            Issue::NonStandardName => write!(f, "non-standard index name (use - or _ separators)"),
            Issue::TooManyFields(count) => write!(f, "too many mapped fields: {}", count),
            Issue::DynamicMapping => write!(f, "dynamic mapping enabled (mapping may grow unexpectedly)"),
            Issue::TextWithoutKeyword(field) => {
                write!(f, "text field '{}' has no keyword sub-field (no aggregations)", field)
            }
            Issue::MappingUnavailable(err) => write!(f, "could not fetch mapping: {}", err),
            Issue::DefaultRefreshInterval => {
                write!(f, "default refresh_interval (1s), raise it for bulk loads")
            }
            Issue::UndersizedShards => write!(f, "too little data per shard (<1GiB)"),
            Issue::SettingsUnavailable(err) => write!(f, "could not fetch settings: {}", err),
            Issue::DeprecatedField(field) => write!(f, "deprecated mapping field {}", field),
            Issue::NoWriteAlias => write!(f, "no write alias (needed for rollover)"),
            Issue::TooManySegments(count) => write!(f, "too many segments: {}", count),
            Issue::DeletedDocs { deleted, ratio } => write!(
                f,
                "many documents marked as deleted: {} ({:.1}%)",
                deleted,
                ratio * 100.0
            ),
            Issue::DocStatsUnavailable(err) => write!(f, "could not fetch document stats: {}", err),
            Issue::OversizedSystemIndex => write!(f, "system index with more than one shard or replica"),
        }
    }
}

fn dynamic_enabled(mappings: &Value) -> bool {
    match mappings.get("dynamic") {
        None => true,
        Some(Value::Bool(enabled)) => *enabled,
        Some(Value::String(mode)) => mode == "true",
        Some(_) => false,
    }
}

/// Runs every per-index rule.
pub fn index_issues(facts: &IndexFacts) -> Vec<Issue> {
    let mut issues = Vec::new();

    if facts.replicas < 1 {
        issues.push(Issue::NoReplicas);
    }
    let per_shard = if facts.primaries > 0 {
        facts.size_bytes / facts.primaries
    } else {
        0
    };
    if per_shard > MAX_SHARD_BYTES {
        issues.push(Issue::OversizedShards(per_shard));
    }
    if let Some(age) = facts.age_days {
        if age > MAX_AGE_DAYS {
            issues.push(Issue::Stale(age));
        }
    }
    if !facts.has_alias {
        issues.push(Issue::NoAlias);
    }
    if !facts.name.contains('-') && !facts.name.contains('_') {
        issues.push(Issue::NonStandardName);
    }

    match &facts.mappings {
        Ok(mappings) => {
            let properties = mappings.get("properties").and_then(Value::as_object);
            let fields = properties.map(|p| p.len()).unwrap_or(0);
            if fields > MAX_FIELDS {
                issues.push(Issue::TooManyFields(fields));
            }
            if dynamic_enabled(mappings) {
                issues.push(Issue::DynamicMapping);
            }
            let bare_text = properties.and_then(|p| {
                p.iter().find(|(_, desc)| {
                    desc.get("type").and_then(Value::as_str) == Some("text") && desc.get("fields").is_none()
                })
            });
            if let Some((field, _)) = bare_text {
                issues.push(Issue::TextWithoutKeyword(field.clone()));
            }
        }
        Err(err) => issues.push(Issue::MappingUnavailable(err.clone())),
    }

    match &facts.settings {
        Ok(settings) => {
            let refresh = lookup(settings, "index.refresh_interval")
                .and_then(Value::as_str)
                .unwrap_or("1s");
            if refresh == "1s" {
                issues.push(Issue::DefaultRefreshInterval);
            }
            if facts.size_bytes > 0 && facts.primaries > 0 && per_shard < MIN_SHARD_BYTES {
                issues.push(Issue::UndersizedShards);
            }
        }
        Err(err) => issues.push(Issue::SettingsUnavailable(err.clone())),
    }

    if let Ok(mappings) = &facts.mappings {
        for field in ["_all", "_type"].iter() {
            if mappings.get(*field).is_some() {
                issues.push(Issue::DeprecatedField(*field));
            }
        }
    }
    if !facts.has_write_alias {
        issues.push(Issue::NoWriteAlias);
    }
    if let Some(count) = facts.segments {
        if count > facts.primaries * SEGMENTS_PER_PRIMARY {
            issues.push(Issue::TooManySegments(count));
        }
    }
    match &facts.docs {
        Ok((live, deleted)) => {
            let total = live + deleted;
            if total > 0 {
                let ratio = *deleted as f64 / total as f64;
                if ratio > MAX_DELETED_RATIO {
                    issues.push(Issue::DeletedDocs {
                        deleted: *deleted,
                        ratio,
                    });
                }
            }
        }
        Err(err) => issues.push(Issue::DocStatsUnavailable(err.clone())),
    }
    if facts.name.starts_with('.') && (facts.primaries > 1 || facts.replicas > 1) {
        issues.push(Issue::OversizedSystemIndex);
    }
    issues
}

fn parse_u64(value: &Option<String>) -> u64 {
    value.as_deref().and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

fn age_days(creation_date: &Option<String>, now_ms: i64) -> Option<i64> {
    let created: i64 = creation_date.as_deref()?.trim().parse().ok()?;
    Some((now_ms - created) / MS_PER_DAY)
}

fn fetch_mappings(client: &EsClient, index: &str) -> Fetched<Value> {
    let resp: Value = client
        .get_json(&format!("/{}/_mapping", index))
        .map_err(|e| e.to_string())?;
    Ok(resp[index]["mappings"].clone())
}

fn fetch_settings(client: &EsClient, index: &str) -> Fetched<Value> {
    let resp: Value = client
        .get_json(&format!("/{}/_settings?flat_settings=true", index))
        .map_err(|e| e.to_string())?;
    Ok(resp[index]["settings"].clone())
}

fn fetch_segment_count(client: &EsClient, index: &str) -> Option<u64> {
    let resp: Value = match client.get_json(&format!("/{}/_segments", index)) {
        Ok(resp) => resp,
        Err(err) => {
            log::debug!("segments of {}: {}", index, err);
            return None;
        }
    };
    let shards = resp["indices"][index]["shards"].as_object()?;
    let count = shards
        .values()
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|copy| copy["segments"].as_object())
        .map(|segments| segments.len() as u64)
        .sum();
    Some(count)
}

fn fetch_doc_counts(client: &EsClient, index: &str) -> Fetched<(u64, u64)> {
    let resp: Value = client
        .get_json(&format!("/{}/_stats/docs", index))
        .map_err(|e| e.to_string())?;
    let docs = &resp["indices"][index]["primaries"]["docs"];
    match (as_u64(&docs["count"]), as_u64(&docs["deleted"])) {
        (Some(count), Some(deleted)) => Ok((count, deleted)),
        _ => Err("response has no primaries.docs".to_string()),
    }
}

pub fn collect_facts(client: &EsClient, cat: &CatIndex, aliases: &[CatAlias], now_ms: i64) -> IndexFacts {
    let name = cat.index.clone();
    let own_aliases: Vec<&CatAlias> = aliases.iter().filter(|a| a.index == name).collect();
    IndexFacts {
        primaries: parse_u64(&cat.pri),
        replicas: parse_u64(&cat.rep),
        size_bytes: parse_u64(&cat.store_size),
        age_days: age_days(&cat.creation_date, now_ms),
        has_alias: !own_aliases.is_empty(),
        has_write_alias: own_aliases
            .iter()
            .any(|a| a.is_write_index.as_deref() == Some("true")),
        mappings: fetch_mappings(client, &name),
        settings: fetch_settings(client, &name),
        segments: fetch_segment_count(client, &name),
        docs: fetch_doc_counts(client, &name),
        name,
    }
}

#[derive(Debug, Default)]
pub struct AuditReport {
    pub lines: Vec<String>,
    pub issues: usize,
    pub indices: usize,
}

impl AuditReport {
    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

pub fn run_audit(client: &EsClient, opts: &AuditOptions) -> Result<AuditReport> {
    let pattern = require_index(&opts.index)?;
    let mut report = AuditReport::default();

    let info: Value = client.get_json("/")?;
    let health: Value = client.get_json("/_cluster/health")?;
    let mut indices: Vec<CatIndex> = client.get_json(&format!(
        "/_cat/indices/{}?format=json&bytes=b&h=index,health,status,pri,rep,store.size,docs.count,creation.date",
        pattern
    ))?;
    indices.sort_by(|a, b| a.index.cmp(&b.index));
    let aliases: Vec<CatAlias> = client.get_json("/_cat/aliases?format=json")?;
    let status = health["status"].as_str().unwrap_or("unknown").to_string();
    let nodes = as_u64(&health["number_of_nodes"]).unwrap_or(0);

    report.line("=== Cluster ===");
    report.line(format!("Cluster name: {}", info["cluster_name"].as_str().unwrap_or("unknown")));
    report.line(format!("Version: {}", info["version"]["number"].as_str().unwrap_or("unknown")));
    report.line(format!("Status: {}", status));
    report.line(format!("Nodes: {}", nodes));
    report.line(format!("Indices: {}", indices.len()));
    let total_docs: u64 = indices.iter().map(|i| parse_u64(&i.docs_count)).sum();
    report.line(format!("Documents: {}", total_docs));

    report.line("");
    report.line(format!("=== Indices ({}) ===", pattern));
    let now_ms = Utc::now().timestamp_millis();
    for cat in &indices {
        let facts = collect_facts(client, cat, &aliases, now_ms);
        let issues = index_issues(&facts);
        report.line(format!("Index: {}", facts.name));
        report.line(format!(
            "  health: {}, status: {}, docs: {}, size: {}",
            cat.health.as_deref().unwrap_or("unknown"),
            cat.status.as_deref().unwrap_or("unknown"),
            parse_u64(&cat.docs_count),
            format_size(facts.size_bytes, BINARY)
        ));
        report.line(format!(
            "  shards: {} primary, {} replica, age: {}",
            facts.primaries,
            facts.replicas,
            facts
                .age_days
                .map(|d| format!("{} days", d))
                .unwrap_or_else(|| "unknown".to_string())
        ));
        if issues.is_empty() {
            report.line("  follows best practices");
        } else {
            report.line("  issues:");
            for issue in &issues {
                report.line(format!("    - {}", issue));
            }
        }
        report.issues += issues.len();
        report.indices += 1;
    }

    review_templates(client, &mut report);

    report.line("");
    report.line("=== Recommendations ===");
    if report.issues == 0 {
        report.line("All indices follow best practices");
    } else {
        report.line(format!("Found {} issues", report.issues));
    }
    if status != "green" {
        report.line(format!("- cluster status is {}, bring it back to green", status));
    }
    if nodes < MIN_NODES {
        report.line(format!("- only {} nodes, at least {} are recommended for fault tolerance", nodes, MIN_NODES));
    }
    match client.get_json::<Value>("/_nodes/stats/jvm") {
        Ok(stats) => {
            for line in heap_warnings(&stats) {
                report.line(line);
            }
        }
        Err(err) => report.line(format!("- could not fetch node stats: {}", err)),
    }

    review_policies(client, pattern, &mut report);
    Ok(report)
}

pub fn heap_warnings(node_stats: &Value) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Some(nodes) = node_stats["nodes"].as_object() {
        for node in nodes.values() {
            let mem = &node["jvm"]["mem"];
            let (used, max) = match (as_u64(&mem["heap_used_in_bytes"]), as_u64(&mem["heap_max_in_bytes"])) {
                (Some(used), Some(max)) if max > 0 => (used, max),
                _ => continue,
            };
            let percent = used as f64 / max as f64 * 100.0;
            if percent > MAX_HEAP_PERCENT {
                warnings.push(format!(
                    "- high JVM heap usage on node {}: {:.1}%",
                    node["name"].as_str().unwrap_or("unknown"),
                    percent
                ));
            }
        }
    }
    warnings
}

fn review_templates(client: &EsClient, report: &mut AuditReport) {
    report.line("");
    report.line("=== Index templates ===");
    let templates: Value = match client.get_json("/_index_template") {
        Ok(templates) => templates,
        Err(err) => {
            report.line(format!("could not fetch index templates: {}", err));
            return;
        }
    };
    for template in templates["index_templates"].as_array().into_iter().flatten() {
        let settings = &template["index_template"]["template"]["settings"];
        report.line(format!("Template: {}", template["name"].as_str().unwrap_or("unknown")));
        let show = |key: &str| {
            lookup(settings, key)
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .unwrap_or_else(|| "not set".to_string())
        };
        report.line(format!("  shards: {}", show("index.number_of_shards")));
        report.line(format!("  replicas: {}", show("index.number_of_replicas")));
        match lookup(settings, "index.lifecycle.name").and_then(Value::as_str) {
            Some(policy) => report.line(format!("  lifecycle policy: {}", policy)),
            None => {
                report.line("  no lifecycle policy");
                report.issues += 1;
            }
        }
    }
}

fn review_policies(client: &EsClient, pattern: &str, report: &mut AuditReport) {
    report.line("");
    report.line("=== Lifecycle policies ===");
    match client.get_json::<Value>("/_ilm/policy") {
        Ok(Value::Object(policies)) if !policies.is_empty() => {
            report.line(format!("Found {} policies:", policies.len()));
            for name in policies.keys() {
                report.line(format!("  - {}", name));
            }
        }
        Ok(_) => report.line("No lifecycle policies, configure ILM to manage index lifecycles"),
        Err(err) => report.line(format!("could not fetch lifecycle policies: {}", err)),
    }

    let path = format!("/{}/_settings/index.lifecycle.name?flat_settings=true", pattern);
    match client.get_json::<Value>(&path) {
        Ok(Value::Object(indices)) => {
            let without: Vec<&String> = indices
                .iter()
                .filter(|(_, v)| lookup(&v["settings"], "index.lifecycle.name").is_none())
                .map(|(name, _)| name)
                .collect();
            if without.is_empty() {
                report.line("All indices have a lifecycle policy");
            } else {
                report.line(format!("{} indices without a lifecycle policy:", without.len()));
                for name in without.iter().take(LISTED_WITHOUT_POLICY) {
                    report.line(format!("  - {}", name));
                }
                if without.len() > LISTED_WITHOUT_POLICY {
                    report.line("  ...");
                }
            }
        }
        Ok(_) => {}
        Err(err) => report.line(format!("could not check index lifecycle settings: {}", err)),
    }
}
