//! Copies indices (settings, mappings, documents, aliases) from a source
//! cluster to a target cluster and checks the result.

use std::ops::AddAssign;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::client::EsClient;
use crate::error::{Error, Result};
use crate::json::{as_u64, lookup};
use crate::request::EsRequest;
use crate::settings::{CopyMethod, ReplicateArgs, ReplicationOptions, ReplicationSettings};

pub const HASH_FIELD: &str = "_doc_hash";
const META_INDEX: &str = ".replication_meta";
const META_DOC: &str = "/.replication_meta/_doc/last_sync";
const DEFAULT_EXCLUDES: [&str; 4] = [
    r"\.",
    r"_ilm_history.*",
    r"_watcher_history.*",
    r"_security_audit_log.*",
];
/// Index settings the server owns and rejects on create.
const SYSTEM_SETTINGS: [&str; 6] = ["uuid", "version", "creation_date", "provided_name", "history", "resize"];
const VERIFY_SAMPLE: u64 = 1000;
const PROGRESS_EVERY: u64 = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReplicationStats {
    pub processed: u64,
    pub failed: u64,
}

impl AddAssign for ReplicationStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VerifyStats {
    pub checked: u64,
    pub mismatches: u64,
    pub missing_indices: u64,
    pub count_mismatches: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    All,
    MissingOnly,
    VerifyOnly,
}

impl Mode {
    pub fn from_args(args: &ReplicateArgs) -> Result<Self> {
        match (args.missing_only, args.verify_only) {
            (true, true) => Err(Error::InvalidArgument(
                "--missing-only and --verify-only are mutually exclusive".to_string(),
            )),
            (true, false) => Ok(Mode::MissingOnly),
            (false, true) => Ok(Mode::VerifyOnly),
            (false, false) => Ok(Mode::All),
        }
    }
}

/// Entry point of the `replicate` subcommand.
pub fn replicate(args: &ReplicateArgs) -> Result<()> {
    let mode = Mode::from_args(args)?;
    let settings = ReplicationSettings::resolve(args)?;
    Replicator::new(&settings)?.run(mode)
}

/// Anchored at the start of the index name.
pub fn compile_excludes(extra: &[String]) -> Result<Vec<Regex>> {
    DEFAULT_EXCLUDES
        .iter()
        .map(|p| p.to_string())
        .chain(extra.iter().cloned())
        .map(|p| Regex::new(&format!("^(?:{})", p)).map_err(Error::from))
        .collect()
}

/// SHA-256 of the document source without the hash field itself. Object keys
/// serialize in sorted order, so equal documents hash equally.
pub fn doc_hash(source: &Value) -> String {
    let digest = match source {
        Value::Object(fields) if fields.contains_key(HASH_FIELD) => {
            let mut fields = fields.clone();
            fields.remove(HASH_FIELD);
            Sha256::digest(Value::Object(fields).to_string().as_bytes())
        }
        other => Sha256::digest(other.to_string().as_bytes()),
    };
    hex::encode(digest)
}

/// Index settings of the source without the keys a create request rejects.
pub fn clean_index_settings(settings: &Value) -> Value {
    let mut settings = settings.clone();
    if let Some(index) = settings.get_mut("index").and_then(Value::as_object_mut) {
        for key in SYSTEM_SETTINGS.iter() {
            if index.remove(*key).is_some() {
                log::debug!("dropping system setting index.{}", key);
            }
        }
        index.retain(|key, _| !key.starts_with("history."));
        if let Some(allocation) = index
            .get_mut("routing")
            .and_then(|r| r.get_mut("allocation"))
            .and_then(Value::as_object_mut)
        {
            allocation.remove("initial_recovery");
        }
    }
    settings
}

/// Mappings with the keyword field that stores the document hash.
pub fn with_hash_field(mappings: &Value) -> Value {
    let mut mappings = match mappings {
        Value::Object(_) => mappings.clone(),
        _ => json!({}),
    };
    let properties = mappings
        .as_object_mut()
        .map(|m| m.entry("properties").or_insert_with(|| json!({})));
    if let Some(Value::Object(properties)) = properties {
        properties.insert(
            HASH_FIELD.to_string(),
            json!({ "type": "keyword", "index": false, "doc_values": false }),
        );
    }
    mappings
}

/// First top-level `date` field, else the first `date` sub-field of an object.
pub fn detect_timestamp_field(mappings: &Value) -> Option<String> {
    let properties = mappings.get("properties")?.as_object()?;
    let is_date = |desc: &Value| desc.get("type").and_then(Value::as_str) == Some("date");
    if let Some((field, _)) = properties.iter().find(|(_, desc)| is_date(desc)) {
        return Some(field.clone());
    }
    properties.iter().find_map(|(field, desc)| {
        let nested = desc.get("properties")?.as_object()?;
        nested
            .iter()
            .find(|(_, sub)| is_date(sub))
            .map(|(sub, _)| format!("{}.{}", field, sub))
    })
}

/// NDJSON body indexing `hits` into `target`, each with its hash.
pub fn bulk_body(target: &str, hits: &[Value]) -> (String, usize) {
    let mut body = String::new();
    let mut count = 0;
    for hit in hits {
        let (id, source) = match (hit["_id"].as_str(), hit["_source"].as_object()) {
            (Some(id), Some(source)) => (id, source),
            _ => {
                log::warn!("skipping hit without _id or _source in {}", target);
                continue;
            }
        };
        let mut source: Map<String, Value> = source.clone();
        let hash = doc_hash(&Value::Object(source.clone()));
        source.insert(HASH_FIELD.to_string(), json!(hash));
        body.push_str(&json!({ "index": { "_index": target, "_id": id } }).to_string());
        body.push('\n');
        body.push_str(&Value::Object(source).to_string());
        body.push('\n');
        count += 1;
    }
    (body, count)
}

/// Successful and failed items of a `_bulk` response.
pub fn bulk_outcome(resp: &Value, sent: usize) -> ReplicationStats {
    let items = match resp["items"].as_array() {
        Some(items) => items,
        None => {
            return ReplicationStats {
                processed: 0,
                failed: sent as u64,
            }
        }
    };
    let mut stats = ReplicationStats::default();
    for item in items {
        let status = item
            .as_object()
            .and_then(|ops| ops.values().next())
            .and_then(|op| as_u64(&op["status"]))
            .unwrap_or(0);
        if (200..300).contains(&status) {
            stats.processed += 1;
        } else {
            stats.failed += 1;
        }
    }
    stats
}

pub struct Replicator {
    source: EsClient,
    target: EsClient,
    source_url: String,
    source_user: Option<String>,
    source_password: Option<String>,
    opts: ReplicationOptions,
    excludes: Vec<Regex>,
    last_sync: Option<DateTime<Utc>>,
}

impl Replicator {
    pub fn new(settings: &ReplicationSettings) -> Result<Self> {
        let timeout = settings.replication.timeout;
        let source_conn = settings.source.connection("source", timeout)?;
        let target_conn = settings.target.connection("target", timeout)?;
        let source = EsClient::new(&source_conn)?;
        let target = EsClient::new(&target_conn)?;
        for (name, client) in [("source", &source), ("target", &target)].iter() {
            let info: Value = client.get_json("/")?;
            log::info!(
                "connected to {} cluster {} (v{})",
                name,
                info["cluster_name"].as_str().unwrap_or("unknown"),
                info["version"]["number"].as_str().unwrap_or("unknown")
            );
        }
        Ok(Replicator {
            source_url: source.base_url().to_string(),
            source,
            target,
            source_user: source_conn.user,
            source_password: source_conn.password,
            excludes: compile_excludes(&settings.replication.exclude_patterns)?,
            opts: settings.replication.clone(),
            last_sync: None,
        })
    }

    pub fn should_replicate(&self, index: &str) -> bool {
        !self.excludes.iter().any(|re| re.is_match(index))
    }

    fn index_names(client: &EsClient) -> Result<Vec<String>> {
        let rows: Vec<Value> = client.get_json("/_cat/indices?format=json&h=index")?;
        let mut names: Vec<String> = rows
            .iter()
            .filter_map(|row| row["index"].as_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn source_indices(&self) -> Result<Vec<String>> {
        Ok(Self::index_names(&self.source)?
            .into_iter()
            .filter(|index| self.should_replicate(index))
            .collect())
    }

    pub fn missing_indices(&self) -> Result<Vec<String>> {
        let target = Self::index_names(&self.target)?;
        Ok(self
            .source_indices()?
            .into_iter()
            .filter(|index| target.binary_search(index).is_err())
            .collect())
    }

    pub fn load_last_sync(&mut self) -> Result<()> {
        let resp = match self.target.send(&EsRequest::get(META_DOC)) {
            Ok(resp) => resp,
            Err(err) if err.status().map(|s| s.as_u16()) == Some(404) => {
                log::info!("no previous sync time found");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let doc: Value = resp.json()?;
        self.last_sync = doc["_source"]["timestamp"]
            .as_str()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));
        log::info!("last sync time: {:?}", self.last_sync);
        Ok(())
    }

    fn save_sync_time(&mut self, at: DateTime<Utc>) -> Result<()> {
        if !self.target.exists(&format!("/{}", META_INDEX))? {
            self.target.send(&EsRequest::put_json(format!("/{}", META_INDEX), json!({})))?;
        }
        self.target
            .send(&EsRequest::put_json(META_DOC, json!({ "timestamp": at.to_rfc3339() })))?;
        self.last_sync = Some(at);
        Ok(())
    }

    /// Copies one index. Missing source indices are skipped with a warning.
    pub fn replicate_index(&self, index: &str) -> Result<ReplicationStats> {
        let path = format!("/{}", index);
        if !self.source.exists(&path)? {
            log::warn!("source index {} doesn't exist", index);
            return Ok(ReplicationStats::default());
        }

        let settings: Value = self.source.get_json(&format!("{}/_settings", path))?;
        let settings = &settings[index]["settings"];
        let mappings: Value = self.source.get_json(&format!("{}/_mapping", path))?;
        let mappings = &mappings[index]["mappings"];

        let target_existed = self.target.exists(&path)?;
        if !target_existed {
            let body = json!({
                "settings": clean_index_settings(settings),
                "mappings": with_hash_field(mappings),
            });
            self.target.send(&EsRequest::put_json(path.as_str(), body))?;
            log::info!("created target index {}", index);
        }

        let refresh = lookup(settings, "index.refresh_interval").cloned().unwrap_or(Value::Null);
        self.target.send(&EsRequest::put_json(
            format!("{}/_settings", path),
            json!({ "index": { "refresh_interval": "-1" } }),
        ))?;

        let copied = self.copy_documents(index, mappings, target_existed);

        self.target.send(&EsRequest::put_json(
            format!("{}/_settings", path),
            json!({ "index": { "refresh_interval": refresh } }),
        ))?;
        let stats = copied?;
        self.copy_aliases(index)?;
        log::info!(
            "index: {} copied: {} failed: {}",
            index,
            stats.processed,
            stats.failed
        );
        Ok(stats)
    }

    fn copy_documents(&self, index: &str, mappings: &Value, target_existed: bool) -> Result<ReplicationStats> {
        let timestamp_field = self
            .opts
            .timestamp_field
            .clone()
            .or_else(|| detect_timestamp_field(mappings));
        let query = match (&timestamp_field, self.last_sync, target_existed) {
            (Some(field), Some(since), true) => {
                log::info!("index: {} incremental on {} since {}", index, field, since.to_rfc3339());
                json!({ "range": { field.as_str(): { "gte": since.to_rfc3339() } } })
            }
            _ => json!({ "match_all": {} }),
        };
        match self.opts.method {
            CopyMethod::Scroll => self.scroll_copy(index, query),
            CopyMethod::Reindex => self.reindex_from_remote(index, query),
        }
    }

    fn scroll_copy(&self, index: &str, query: Value) -> Result<ReplicationStats> {
        let total: Value = self
            .source
            .send(&EsRequest::post_json(format!("/{}/_count", index), json!({ "query": query })))?
            .json()?;
        let total = as_u64(&total["count"]).unwrap_or(0);
        let mut stats = ReplicationStats::default();
        if total == 0 {
            log::info!("index: {} has no documents to copy", index);
            return Ok(stats);
        }
        log::info!("index: {} copying {} documents", index, total);

        let batch = self.opts.batch_size;
        let scroll = self.opts.scroll.as_str();
        let mut page: Value = self
            .source
            .send(&EsRequest::post_json(
                format!("/{}/_search?scroll={}", index, scroll),
                json!({ "size": batch, "sort": ["_doc"], "query": query }),
            ))?
            .json()?;
        let mut scroll_id = page["_scroll_id"].as_str().map(str::to_string);
        let progress_every = PROGRESS_EVERY.max(total / 100);
        let mut next_progress = progress_every;

        loop {
            let hits = page["hits"]["hits"].as_array().cloned().unwrap_or_default();
            if hits.is_empty() {
                break;
            }
            stats += self.bulk_index(index, &hits)?;
            let done = stats.processed + stats.failed;
            if done >= next_progress {
                log::info!("index: {} progress {}/{}", index, done, total);
                next_progress += progress_every;
            }
            if hits.len() < batch {
                break;
            }
            let id = match &scroll_id {
                Some(id) => id.clone(),
                None => break,
            };
            page = self
                .source
                .send(&EsRequest::post_json(
                    "/_search/scroll",
                    json!({ "scroll": scroll, "scroll_id": id }),
                ))?
                .json()?;
            if let Some(id) = page["_scroll_id"].as_str() {
                scroll_id = Some(id.to_string());
            }
        }

        if let Some(id) = scroll_id {
            if let Err(err) = self
                .source
                .send(&EsRequest::delete_json("/_search/scroll", json!({ "scroll_id": [id] })))
            {
                log::warn!("index: {} clearing scroll failed: {}", index, err);
            }
        }
        Ok(stats)
    }

    fn bulk_index(&self, index: &str, hits: &[Value]) -> Result<ReplicationStats> {
        let (body, sent) = bulk_body(index, hits);
        let skipped = (hits.len() - sent) as u64;
        if sent == 0 {
            return Ok(ReplicationStats {
                processed: 0,
                failed: skipped,
            });
        }
        let resp: Value = self.target.send_ndjson("/_bulk", body)?.json()?;
        let mut stats = bulk_outcome(&resp, sent);
        stats.failed += skipped;
        if stats.failed > 0 {
            log::warn!("index: {} bulk failures: {}", index, stats.failed);
        }
        Ok(stats)
    }

    /// Server-side copy: the target pulls from the source.
    fn reindex_from_remote(&self, index: &str, query: Value) -> Result<ReplicationStats> {
        let mut remote = json!({ "host": self.source_url });
        if let (Some(user), Some(password)) = (&self.source_user, &self.source_password) {
            remote["username"] = json!(user);
            remote["password"] = json!(password);
        }
        let body = json!({
            "source": { "remote": remote, "index": index, "query": query },
            "dest": { "index": index }
        });
        let resp: Value = self
            .target
            .send(&EsRequest::post_json("/_reindex?wait_for_completion=true", body))?
            .json()?;
        let processed = as_u64(&resp["created"]).unwrap_or(0) + as_u64(&resp["updated"]).unwrap_or(0);
        let failed = resp["failures"].as_array().map(|f| f.len() as u64).unwrap_or(0);
        Ok(ReplicationStats { processed, failed })
    }

    fn copy_aliases(&self, index: &str) -> Result<()> {
        let resp: Value = self.source.get_json(&format!("/{}/_alias", index))?;
        let aliases = match resp[index]["aliases"].as_object() {
            Some(aliases) => aliases,
            None => return Ok(()),
        };
        for (alias, definition) in aliases {
            let path = format!("/{}/_alias/{}", index, alias);
            let req = match definition.as_object() {
                Some(def) if !def.is_empty() => EsRequest::put_json(path, definition.clone()),
                _ => EsRequest::new(reqwest::Method::PUT, path, None),
            };
            self.target.send(&req)?;
            log::info!("index: {} alias: {} added", index, alias);
        }
        Ok(())
    }

    /// One pass over `indices`. A failing index is logged and the rest continue;
    /// the pass then ends in `Error::Replication`. An index with failed documents
    /// counts as failed.
    ///
    /// The sync time only moves forward when `save_sync` is set and every index
    /// was copied completely, so incremental passes never skip unsynced documents.
    pub fn replicate_indices(&mut self, indices: &[String], save_sync: bool) -> Result<ReplicationStats> {
        let started = Instant::now();
        let synced_at = Utc::now();
        let mut total = ReplicationStats::default();
        let mut failed_indices = 0;
        log::info!("replicating {} indices", indices.len());
        for index in indices {
            match self.replicate_index(index) {
                Ok(stats) => {
                    if stats.failed > 0 {
                        failed_indices += 1;
                    }
                    total += stats;
                }
                Err(err) => {
                    log::error!("index: {} replication failed: {}", index, err);
                    failed_indices += 1;
                }
            }
        }
        log::info!(
            "replication pass done: copied {} failed documents {} failed indices {} in {:.2}s",
            total.processed,
            total.failed,
            failed_indices,
            started.elapsed().as_secs_f64()
        );
        if failed_indices > 0 {
            if save_sync {
                log::warn!("keeping previous sync time {:?}", self.last_sync);
            }
            return Err(Error::Replication {
                failed: failed_indices,
                attempted: indices.len(),
            });
        }
        if save_sync {
            self.save_sync_time(synced_at)?;
        }
        Ok(total)
    }

    fn count(client: &EsClient, index: &str) -> Result<u64> {
        let resp: Value = client.get_json(&format!("/{}/_count", index))?;
        Ok(as_u64(&resp["count"]).unwrap_or(0))
    }

    fn verify_index(&self, index: &str, stats: &mut VerifyStats) -> Result<()> {
        if !self.target.exists(&format!("/{}", index))? {
            log::warn!("index {} missing in target cluster", index);
            stats.missing_indices += 1;
            stats.mismatches += 1;
            return Ok(());
        }
        let source_count = Self::count(&self.source, index)?;
        let target_count = Self::count(&self.target, index)?;
        if source_count != target_count {
            let diff = if source_count > target_count {
                source_count - target_count
            } else {
                target_count - source_count
            };
            log::warn!(
                "index: {} document count mismatch source={} target={}",
                index,
                source_count,
                target_count
            );
            stats.mismatches += diff;
            stats.count_mismatches += diff;
        }

        let sample = VERIFY_SAMPLE.min(source_count);
        if sample == 0 {
            return Ok(());
        }
        let resp: Value = self
            .source
            .send(&EsRequest::post_json(
                format!("/{}/_search", index),
                json!({
                    "size": sample,
                    "query": {
                        "function_score": {
                            "functions": [{ "random_score": {} }],
                            "score_mode": "sum"
                        }
                    }
                }),
            ))?
            .json()?;
        let hits = resp["hits"]["hits"].as_array().cloned().unwrap_or_default();
        let ids: Vec<&str> = hits.iter().filter_map(|h| h["_id"].as_str()).collect();
        if ids.is_empty() {
            return Ok(());
        }
        let docs: Value = self
            .target
            .send(&EsRequest::post_json(format!("/{}/_mget", index), json!({ "ids": ids })))?
            .json()?;
        let empty = Vec::new();
        let target_docs = docs["docs"].as_array().unwrap_or(&empty);

        for hit in &hits {
            let id = match hit["_id"].as_str() {
                Some(id) => id,
                None => continue,
            };
            stats.checked += 1;
            let found = target_docs
                .iter()
                .find(|d| d["_id"].as_str() == Some(id) && d["found"].as_bool() == Some(true));
            let target_doc = match found {
                Some(doc) => doc,
                None => {
                    log::debug!("index: {} document {} missing in target", index, id);
                    stats.mismatches += 1;
                    continue;
                }
            };
            let expected = doc_hash(&hit["_source"]);
            let actual = target_doc["_source"][HASH_FIELD]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| doc_hash(&target_doc["_source"]));
            if expected != actual {
                log::debug!("index: {} document {} content mismatch", index, id);
                stats.mismatches += 1;
            }
        }
        Ok(())
    }

    pub fn verify(&self, indices: &[String]) -> VerifyStats {
        let mut stats = VerifyStats::default();
        for index in indices {
            log::info!("verifying index {}", index);
            if let Err(err) = self.verify_index(index, &mut stats) {
                log::error!("index: {} verification failed: {}", index, err);
            }
        }
        if stats.missing_indices > 0 {
            log::warn!("missing indices in target: {}", stats.missing_indices);
        }
        if stats.count_mismatches > 0 {
            log::warn!("document count mismatches: {}", stats.count_mismatches);
        }
        stats
    }

    fn full_pass(&mut self) -> Result<()> {
        let indices = self.source_indices()?;
        if indices.is_empty() {
            log::warn!("no indices found for replication");
            return Ok(());
        }
        self.replicate_indices(&indices, true)?;
        Ok(())
    }

    /// Runs the selected mode until done (or forever when continuous).
    pub fn run(&mut self, mode: Mode) -> Result<()> {
        match mode {
            Mode::VerifyOnly => {
                let indices = self.source_indices()?;
                if indices.is_empty() {
                    log::warn!("no indices found for verification");
                    return Ok(());
                }
                let stats = self.verify(&indices);
                log::info!(
                    "verification: indices {} documents checked {} missing indices {} \
                     count mismatches {} content mismatches {}",
                    indices.len(),
                    stats.checked,
                    stats.missing_indices,
                    stats.count_mismatches,
                    stats.mismatches - stats.count_mismatches - stats.missing_indices
                );
                if stats.mismatches > 0 {
                    return Err(Error::VerificationFailed(stats.mismatches));
                }
                Ok(())
            }
            Mode::MissingOnly => {
                let indices = self.missing_indices()?;
                if indices.is_empty() {
                    log::info!("no missing indices, target is in sync");
                    return Ok(());
                }
                log::info!("missing indices: {}", indices.join(", "));
                // indices already on the target were not looked at, keep their sync time
                self.replicate_indices(&indices, false)?;
                Ok(())
            }
            Mode::All => {
                self.load_last_sync()?;
                loop {
                    let pass = self.full_pass();
                    if !self.opts.continuous {
                        return pass;
                    }
                    if let Err(err) = pass {
                        log::error!("replication pass failed: {}", err);
                    }
                    log::info!("next pass in {} seconds", self.opts.interval);
                    thread::sleep(Duration::from_secs(self.opts.interval));
                }
            }
        }
    }
}
