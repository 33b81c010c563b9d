//! Reclaim space held by deleted documents: list segment statistics, pick the
//! indices whose deleted-document ratio is above a threshold and force-merge
//! them one after the other.

use std::collections::BTreeMap;

use serde::Deserialize;
use structopt::StructOpt;

use crate::client::EsClient;
use crate::error::{Error, Result};
use crate::request::{require_index, EsRequest};

#[derive(Debug, StructOpt, Clone)]
pub struct ExpungeOptions {
    /// Index pattern to inspect
    #[structopt(long, default_value = "*")]
    pub pattern: String,
    /// Merge indices whose deleted / (live + deleted) ratio is above this
    #[structopt(long, default_value = "0.1")]
    pub threshold: f64,
    /// Only print the indices that would be merged
    #[structopt(long)]
    pub dry_run: bool,
}

/// One row of `_cat/segments?format=json`. The cat API reports numbers as strings.
#[derive(Debug, Deserialize)]
pub struct SegmentRow {
    pub index: String,
    #[serde(rename = "docs.count", default)]
    pub docs_count: Option<String>,
    #[serde(rename = "docs.deleted", default)]
    pub docs_deleted: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndexDeletes {
    pub count: u64,
    pub deleted: u64,
}

impl IndexDeletes {
    /// Share of deleted documents; 0 for an empty index.
    pub fn ratio(&self) -> f64 {
        let total = self.count + self.deleted;
        if total == 0 {
            return 0.0;
        }
        self.deleted as f64 / total as f64
    }
}

fn parse_count(value: &Option<String>) -> u64 {
    value.as_deref().and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Sums segment rows per index.
pub fn aggregate(rows: &[SegmentRow]) -> BTreeMap<String, IndexDeletes> {
    let mut totals: BTreeMap<String, IndexDeletes> = BTreeMap::new();
    for row in rows {
        let entry = totals.entry(row.index.clone()).or_default();
        entry.count += parse_count(&row.docs_count);
        entry.deleted += parse_count(&row.docs_deleted);
    }
    totals
}

/// Indices above the threshold, in name order.
pub fn select(totals: &BTreeMap<String, IndexDeletes>, threshold: f64) -> Vec<(String, IndexDeletes)> {
    totals
        .iter()
        .filter(|(_, deletes)| deletes.count + deletes.deleted > 0 && deletes.ratio() > threshold)
        .map(|(index, deletes)| (index.clone(), *deletes))
        .collect()
}

pub fn segments_request(pattern: &str) -> Result<EsRequest> {
    Ok(EsRequest::get(format!(
        "/_cat/segments/{}?format=json&h=index,segment,docs.count,docs.deleted",
        require_index(pattern)?
    )))
}

pub fn expunge_request(index: &str) -> EsRequest {
    EsRequest::post(format!("/{}/_forcemerge?only_expunge_deletes=true", index))
}

/// Runs the pipeline. Returns the selected indices; when some merges failed the
/// remaining ones are still attempted and the run ends in `Error::Maintenance`.
pub fn expunge_deletes(client: &EsClient, opts: &ExpungeOptions) -> Result<Vec<String>> {
    if !(0.0..=1.0).contains(&opts.threshold) {
        return Err(Error::InvalidArgument(format!(
            "threshold must be between 0 and 1, got {}",
            opts.threshold
        )));
    }
    let rows: Vec<SegmentRow> = client.send(&segments_request(&opts.pattern)?)?.json()?;
    let totals = aggregate(&rows);
    let selected = select(&totals, opts.threshold);
    log::info!(
        "{} of {} indices above deleted ratio {}",
        selected.len(),
        totals.len(),
        opts.threshold
    );

    let mut failed = 0;
    for (index, deletes) in &selected {
        if opts.dry_run {
            println!(
                "{} deleted={} live={} ratio={:.3}",
                index,
                deletes.deleted,
                deletes.count,
                deletes.ratio()
            );
            continue;
        }
        log::info!("force-merge index: {} ratio: {:.3}", index, deletes.ratio());
        match client.send(&expunge_request(index)) {
            Ok(resp) => log::info!("force-merge index: {} status: {:?}", index, resp.status),
            Err(err) => {
                log::error!("force-merge index: {} error: {}", index, err);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(Error::Maintenance {
            failed,
            attempted: selected.len(),
        });
    }
    Ok(selected.into_iter().map(|(index, _)| index).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: &str, count: &str, deleted: &str) -> SegmentRow {
        SegmentRow {
            index: index.to_string(),
            docs_count: Some(count.to_string()),
            docs_deleted: Some(deleted.to_string()),
        }
    }

    #[test]
    fn sums_segments_per_index() {
        let rows = vec![row("a", "90", "5"), row("a", "10", "15"), row("b", "7", "0")];
        let totals = aggregate(&rows);
        assert_eq!(totals["a"], IndexDeletes { count: 100, deleted: 20 });
        assert_eq!(totals["b"], IndexDeletes { count: 7, deleted: 0 });
    }

    #[test]
    fn garbage_counts_as_zero() {
        let rows = vec![
            row("a", "n/a", "3"),
            SegmentRow {
                index: "a".to_string(),
                docs_count: None,
                docs_deleted: None,
            },
        ];
        assert_eq!(aggregate(&rows)["a"], IndexDeletes { count: 0, deleted: 3 });
    }

    #[test]
    fn selection_is_strictly_above_threshold() {
        let rows = vec![
            row("exact", "90", "10"),
            row("above", "80", "20"),
            row("below", "99", "1"),
            row("empty", "0", "0"),
        ];
        let selected = select(&aggregate(&rows), 0.1);
        let names: Vec<&str> = selected.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["above"]);
    }

    #[test]
    fn zero_threshold_skips_empty_indices() {
        let rows = vec![row("b", "1", "1"), row("a", "0", "0"), row("c", "5", "0")];
        let selected = select(&aggregate(&rows), 0.0);
        let names: Vec<&str> = selected.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn cat_rows_decode_from_strings() {
        let rows: Vec<SegmentRow> = serde_json::from_str(
            r#"[{"index":"logs","segment":"_0","docs.count":"12","docs.deleted":"3"}]"#,
        )
        .unwrap();
        assert_eq!(aggregate(&rows)["logs"], IndexDeletes { count: 12, deleted: 3 });
    }

    #[test]
    fn request_shapes() {
        assert_eq!(
            segments_request("logs-*").unwrap().path,
            "/_cat/segments/logs-*?format=json&h=index,segment,docs.count,docs.deleted"
        );
        assert_eq!(
            expunge_request("logs").path,
            "/logs/_forcemerge?only_expunge_deletes=true"
        );
    }
}
