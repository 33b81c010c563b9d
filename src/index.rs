use serde_json::{json, Value};
use structopt::StructOpt;

use crate::error::{Error, Result};
use crate::request::{require_index, EsRequest};

/// Maintenance actions on one index (or a comma separated list / wildcard).
#[derive(Debug, StructOpt, Clone, PartialEq)]
#[structopt(rename_all = "kebab-case")]
pub enum IndexAction {
    /// Show index settings
    Settings { index: String },
    /// Block writes and metadata changes
    ReadOnly { index: String },
    /// Lift read-only blocks, including the one set by the disk watermark
    ReadWrite { index: String },
    Close { index: String },
    Open { index: String },
    /// Merge segments
    ForceMerge {
        index: String,
        /// Target segment count per shard (defaults to 1)
        #[structopt(long)]
        max_num_segments: Option<u32>,
        /// Only reclaim segments holding deleted documents
        #[structopt(long)]
        only_expunge_deletes: bool,
    },
    Refresh { index: String },
    Stats { index: String },
    /// List segments in `_cat` form
    Segments { index: String },
    /// Change the replica count
    Replicas { index: String, count: u32 },
    /// Change the refresh interval (`-1` disables refresh)
    RefreshInterval {
        index: String,
        #[structopt(allow_hyphen_values = true)]
        interval: String,
    },
}

impl IndexAction {
    pub fn request(&self) -> Result<EsRequest> {
        let req = match self {
            IndexAction::Settings { index } => EsRequest::get(format!("/{}/_settings", require_index(index)?)),
            IndexAction::ReadOnly { index } => put_settings(index, json!({ "index.blocks.read_only": true }))?,
            IndexAction::ReadWrite { index } => put_settings(
                index,
                json!({
                    "index.blocks.read_only": false,
                    "index.blocks.read_only_allow_delete": null
                }),
            )?,
            IndexAction::Close { index } => EsRequest::post(format!("/{}/_close", require_index(index)?)),
            IndexAction::Open { index } => EsRequest::post(format!("/{}/_open", require_index(index)?)),
            IndexAction::ForceMerge {
                index,
                max_num_segments,
                only_expunge_deletes,
            } => {
                let index = require_index(index)?;
                if *only_expunge_deletes {
                    if max_num_segments.is_some() {
                        return Err(Error::InvalidArgument(
                            "max_num_segments and only_expunge_deletes are mutually exclusive".to_string(),
                        ));
                    }
                    EsRequest::post(format!("/{}/_forcemerge?only_expunge_deletes=true", index))
                } else {
                    let segments = max_num_segments.unwrap_or(1);
                    if segments == 0 {
                        return Err(Error::InvalidArgument("max_num_segments must be at least 1".to_string()));
                    }
                    EsRequest::post(format!("/{}/_forcemerge?max_num_segments={}", index, segments))
                }
            }
            IndexAction::Refresh { index } => EsRequest::post(format!("/{}/_refresh", require_index(index)?)),
            IndexAction::Stats { index } => EsRequest::get(format!("/{}/_stats", require_index(index)?)),
            IndexAction::Segments { index } => EsRequest::get(format!("/_cat/segments/{}?v", require_index(index)?)),
            IndexAction::Replicas { index, count } => {
                put_settings(index, json!({ "index.number_of_replicas": count }))?
            }
            IndexAction::RefreshInterval { index, interval } => {
                put_settings(index, json!({ "index.refresh_interval": interval }))?
            }
        };
        Ok(req)
    }
}

fn put_settings(index: &str, body: Value) -> Result<EsRequest> {
    Ok(EsRequest::put_json(format!("/{}/_settings", require_index(index)?), body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    fn index(name: &str) -> String {
        name.to_string()
    }

    #[test]
    fn read_only_toggle() {
        let req = IndexAction::ReadOnly { index: index("logs") }.request().unwrap();
        assert_eq!(req.method, Method::PUT);
        assert_eq!(req.path, "/logs/_settings");
        assert_eq!(req.body, Some(json!({"index.blocks.read_only": true})));

        let req = IndexAction::ReadWrite { index: index("logs") }.request().unwrap();
        assert_eq!(
            req.body,
            Some(json!({"index.blocks.read_only": false, "index.blocks.read_only_allow_delete": null}))
        );
    }

    #[test]
    fn force_merge_variants() {
        let req = IndexAction::ForceMerge {
            index: index("logs-2024.01"),
            max_num_segments: None,
            only_expunge_deletes: false,
        }
        .request()
        .unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.path, "/logs-2024.01/_forcemerge?max_num_segments=1");
        assert_eq!(req.body, None);

        let req = IndexAction::ForceMerge {
            index: index("logs"),
            max_num_segments: Some(5),
            only_expunge_deletes: false,
        }
        .request()
        .unwrap();
        assert_eq!(req.path, "/logs/_forcemerge?max_num_segments=5");

        let req = IndexAction::ForceMerge {
            index: index("logs"),
            max_num_segments: None,
            only_expunge_deletes: true,
        }
        .request()
        .unwrap();
        assert_eq!(req.path, "/logs/_forcemerge?only_expunge_deletes=true");
    }

    #[test]
    fn force_merge_rejects_bad_combinations() {
        let both = IndexAction::ForceMerge {
            index: index("logs"),
            max_num_segments: Some(1),
            only_expunge_deletes: true,
        };
        assert!(both.request().is_err());

        let zero = IndexAction::ForceMerge {
            index: index("logs"),
            max_num_segments: Some(0),
            only_expunge_deletes: false,
        };
        assert!(zero.request().is_err());
    }

    #[test]
    fn simple_paths() {
        let cases = vec![
            (IndexAction::Settings { index: index("a") }, Method::GET, "/a/_settings"),
            (IndexAction::Close { index: index("a") }, Method::POST, "/a/_close"),
            (IndexAction::Open { index: index("a") }, Method::POST, "/a/_open"),
            (IndexAction::Refresh { index: index("a") }, Method::POST, "/a/_refresh"),
            (IndexAction::Stats { index: index("a") }, Method::GET, "/a/_stats"),
            (IndexAction::Segments { index: index("a") }, Method::GET, "/_cat/segments/a?v"),
        ];
        for (action, method, path) in cases {
            let req = action.request().unwrap();
            assert_eq!(req.method, method);
            assert_eq!(req.path, path);
            assert_eq!(req.body, None);
        }
    }

    #[test]
    fn replica_and_refresh_settings() {
        let req = IndexAction::Replicas { index: index("a"), count: 0 }.request().unwrap();
        assert_eq!(req.body, Some(json!({"index.number_of_replicas": 0})));

        let req = IndexAction::RefreshInterval {
            index: index("a"),
            interval: "-1".to_string(),
        }
        .request()
        .unwrap();
        assert_eq!(req.body, Some(json!({"index.refresh_interval": "-1"})));
    }

    #[test]
    fn empty_index_never_reaches_cluster_endpoint() {
        let err = IndexAction::ReadOnly { index: index("") }.request().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn parses_from_command_line() {
        let action = IndexAction::from_iter(vec!["index", "force-merge", "logs", "--only-expunge-deletes"]);
        assert_eq!(
            action,
            IndexAction::ForceMerge {
                index: index("logs"),
                max_num_segments: None,
                only_expunge_deletes: true,
            }
        );
    }
}
