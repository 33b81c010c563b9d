//! Replication configuration: an optional YAML file merged with command line
//! overrides. Command line values win.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use structopt::StructOpt;

use crate::client::ConnectionOptions;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ClusterEndpoint {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

impl ClusterEndpoint {
    /// Connection to the first configured host.
    pub fn connection(&self, name: &str, timeout: u64) -> Result<ConnectionOptions> {
        let host = self
            .hosts
            .iter()
            .map(|h| h.trim())
            .find(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("{} cluster hosts must be specified", name)))?;
        Ok(ConnectionOptions {
            url: host.to_string(),
            user: self.username.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
            timeout,
        })
    }
}

/// How documents reach the target.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CopyMethod {
    /// Scroll the source and bulk-index into the target.
    Scroll,
    /// Let the target pull with `_reindex` from a remote source.
    Reindex,
}

impl Default for CopyMethod {
    fn default() -> Self {
        CopyMethod::Scroll
    }
}

impl FromStr for CopyMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scroll" => Ok(CopyMethod::Scroll),
            "reindex" => Ok(CopyMethod::Reindex),
            other => Err(Error::InvalidArgument(format!("unknown copy method: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationOptions {
    pub continuous: bool,
    /// Seconds between passes in continuous mode.
    pub interval: u64,
    pub timestamp_field: Option<String>,
    pub exclude_patterns: Vec<String>,
    pub batch_size: usize,
    pub scroll: String,
    pub method: CopyMethod,
    /// Request timeout in seconds.
    pub timeout: u64,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        ReplicationOptions {
            continuous: false,
            interval: 3600,
            timestamp_field: None,
            exclude_patterns: Vec::new(),
            batch_size: 1000,
            scroll: "5m".to_string(),
            method: CopyMethod::Scroll,
            timeout: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub source: ClusterEndpoint,
    #[serde(default)]
    pub target: ClusterEndpoint,
    #[serde(default)]
    pub replication: ReplicationOptions,
}

#[derive(Debug, StructOpt, Clone, Default)]
pub struct ReplicateArgs {
    /// YAML file with source, target and replication sections
    #[structopt(long, parse(from_os_str))]
    pub config: Option<PathBuf>,
    /// Only copy indices missing from the target
    #[structopt(long)]
    pub missing_only: bool,
    /// Compare source and target without copying
    #[structopt(long)]
    pub verify_only: bool,
    /// Comma separated source hosts
    #[structopt(long, use_delimiter = true)]
    pub source_hosts: Vec<String>,
    #[structopt(long)]
    pub source_user: Option<String>,
    #[structopt(long, env = "SOURCE_ES_PASSWORD", hide_env_values = true)]
    pub source_password: Option<String>,
    /// Comma separated target hosts
    #[structopt(long, use_delimiter = true)]
    pub target_hosts: Vec<String>,
    #[structopt(long)]
    pub target_user: Option<String>,
    #[structopt(long, env = "TARGET_ES_PASSWORD", hide_env_values = true)]
    pub target_password: Option<String>,
    /// Repeat every `--interval` seconds
    #[structopt(long)]
    pub continuous: bool,
    #[structopt(long)]
    pub interval: Option<u64>,
    /// Date field used for incremental passes
    #[structopt(long)]
    pub timestamp_field: Option<String>,
    /// Comma separated regexes of index names to skip
    #[structopt(long, use_delimiter = true)]
    pub exclude_patterns: Vec<String>,
    #[structopt(long)]
    pub batch_size: Option<usize>,
    /// scroll or reindex
    #[structopt(long)]
    pub method: Option<CopyMethod>,
}

impl ReplicationSettings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// File settings (when `--config` is given) with command line overrides applied.
    pub fn resolve(args: &ReplicateArgs) -> Result<Self> {
        let mut settings = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply(args);
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply(&mut self, args: &ReplicateArgs) {
        override_endpoint(
            &mut self.source,
            &args.source_hosts,
            &args.source_user,
            &args.source_password,
        );
        override_endpoint(
            &mut self.target,
            &args.target_hosts,
            &args.target_user,
            &args.target_password,
        );
        let replication = &mut self.replication;
        if args.continuous {
            replication.continuous = true;
        }
        if let Some(interval) = args.interval {
            replication.interval = interval;
        }
        if args.timestamp_field.is_some() {
            replication.timestamp_field = args.timestamp_field.clone();
        }
        replication
            .exclude_patterns
            .extend(args.exclude_patterns.iter().cloned());
        if let Some(batch_size) = args.batch_size {
            replication.batch_size = batch_size;
        }
        if let Some(method) = args.method {
            replication.method = method;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.source.connection("source", self.replication.timeout)?;
        self.target.connection("target", self.replication.timeout)?;
        if self.replication.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be at least 1".to_string()));
        }
        if self.replication.continuous && self.replication.interval == 0 {
            return Err(Error::InvalidArgument("interval must be at least 1 second".to_string()));
        }
        Ok(())
    }
}

fn override_endpoint(
    endpoint: &mut ClusterEndpoint,
    hosts: &[String],
    user: &Option<String>,
    password: &Option<String>,
) {
    if !hosts.is_empty() {
        endpoint.hosts = hosts.to_vec();
    }
    if let (Some(user), Some(password)) = (user, password) {
        endpoint.username = Some(user.clone());
        endpoint.password = Some(password.clone());
    }
}
