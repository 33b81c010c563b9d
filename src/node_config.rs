use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use structopt::StructOpt;

use crate::error::{Error, Result};

/// Above this heap the JVM loses compressed object pointers.
const COMPRESSED_OOPS_LIMIT: u64 = 31 * 1024 * 1024 * 1024;

#[derive(Debug, StructOpt, Clone)]
pub struct NodeConfigOptions {
    #[structopt(long, default_value = "es-cluster")]
    pub cluster_name: String,
    #[structopt(long)]
    pub node_name: String,
    /// Comma separated node roles
    #[structopt(long, default_value = "master,data,ingest", use_delimiter = true)]
    pub roles: Vec<String>,
    #[structopt(long, default_value = "0.0.0.0")]
    pub network_host: String,
    #[structopt(long, default_value = "9200")]
    pub http_port: u16,
    #[structopt(long, default_value = "9300")]
    pub transport_port: u16,
    /// Comma separated discovery seed hosts
    #[structopt(long, use_delimiter = true)]
    pub seed_hosts: Vec<String>,
    /// Comma separated master-eligible node names for the first cluster bootstrap
    #[structopt(long, use_delimiter = true)]
    pub initial_master_nodes: Vec<String>,
    #[structopt(long, default_value = "/var/lib/elasticsearch", parse(from_os_str))]
    pub data_path: PathBuf,
    #[structopt(long, default_value = "/var/log/elasticsearch", parse(from_os_str))]
    pub logs_path: PathBuf,
    #[structopt(long)]
    pub disable_security: bool,
    #[structopt(long)]
    pub no_memory_lock: bool,
    /// JVM heap size, e.g. `4g` or `512m`
    #[structopt(long, default_value = "2g")]
    pub heap: String,
    #[structopt(long, default_value = ".", parse(from_os_str))]
    pub output_dir: PathBuf,
    /// Print both files instead of writing them
    #[structopt(long)]
    pub stdout: bool,
}

#[derive(Debug, Serialize)]
struct ElasticsearchYml<'a> {
    #[serde(rename = "cluster.name")]
    cluster_name: &'a str,
    #[serde(rename = "node.name")]
    node_name: &'a str,
    #[serde(rename = "node.roles")]
    roles: &'a [String],
    #[serde(rename = "path.data")]
    data_path: &'a Path,
    #[serde(rename = "path.logs")]
    logs_path: &'a Path,
    #[serde(rename = "network.host")]
    network_host: &'a str,
    #[serde(rename = "http.port")]
    http_port: u16,
    #[serde(rename = "transport.port")]
    transport_port: u16,
    #[serde(rename = "discovery.seed_hosts", skip_serializing_if = "is_empty")]
    seed_hosts: &'a [String],
    #[serde(
        rename = "cluster.initial_master_nodes",
        skip_serializing_if = "is_empty"
    )]
    initial_master_nodes: &'a [String],
    #[serde(rename = "bootstrap.memory_lock")]
    memory_lock: bool,
    #[serde(rename = "xpack.security.enabled")]
    security_enabled: bool,
}

fn is_empty(list: &&[String]) -> bool {
    list.is_empty()
}

pub struct RenderedConfig {
    pub elasticsearch_yml: String,
    pub jvm_options: String,
}

impl NodeConfigOptions {
    pub fn render(&self) -> Result<RenderedConfig> {
        if self.node_name.trim().is_empty() {
            return Err(Error::InvalidArgument("node name must not be empty".to_string()));
        }
        let heap_bytes = parse_heap(&self.heap)?;
        if heap_bytes > COMPRESSED_OOPS_LIMIT {
            log::warn!(
                "heap {} is above 31g, the JVM will not use compressed object pointers",
                self.heap
            );
        }

        let yml = ElasticsearchYml {
            cluster_name: &self.cluster_name,
            node_name: &self.node_name,
            roles: &self.roles,
            data_path: &self.data_path,
            logs_path: &self.logs_path,
            network_host: &self.network_host,
            http_port: self.http_port,
            transport_port: self.transport_port,
            seed_hosts: &self.seed_hosts,
            initial_master_nodes: &self.initial_master_nodes,
            memory_lock: !self.no_memory_lock,
            security_enabled: !self.disable_security,
        };
        Ok(RenderedConfig {
            elasticsearch_yml: serde_yaml::to_string(&yml)?,
            jvm_options: jvm_options(&self.heap, &self.logs_path),
        })
    }

    /// Writes `elasticsearch.yml` and `jvm.options` into the output directory.
    pub fn write(&self) -> Result<Vec<PathBuf>> {
        let rendered = self.render()?;
        fs::create_dir_all(&self.output_dir).map_err(|source| Error::Io {
            path: self.output_dir.clone(),
            source,
        })?;
        let files = vec![
            (self.output_dir.join("elasticsearch.yml"), rendered.elasticsearch_yml),
            (self.output_dir.join("jvm.options"), rendered.jvm_options),
        ];
        let mut written = Vec::with_capacity(files.len());
        for (path, content) in files {
            fs::write(&path, content).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
            log::info!("wrote {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

fn jvm_options(heap: &str, logs_path: &Path) -> String {
    let logs = logs_path.display();
    format!(
        "-Xms{heap}\n\
         -Xmx{heap}\n\
         \n\
         -XX:+UseG1GC\n\
         -XX:G1ReservePercent=25\n\
         -XX:InitiatingHeapOccupancyPercent=30\n\
         \n\
         -XX:+HeapDumpOnOutOfMemoryError\n\
         -XX:HeapDumpPath={logs}\n\
         -XX:ErrorFile={logs}/hs_err_pid%p.log\n\
         \n\
         -Xlog:gc*,gc+age=trace,safepoint:file={logs}/gc.log:utctime,pid,tags:filecount=32,filesize=64m\n",
        heap = heap,
        logs = logs
    )
}

/// Heap size in bytes from JVM notation (`512m`, `4g`).
pub fn parse_heap(heap: &str) -> Result<u64> {
    let re = Regex::new(r"^(\d+)([kKmMgG])$")?;
    let invalid = || Error::InvalidArgument(format!("invalid heap size {:?}, expected e.g. 4g or 512m", heap));
    let caps = re.captures(heap).ok_or_else(invalid)?;
    let value: u64 = caps[1].parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }
    let unit = match &caps[2] {
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        _ => 1024 * 1024 * 1024,
    };
    value.checked_mul(unit).ok_or_else(invalid)
}
