use std::process;

use env_logger::Env;
use structopt::StructOpt;

use es_admin::audit::{run_audit, AuditOptions};
use es_admin::client::{ConnectionOptions, EsClient};
use es_admin::cluster::ClusterAction;
use es_admin::index::IndexAction;
use es_admin::maintenance::{expunge_deletes, ExpungeOptions};
use es_admin::node_config::NodeConfigOptions;
use es_admin::policies::PolicyAction;
use es_admin::replicate::replicate;
use es_admin::request::EsRequest;
use es_admin::settings::ReplicateArgs;
use es_admin::Result;

#[derive(Debug, StructOpt)]
#[structopt(name = "es-admin", about = "Elasticsearch cluster administration")]
struct Opts {
    #[structopt(flatten)]
    connection: ConnectionOptions,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Generate elasticsearch.yml and jvm.options for a node
    NodeConfig(NodeConfigOptions),
    /// Index settings and maintenance
    Index(IndexAction),
    /// Cluster health, settings and index templates
    Cluster(ClusterAction),
    /// Index lifecycle policies
    Policy(PolicyAction),
    /// Force-merge indices with many deleted documents
    ExpungeDeletes(ExpungeOptions),
    /// Review indices, templates and nodes against best practices
    Check(AuditOptions),
    /// Copy indices from a source cluster to a target cluster
    Replicate(ReplicateArgs),
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let opts = Opts::from_args();
    if let Err(err) = run(&opts) {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn run(opts: &Opts) -> Result<()> {
    match &opts.command {
        Command::NodeConfig(node) => {
            if node.stdout {
                let rendered = node.render()?;
                println!("# elasticsearch.yml\n{}", rendered.elasticsearch_yml);
                println!("# jvm.options\n{}", rendered.jvm_options);
            } else {
                node.write()?;
            }
            Ok(())
        }
        Command::Index(action) => execute(&opts.connection, action.request()?),
        Command::Cluster(action) => execute(&opts.connection, action.request()?),
        Command::Policy(action) => execute(&opts.connection, action.request()?),
        Command::ExpungeDeletes(expunge) => {
            let client = EsClient::new(&opts.connection)?;
            let merged = expunge_deletes(&client, expunge)?;
            if !expunge.dry_run {
                log::info!("force-merged {} indices", merged.len());
            }
            Ok(())
        }
        Command::Check(audit) => {
            let client = EsClient::new(&opts.connection)?;
            let report = run_audit(&client, audit)?;
            print!("{}", report);
            Ok(())
        }
        Command::Replicate(args) => replicate(args),
    }
}

fn execute(connection: &ConnectionOptions, req: EsRequest) -> Result<()> {
    let client = EsClient::new(connection)?;
    let resp = client.send(&req)?;
    log::info!("method: {} path: {} status: {:?}", req.method, req.path, resp.status);
    println!("{}", resp.pretty());
    Ok(())
}
