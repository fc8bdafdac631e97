use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use concord_core::config::Settings;
use concord_core::{LocalMembership, LocalMessagingHub, PartitionAssignment, PartitionedDatabase, StorageService};
use concord_types::NodeId;

#[derive(clap::Parser, Debug)]
#[command(name = "concord-node", about = "Concord consistent map node")]
struct Cli {
    #[arg(long)]
    node_id: String,
    /// Peer node ids, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Partition assignment document; overrides `storage.partition_file`
    #[arg(long)]
    partitions: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(flatten)]
    settings: Settings,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("CONCORD_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    let log_format = config.observability.log_format.as_str();
    match log_format {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let local = NodeId::new(cli.node_id.clone());
    let peers: Vec<NodeId> = cli.peers.iter().cloned().map(NodeId::new).collect();
    tracing::info!(node_id = %local, peers = peers.len(), "node starting");

    let partition_file = cli
        .partitions
        .clone()
        .or_else(|| config.settings.storage.partition_file.as_ref().map(PathBuf::from));
    let assignment = match partition_file {
        Some(path) => PartitionAssignment::load(&path)
            .with_context(|| format!("invalid partition assignment: {}", path.display()))?,
        None => {
            let mut nodes = peers.clone();
            nodes.push(local.clone());
            PartitionAssignment::generate(&nodes)
        }
    };
    let hosted = assignment.partitions_for(&local);
    tracing::info!(partitions = ?assignment.partition_names(), hosted = ?hosted, "partition assignment loaded");

    let database = PartitionedDatabase::local(&assignment, config.settings.storage.partitioner)
        .context("failed to build partitioned database")?;
    let membership = Arc::new(LocalMembership::new(local.clone(), peers));
    let messaging = LocalMessagingHub::new().join(local.clone());
    let service = StorageService::new(Arc::new(database), membership, Arc::new(messaging), config.settings);

    service.start().await.context("failed to start storage service")?;

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!(node_id = %local, "shutting down");

    service.stop().await.context("failed to stop storage service")?;
    Ok(())
}
