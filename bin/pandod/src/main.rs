//! Pando Daemon - runs a node in the distribution network.
//!
//! Provides:
//! - DHT participation and chunk serving (`run`)
//! - Publishing local files into the network (`publish`)
//! - Fetching files by digest (`fetch`)
//! - Listing locally stored files (`ls`)

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use pando_core::Digest;
use pando_engine::{EngineConfig, EngineError, NodeSupervisor};

// Exit codes agreed with front-end wrappers.
const EXIT_USAGE: u8 = 1;
const EXIT_NOT_FOUND: u8 = 2;
const EXIT_INTEGRITY: u8 = 3;
const EXIT_NETWORK: u8 = 4;

/// Pando node daemon.
#[derive(Parser)]
#[command(name = "pandod")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.pando/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until interrupted
    Run,

    /// Publish a file into the network
    Publish {
        /// File to publish
        path: PathBuf,

        /// Data shards per stripe
        #[arg(short = 'k', long, default_value_t = 4)]
        data_shards: usize,

        /// Parity shards per stripe
        #[arg(short = 'm', long, default_value_t = 1)]
        parity_shards: usize,
    },

    /// Fetch a file by its digest
    Fetch {
        /// 64-character hex file digest
        digest: String,

        /// Where to write the file
        out: PathBuf,
    },

    /// List locally stored files
    Ls,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return ExitCode::from(EXIT_USAGE);
    }

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e:#}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match runtime.block_on(run_command(cli.command, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run_command(command: Command, config: EngineConfig) -> Result<(), EngineError> {
    let node = NodeSupervisor::start(config).await?;

    let result = match command {
        Command::Run => {
            println!("pando node running");
            println!("  node:  {}", node.engine().dht().local_id());
            println!("  serve: {}", node.serve_addr());
            println!("  dht:   {}", node.dht_endpoint());
            println!();
            println!("Press Ctrl+C to stop");

            match signal::ctrl_c().await {
                Ok(()) => info!("received shutdown signal"),
                Err(e) => error!("failed to listen for shutdown signal: {e}"),
            }
            Ok(())
        }

        Command::Publish {
            path,
            data_shards,
            parity_shards,
        } => node
            .publish(path, data_shards, parity_shards, None)
            .await
            .map(|digest| println!("{digest}")),

        Command::Fetch { digest, out } => match Digest::from_hex(&digest) {
            Ok(digest) => node.fetch_file(digest, out).await,
            Err(_) => Err(EngineError::Config(format!("invalid digest: {digest}"))),
        },

        Command::Ls => node.list_local().await.map(|records| {
            for record in records {
                println!(
                    "{}  {:>12}  {}",
                    record.file_digest,
                    record.size,
                    record.original_name.as_deref().unwrap_or("-")
                );
            }
        }),
    };

    node.shutdown().await;
    result
}

fn exit_code_for(error: &EngineError) -> u8 {
    use pando_store::StoreError;
    match error {
        EngineError::Config(_) => EXIT_USAGE,
        EngineError::FileNotFound(_) => EXIT_NOT_FOUND,
        EngineError::Store(StoreError::FileNotFound(_) | StoreError::ChunkNotFound(_)) => {
            EXIT_NOT_FOUND
        }
        EngineError::Store(StoreError::DigestMismatch { .. } | StoreError::Corrupt(_)) => {
            EXIT_INTEGRITY
        }
        _ => EXIT_NETWORK,
    }
}

/// Loads the TOML configuration, falling back to defaults when the file is
/// absent.
fn load_config(path: &PathBuf) -> Result<EngineConfig> {
    let path = expand_tilde(path);

    let data_dir = dirs::home_dir()
        .map(|h| h.join(".pando"))
        .unwrap_or_else(|| PathBuf::from(".pando"));
    let mut config = EngineConfig::new(data_dir);
    config.dht_port = 8468;
    config.serve_port = 9000;
    config.bind_address = "0.0.0.0".to_string();

    if !path.exists() {
        info!("no config file at {:?}, using defaults", path);
        return Ok(config);
    }

    let content = std::fs::read_to_string(&path).context("failed to read config file")?;
    let toml: toml::Value = content.parse().context("failed to parse config file")?;

    if let Some(node) = toml.get("node") {
        if let Some(id_file) = node.get("id_file").and_then(|v| v.as_str()) {
            config.node_id_file = expand_tilde(&PathBuf::from(id_file));
        }
        if let Some(data_dir) = node.get("data_dir").and_then(|v| v.as_str()) {
            let data_dir = expand_tilde(&PathBuf::from(data_dir));
            config.storage_dir = data_dir.join("storage");
        }
        if let Some(chunk_size) = node.get("chunk_size").and_then(|v| v.as_integer()) {
            config.chunk_size = chunk_size as u32;
        }
    }

    if let Some(network) = toml.get("network") {
        if let Some(bind) = network.get("bind").and_then(|v| v.as_str()) {
            bind.parse::<IpAddr>().context("invalid bind address")?;
            config.bind_address = bind.to_string();
        }
        if let Some(advertise) = network.get("advertise").and_then(|v| v.as_str()) {
            config.advertised_address = advertise.to_string();
        }
        if let Some(port) = network.get("dht_port").and_then(|v| v.as_integer()) {
            config.dht_port = port as u16;
        }
        if let Some(port) = network.get("serve_port").and_then(|v| v.as_integer()) {
            config.serve_port = port as u16;
        }
        if let Some(bootstrap) = network.get("bootstrap").and_then(|v| v.as_array()) {
            config.bootstrap_peers = bootstrap
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
    }

    if let Some(dht) = toml.get("dht") {
        if let Some(k) = dht.get("replication_factor").and_then(|v| v.as_integer()) {
            config.replication_factor = k as usize;
        }
        if let Some(ttl) = dht.get("ttl_secs").and_then(|v| v.as_integer()) {
            config.ttl = Duration::from_secs(ttl as u64);
        }
        if let Some(secs) = dht.get("rpc_timeout_secs").and_then(|v| v.as_integer()) {
            config.rpc_timeout = Duration::from_secs(secs as u64);
        }
    }

    if let Some(limits) = toml.get("limits") {
        if let Some(n) = limits.get("max_inflight").and_then(|v| v.as_integer()) {
            config.max_inflight = n as usize;
        }
        if let Some(n) = limits
            .get("max_serve_concurrency")
            .and_then(|v| v.as_integer())
        {
            config.max_serve_concurrency = n as usize;
        }
        if let Some(secs) = limits
            .get("request_timeout_secs")
            .and_then(|v| v.as_integer())
        {
            config.request_timeout = Duration::from_secs(secs as u64);
        }
    }

    Ok(config)
}

/// Expands a leading `~` to the home directory.
fn expand_tilde(path: &PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(&PathBuf::from("~/.pando/config.toml"));
        if let Some(home) = dirs::home_dir() {
            assert!(expanded.starts_with(&home));
            assert!(expanded.ends_with(".pando/config.toml"));
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&EngineError::Config("x".into())), EXIT_USAGE);
        assert_eq!(
            exit_code_for(&EngineError::FileNotFound(Digest::of(b"f"))),
            EXIT_NOT_FOUND
        );
        assert_eq!(
            exit_code_for(&EngineError::Unrecoverable {
                stripe: 0,
                available: 2,
                required: 4
            }),
            EXIT_NETWORK
        );
    }
}
