//! Command-line arguments for the store binary.

use clap::Parser;

use crate::config::{Config, FileStorageConfig, PeerConfig, StorageConfig, load_config};
use crate::error::{Error, Result};
use crate::peer::PeerType;

/// CLI arguments for the server.
///
/// Flags override the values read from `--config`.
#[derive(Parser, Debug, Default)]
#[command(name = "store")]
#[command(about = "Store node for a coordination-free log cluster")]
pub struct CliArgs {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "STORE_CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "STORE_PORT")]
    pub port: Option<u16>,

    /// Address other nodes use to reach this node (host:port)
    #[arg(long, env = "STORE_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Role of this node: store, ingest or ingeststore
    #[arg(long, env = "STORE_ROLE")]
    pub role: Option<PeerType>,

    /// Cluster peer as host:port or host:port=role; repeatable
    #[arg(long = "peer", env = "STORE_PEERS", value_delimiter = ',', value_parser = parse_peer)]
    pub peers: Vec<PeerConfig>,

    /// Directory for segment files
    #[arg(long, env = "STORE_DATA_DIR", conflicts_with = "in_memory")]
    pub data_dir: Option<String>,

    /// Keep segments in memory only
    #[arg(long)]
    pub in_memory: bool,

    /// Timeout for each internal query, in milliseconds
    #[arg(long, env = "STORE_QUERY_TIMEOUT_MS")]
    pub query_timeout_ms: Option<u64>,

    /// Membership refresh interval for streams, in milliseconds
    #[arg(long, env = "STORE_STREAM_REFRESH_INTERVAL_MS")]
    pub stream_refresh_interval_ms: Option<u64>,
}

impl CliArgs {
    /// Loads the configuration file, if any, and applies the flags on top.
    pub fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(addr) = &self.advertise_addr {
            config.cluster.advertise_addr = Some(addr.clone());
        }
        if let Some(role) = self.role {
            config.cluster.role = role;
        }
        if !self.peers.is_empty() {
            config.cluster.peers = self.peers.clone();
        }
        if self.in_memory {
            config.storage = StorageConfig::InMemory;
        } else if let Some(path) = &self.data_dir {
            config.storage = StorageConfig::File(FileStorageConfig { path: path.clone() });
        }
        if let Some(timeout) = self.query_timeout_ms {
            config.query_timeout_ms = timeout;
        }
        if let Some(interval) = self.stream_refresh_interval_ms {
            config.stream_refresh_interval_ms = interval;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_peer(value: &str) -> Result<PeerConfig> {
    let (addr, role) = match value.split_once('=') {
        Some((addr, role)) => (addr, role.parse()?),
        None => (value, PeerType::Store),
    };
    if addr.is_empty() {
        return Err(Error::InvalidInput(format!("invalid peer {:?}", value)));
    }
    Ok(PeerConfig {
        addr: addr.to_string(),
        role,
    })
}
