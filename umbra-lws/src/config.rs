//! Server configuration and fixed protocol constants.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::crypto::{keccak256, Hash};

/// How long a daemon send may block before it is treated as a connection failure.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// Receive timeout for block retrieval; the request is re-sent on expiry.
pub const BLOCK_RPC_TIMEOUT: Duration = Duration::from_secs(120);
/// Receive timeout for chain synchronization requests.
pub const SYNC_RPC_TIMEOUT: Duration = Duration::from_secs(30);
/// How often the supervisor re-reads the active account set.
pub const ACCOUNT_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// How long a worker sleeps when the daemon has no new blocks.
pub const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(20);
/// Granularity of shutdown checks inside long sleeps.
pub const SHUTDOWN_QUANTUM: Duration = Duration::from_millis(500);

/// Coinbase outputs stay locked for this many blocks past their height.
pub const COINBASE_UNLOCK_WINDOW: u64 = 60;

/// Which umbra network the server operates on. Determines the address tag
/// byte and the genesis anchor of the local chain tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Main network.
    Mainnet,
    /// Public test network.
    Testnet,
    /// Staging network.
    Stagenet,
}

impl Network {
    /// Tag byte prepended to base58 addresses.
    pub fn address_tag(self) -> u8 {
        match self {
            Network::Mainnet => 0x12,
            Network::Testnet => 0x35,
            Network::Stagenet => 0x18,
        }
    }

    pub(crate) fn from_address_tag(tag: u8) -> Option<Self> {
        match tag {
            0x12 => Some(Network::Mainnet),
            0x35 => Some(Network::Testnet),
            0x18 => Some(Network::Stagenet),
            _ => None,
        }
    }

    /// Hash of the network's genesis block, the anchor of every chain tail.
    pub fn genesis_hash(self) -> Hash {
        let tag = match self {
            Network::Mainnet => "umbra-mainnet-genesis",
            Network::Testnet => "umbra-testnet-genesis",
            Network::Stagenet => "umbra-stagenet-genesis",
        };
        Hash(keccak256(tag.as_bytes()))
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "stagenet" => Ok(Network::Stagenet),
            other => Err(format!("unknown network \"{other}\"")),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Stagenet => write!(f, "stagenet"),
        }
    }
}

/// Everything needed to start the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Network the daemon is expected to serve.
    pub network: Network,
    /// Address of the full node's message socket.
    pub daemon_addr: String,
    /// Bind address for the REST API.
    pub rest_bind: SocketAddr,
    /// Directory holding the account database.
    pub db_path: PathBuf,
    /// Number of concurrent scan workers.
    pub scan_workers: usize,
    /// Maximum number of pending account creation requests.
    pub create_queue_max: usize,
}
