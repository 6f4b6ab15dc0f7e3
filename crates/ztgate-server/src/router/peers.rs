//! Live view of the overlay's configured peers.
//!
//! Queried on every routing decision into the overlay; nothing is cached
//! beyond a single call.

use std::future::Future;
use std::pin::Pin;
use tokio::process::Command;
use tracing::debug;
use ztgate_core::{IpCidr, RoutingError};

pub trait PeerTable: Send + Sync {
    /// Addresses currently allowed for configured peers.
    fn allowed_ips(&self) -> Pin<Box<dyn Future<Output = Result<Vec<IpCidr>, RoutingError>> + Send + '_>>;
}

/// Reads `wg show <interface> allowed-ips`.
pub struct WgPeerTable {
    interface: String,
}

impl WgPeerTable {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    async fn query(&self) -> Result<Vec<IpCidr>, RoutingError> {
        let cmd_str = format!("wg show {} allowed-ips", self.interface);
        debug!("Running: {}", cmd_str);

        let output = Command::new("wg")
            .args(["show", &self.interface, "allowed-ips"])
            .output()
            .await
            .map_err(|e| RoutingError::PeerTable(format!("{cmd_str}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RoutingError::PeerTable(format!("{cmd_str}: {}", stderr.trim())));
        }

        Ok(parse_allowed_ips(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl PeerTable for WgPeerTable {
    fn allowed_ips(&self) -> Pin<Box<dyn Future<Output = Result<Vec<IpCidr>, RoutingError>> + Send + '_>> {
        Box::pin(self.query())
    }
}

/// Parse `<public-key>\t<cidr> <cidr>...` lines. Peers without addresses
/// print `(none)`; unparseable entries are skipped.
pub fn parse_allowed_ips(output: &str) -> Vec<IpCidr> {
    output
        .lines()
        .filter_map(|line| line.split_once('\t').map(|(_, ips)| ips))
        .flat_map(str::split_whitespace)
        .filter_map(|entry| entry.parse().ok())
        .collect()
}

/// Fixed peer list from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerTable {
    peers: Vec<IpCidr>,
}

impl StaticPeerTable {
    pub fn new(peers: Vec<IpCidr>) -> Self {
        Self { peers }
    }
}

impl PeerTable for StaticPeerTable {
    fn allowed_ips(&self) -> Pin<Box<dyn Future<Output = Result<Vec<IpCidr>, RoutingError>> + Send + '_>> {
        let peers = self.peers.clone();
        Box::pin(async move { Ok(peers) })
    }
}
