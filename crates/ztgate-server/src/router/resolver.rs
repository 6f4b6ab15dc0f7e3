//! Hostname resolution via `tokio::net::lookup_host`.

use std::net::SocketAddr;
use tokio::net;
use tracing::{debug, warn};
use ztgate_core::RoutingError;

/// Stateless async resolver.
pub struct DnsResolver;

impl DnsResolver {
    /// Resolve `host` to socket addresses carrying `port`.
    ///
    /// IP literals come back unchanged without a lookup. An answer with no
    /// addresses is an error.
    pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, RoutingError> {
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(vec![SocketAddr::new(ip.to_canonical(), port)]);
        }

        match net::lookup_host((host, port)).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs
                    .map(|a| SocketAddr::new(a.ip().to_canonical(), a.port()))
                    .collect();
                if addrs.is_empty() {
                    debug!(host = %host, "no addresses found");
                    return Err(RoutingError::Resolve {
                        host: host.to_string(),
                        message: "no addresses".into(),
                    });
                }
                debug!(host = %host, count = addrs.len(), "resolved");
                Ok(addrs)
            }
            Err(e) => {
                warn!(host = %host, error = %e, "DNS resolution failed");
                Err(RoutingError::Resolve {
                    host: host.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}
