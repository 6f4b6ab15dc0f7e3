//! Peer-path versus external-path selection and dialing.

use super::marker::{MarkLease, PacketMarker};
use super::peers::PeerTable;
use super::resolver::DnsResolver;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, warn};
use ztgate_core::target::split_host_port;
use ztgate_core::{IpCidr, RoutingError};

/// Where an authorized flow goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A configured overlay peer, dialed over the tunnel interface.
    Peer(SocketAddr),
    /// A normal endpoint outside the overlay.
    External { host: String, addrs: Vec<SocketAddr> },
}

impl Route {
    pub fn is_peer(&self) -> bool {
        matches!(self, Route::Peer(_))
    }

    /// Addresses to dial, in order.
    pub fn addrs(&self) -> &[SocketAddr] {
        match self {
            Route::Peer(addr) => std::slice::from_ref(addr),
            Route::External { addrs, .. } => addrs,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Peer(addr) => write!(f, "peer {addr}"),
            Route::External { host, addrs } => match addrs.first() {
                Some(a) => write!(f, "external {host} ({a})"),
                None => write!(f, "external {host}"),
            },
        }
    }
}

pub struct DestinationRouter {
    overlay: IpCidr,
    peers: Arc<dyn PeerTable>,
    marker: Arc<dyn PacketMarker>,
    /// Local overlay address peer dials are bound to.
    source_addr: Option<IpAddr>,
    connect_timeout: Duration,
}

impl DestinationRouter {
    pub fn new(
        overlay: IpCidr,
        peers: Arc<dyn PeerTable>,
        marker: Arc<dyn PacketMarker>,
        source_addr: Option<IpAddr>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            overlay,
            peers,
            marker,
            source_addr,
            connect_timeout,
        }
    }

    pub fn overlay(&self) -> IpCidr {
        self.overlay
    }

    /// Local address peer-path dials are bound to, if configured.
    pub fn peer_source(&self) -> Option<IpAddr> {
        self.source_addr
    }

    /// Pick the path for `target` (`host[:port]`). `default_port` fills in a
    /// missing port; with neither the target is invalid.
    ///
    /// Hostnames are resolved first. If any resolved address falls inside
    /// the overlay, that address must belong to a configured peer.
    pub async fn route(&self, target: &str, default_port: Option<u16>) -> Result<Route, RoutingError> {
        let (host, port) = split_host_port(target).map_err(RoutingError::InvalidTarget)?;
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let port = port
            .or(default_port)
            .ok_or_else(|| RoutingError::InvalidTarget(format!("'{target}' has no port")))?;

        let addrs = DnsResolver::resolve(&host, port).await?;

        let Some(inside) = addrs.iter().find(|a| self.overlay.contains(a.ip())).copied() else {
            debug!(target = %target, "external path");
            return Ok(Route::External { host, addrs });
        };

        let peers = self.peers.allowed_ips().await?;
        if peers.iter().any(|p| p.contains(inside.ip())) {
            debug!(target = %target, peer = %inside, "peer path");
            Ok(Route::Peer(inside))
        } else {
            Err(RoutingError::UnknownPeer(inside.ip()))
        }
    }

    /// Tag egress from an authorized flow's source. A failure is logged and
    /// the flow goes on unmarked.
    pub async fn mark(&self, source: IpAddr) -> Option<MarkLease> {
        match self.marker.mark(source).await {
            Ok(()) => Some(MarkLease::new(self.marker.clone(), source)),
            Err(e) => {
                warn!(source = %source, error = %e, "packet marking failed, flow continues unmarked");
                None
            }
        }
    }

    /// Dial the route over TCP, trying each candidate address in turn.
    pub async fn connect_tcp(&self, route: &Route) -> Result<TcpStream, RoutingError> {
        let mut last_err = String::from("no addresses");
        for addr in route.addrs() {
            let bind = self.bind_addr(route, *addr);
            let attempt = async {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                if let Some(local) = bind {
                    socket.bind(local)?;
                }
                socket.connect(*addr).await
            };
            match tokio::time::timeout(self.connect_timeout, attempt).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "connect timed out".into(),
            }
            debug!(addr = %addr, error = %last_err, "connect attempt failed");
        }
        Err(RoutingError::Unreachable {
            addr: route.to_string(),
            message: last_err,
        })
    }

    /// A UDP socket connected to the route's first address.
    pub async fn connect_udp(&self, route: &Route) -> Result<UdpSocket, RoutingError> {
        let unreachable = |message: String| RoutingError::Unreachable {
            addr: route.to_string(),
            message,
        };
        let addr = *route
            .addrs()
            .first()
            .ok_or_else(|| unreachable("no addresses".into()))?;

        let local = self.bind_addr(route, addr).unwrap_or_else(|| {
            if addr.is_ipv4() {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            } else {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
            }
        });
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        Ok(socket)
    }

    /// Peer dials leave from the configured overlay address when its family
    /// matches the destination.
    fn bind_addr(&self, route: &Route, dest: SocketAddr) -> Option<SocketAddr> {
        match (route, self.source_addr) {
            (Route::Peer(_), Some(src)) if src.is_ipv4() == dest.is_ipv4() => {
                Some(SocketAddr::new(src, 0))
            }
            _ => None,
        }
    }
}
