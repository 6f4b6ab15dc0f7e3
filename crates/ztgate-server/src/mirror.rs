//! Traffic mirroring to an external inspection collector.
//!
//! Relays hand copies of relayed bytes to a [`MirrorSink`]. The call is
//! fire-and-forget: [`ChannelMirror`] only ever `try_send`s into a bounded
//! queue and drops records when it is full. A background
//! [`UdpMirrorExporter`] drains the queue and ships each record as one JSON
//! datagram.

use serde::Serialize;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    Http,
    Tcp,
    Udp,
}

/// One mirrored chunk as sent to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorRecord {
    pub kind: MirrorKind,
    pub source: String,
    pub destination: String,
    /// Hex-encoded bytes, cut to the configured maximum.
    pub payload: String,
    pub truncated: bool,
}

pub trait MirrorSink: Send + Sync {
    /// Must not block and must not fail the caller.
    fn mirror(&self, kind: MirrorKind, source: &str, destination: &str, payload: &[u8]);
}

/// Bounded, non-blocking queue in front of the exporter.
pub struct ChannelMirror {
    tx: mpsc::Sender<MirrorRecord>,
    max_payload: usize,
    dropped: AtomicU64,
}

impl ChannelMirror {
    pub fn new(queue_size: usize, max_payload: usize) -> (Self, mpsc::Receiver<MirrorRecord>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (
            Self {
                tx,
                max_payload,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Records discarded because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MirrorSink for ChannelMirror {
    fn mirror(&self, kind: MirrorKind, source: &str, destination: &str, payload: &[u8]) {
        let truncated = payload.len() > self.max_payload;
        let kept = &payload[..payload.len().min(self.max_payload)];
        let record = MirrorRecord {
            kind,
            source: source.to_string(),
            destination: destination.to_string(),
            payload: hex::encode(kept),
            truncated,
        };
        if self.tx.try_send(record).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(dropped, "mirror queue full, record dropped");
        }
    }
}

/// Sends queued records to the collector over UDP.
pub struct UdpMirrorExporter {
    socket: UdpSocket,
    collector: SocketAddr,
}

impl UdpMirrorExporter {
    /// Resolve `collector` (`host:port`) and open a socket toward it.
    pub async fn connect(collector: &str) -> io::Result<Self> {
        let collector = tokio::net::lookup_host(collector)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "collector did not resolve"))?;
        let local = if collector.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(collector).await?;
        Ok(Self { socket, collector })
    }

    pub fn collector(&self) -> SocketAddr {
        self.collector
    }

    /// Drain `rx` until it closes or `shutdown` flips.
    pub async fn run(self, mut rx: mpsc::Receiver<MirrorRecord>, mut shutdown: watch::Receiver<bool>) {
        info!(collector = %self.collector, "mirror exporter started");
        loop {
            tokio::select! {
                record = rx.recv() => {
                    let Some(record) = record else { break };
                    match serde_json::to_vec(&record) {
                        Ok(datagram) => {
                            if let Err(e) = self.socket.send(&datagram).await {
                                warn!(collector = %self.collector, error = %e, "mirror send failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "mirror record encode failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("mirror exporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn truncates_and_hex_encodes() {
        let (sink, mut rx) = ChannelMirror::new(4, 3);
        sink.mirror(MirrorKind::Tcp, "10.200.0.2:5000", "db:5432", b"\x01\x02\x03\x04");
        let record = rx.try_recv().unwrap();
        assert_eq!(record.payload, "010203");
        assert!(record.truncated);
        assert_eq!(record.destination, "db:5432");
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (sink, _rx) = ChannelMirror::new(1, 64);
        sink.mirror(MirrorKind::Udp, "a", "b", b"1");
        sink.mirror(MirrorKind::Udp, "a", "b", b"2");
        sink.mirror(MirrorKind::Udp, "a", "b", b"3");
        assert_eq!(sink.dropped(), 2);
    }

    #[tokio::test]
    async fn exporter_sends_json_datagrams() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let exporter = UdpMirrorExporter::connect(&collector.local_addr().unwrap().to_string())
            .await
            .unwrap();

        let (sink, rx) = ChannelMirror::new(8, 64);
        let (_tx, shutdown) = watch::channel(false);
        tokio::spawn(exporter.run(rx, shutdown));

        sink.mirror(MirrorKind::Http, "10.200.0.9:40000", "api.internal:80", b"GET /");

        let mut buf = vec![0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(2), collector.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(value["kind"], "http");
        assert_eq!(value["payload"], hex::encode("GET /"));
        assert_eq!(value["truncated"], false);
    }
}
