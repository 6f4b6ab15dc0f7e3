//! Raw UDP front end.
//!
//! Connectionless: every datagram carries its own preamble and is admitted
//! on its own. The payload goes upstream from a fresh socket and a single
//! reply, if one arrives before the deadline, is sent back to the sender.
//! Rejected datagrams are dropped without a reply.

use super::relay::MirrorTap;
use super::{flow_targets, FlowGuard, FlowRequest, Pipeline};
use crate::mirror::MirrorKind;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info};
use ztgate_core::{FlowError, PreambleParser};

const MAX_DATAGRAM: usize = 65_535;

pub struct UdpFrontend {
    socket: Arc<UdpSocket>,
    pipeline: Arc<Pipeline>,
    parser: Arc<dyn PreambleParser>,
    reply_timeout: Duration,
}

impl UdpFrontend {
    pub async fn bind(
        addr: SocketAddr,
        pipeline: Arc<Pipeline>,
        parser: Arc<dyn PreambleParser>,
        reply_timeout: Duration,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            pipeline,
            parser,
            reply_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.socket.local_addr() {
            info!(addr = %addr, "udp front end listening");
        }
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (n, peer) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            debug!(error = %e, "udp receive error");
                            continue;
                        }
                    };
                    let guard = match self.pipeline.tracker().try_acquire() {
                        Ok(guard) => guard,
                        Err(e) => {
                            debug!(source = %peer, error = %e, "udp datagram dropped");
                            continue;
                        }
                    };
                    let datagram = buf[..n].to_vec();
                    let socket = self.socket.clone();
                    let pipeline = self.pipeline.clone();
                    let parser = self.parser.clone();
                    let timeout = self.reply_timeout;
                    let closed = guard.closed();
                    tokio::spawn(async move {
                        tokio::select! {
                            result = handle_datagram(socket, datagram, peer, pipeline, parser, timeout, guard) => {
                                if let Err(e) = result {
                                    debug!(source = %peer, error = %e, rejection = e.rejection(), "udp flow ended");
                                }
                            }
                            _ = closed => debug!(source = %peer, "udp flow closed at shutdown"),
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("udp front end stopped");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_datagram(
    socket: Arc<UdpSocket>,
    datagram: Vec<u8>,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
    parser: Arc<dyn PreambleParser>,
    reply_timeout: Duration,
    _guard: FlowGuard,
) -> Result<(), FlowError> {
    // A datagram is all there is; an incomplete preamble is final.
    let preamble = parser.parse(&datagram)?;

    let admission = pipeline
        .admit(FlowRequest {
            source: peer,
            credential: &preamble.credential,
            policy_targets: flow_targets("udp", peer, &preamble.target),
            route_target: &preamble.target,
            default_port: None,
        })
        .await?;

    let upstream = pipeline.router().connect_udp(&admission.route).await?;
    let tap = pipeline.mirror().map(|sink| {
        MirrorTap::new(sink.clone(), MirrorKind::Udp, peer.to_string(), preamble.target.clone())
    });

    let payload = &datagram[preamble.payload_offset..];
    upstream.send(payload).await?;
    if let Some(ref tap) = tap {
        tap.record(payload);
    }
    debug!(identity = %admission.identity, source = %peer, route = %admission.route, "udp datagram forwarded");

    let mut reply = vec![0u8; MAX_DATAGRAM];
    let n = tokio::time::timeout(reply_timeout, upstream.recv(&mut reply))
        .await
        .map_err(|_| FlowError::Timeout)??;
    socket.send_to(&reply[..n], peer).await?;
    if let Some(tap) = tap {
        tap.reversed().record(&reply[..n]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::tests::test_pipeline;
    use ztgate_core::LinePreambleParser;

    async fn start(reply_timeout: Duration) -> (SocketAddr, watch::Sender<bool>) {
        let frontend = UdpFrontend::bind(
            "127.0.0.1:0".parse().unwrap(),
            test_pipeline(0),
            Arc::new(LinePreambleParser),
            reply_timeout,
        )
        .await
        .unwrap();
        let addr = frontend.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(frontend.run(rx));
        (addr, tx)
    }

    async fn echo_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&buf[..n]);
                socket.send_to(&reply, from).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn datagram_round_trip() {
        let upstream = echo_upstream().await;
        let (addr, _shutdown) = start(Duration::from_secs(2)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram = format!("Authorization: Bearer good\nHost: {upstream}\n\nping");
        client.send_to(datagram.as_bytes(), addr).await.unwrap();

        let mut buf = [0u8; 128];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, addr);
        assert_eq!(&buf[..n], b"echo:ping");
    }

    #[tokio::test]
    async fn unauthenticated_datagram_gets_no_reply() {
        let upstream = echo_upstream().await;
        let (addr, _shutdown) = start(Duration::from_secs(2)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram = format!("Authorization: Bearer expired\nHost: {upstream}\n\nping");
        client.send_to(datagram.as_bytes(), addr).await.unwrap();

        let mut buf = [0u8; 128];
        let got = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = silent.local_addr().unwrap();
        let (addr, _shutdown) = start(Duration::from_millis(100)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram = format!("Authorization: Bearer good\nHost: {upstream}\n\nping");
        client.send_to(datagram.as_bytes(), addr).await.unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = silent.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        let got = tokio::time::timeout(Duration::from_millis(400), client.recv_from(&mut buf)).await;
        assert!(got.is_err());
    }
}
