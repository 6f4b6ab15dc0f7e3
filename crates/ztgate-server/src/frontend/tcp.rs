//! Raw TCP front end.
//!
//! Reads the preamble off the start of the stream, admits the flow, dials
//! upstream, replays any payload bytes read along with the preamble, then
//! relays. A rejected connection is closed without a reply.

use super::relay::{relay_tcp, MirrorTap};
use super::{flow_targets, FlowGuard, FlowRequest, Pipeline};
use crate::mirror::MirrorKind;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use ztgate_core::{FlowError, FramingError, Preamble, PreambleParser, MAX_PREAMBLE};

const READ_CHUNK: usize = 4096;

pub struct TcpFrontend {
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    parser: Arc<dyn PreambleParser>,
    preamble_timeout: Duration,
    relay_linger: Duration,
}

impl TcpFrontend {
    pub async fn bind(
        addr: SocketAddr,
        pipeline: Arc<Pipeline>,
        parser: Arc<dyn PreambleParser>,
        preamble_timeout: Duration,
        relay_linger: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            pipeline,
            parser,
            preamble_timeout,
            relay_linger,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` flips. In-flight flows keep running until
    /// they finish or the tracker closes them.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "tcp front end listening");
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            debug!(error = %e, "tcp accept error");
                            continue;
                        }
                    };
                    let guard = match self.pipeline.tracker().try_acquire() {
                        Ok(guard) => guard,
                        Err(e) => {
                            warn!(source = %peer, error = %e, "tcp flow refused");
                            continue;
                        }
                    };
                    let pipeline = self.pipeline.clone();
                    let parser = self.parser.clone();
                    let (timeout, linger) = (self.preamble_timeout, self.relay_linger);
                    let closed = guard.closed();
                    tokio::spawn(async move {
                        tokio::select! {
                            result = handle_connection(stream, peer, pipeline, parser, timeout, linger, guard) => {
                                if let Err(e) = result {
                                    debug!(source = %peer, error = %e, rejection = e.rejection(), "tcp flow ended");
                                }
                            }
                            _ = closed => debug!(source = %peer, "tcp flow closed at shutdown"),
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("tcp front end stopped accepting");
                        break;
                    }
                }
            }
        }
    }
}

/// Read until the parser has both markers. Returns the preamble and every
/// byte read so far.
async fn read_preamble(
    stream: &mut TcpStream,
    parser: &dyn PreambleParser,
) -> Result<(Preamble, Vec<u8>), FlowError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(FramingError::Incomplete.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        match parser.parse(&buf) {
            Ok(preamble) => return Ok((preamble, buf)),
            Err(FramingError::Incomplete) if buf.len() < MAX_PREAMBLE => continue,
            Err(FramingError::Incomplete) => return Err(FramingError::TooLarge(MAX_PREAMBLE).into()),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
    parser: Arc<dyn PreambleParser>,
    preamble_timeout: Duration,
    relay_linger: Duration,
    _guard: FlowGuard,
) -> Result<(), FlowError> {
    let (preamble, buf) = tokio::time::timeout(preamble_timeout, read_preamble(&mut stream, parser.as_ref()))
        .await
        .map_err(|_| FlowError::Timeout)??;

    let admission = pipeline
        .admit(FlowRequest {
            source: peer,
            credential: &preamble.credential,
            policy_targets: flow_targets("tcp", peer, &preamble.target),
            route_target: &preamble.target,
            default_port: None,
        })
        .await?;

    let mut upstream = pipeline.router().connect_tcp(&admission.route).await?;
    let tap = pipeline.mirror().map(|sink| {
        MirrorTap::new(sink.clone(), MirrorKind::Tcp, peer.to_string(), preamble.target.clone())
    });

    let payload = &buf[preamble.payload_offset..];
    if !payload.is_empty() {
        upstream.write_all(payload).await?;
        if let Some(ref tap) = tap {
            tap.record(payload);
        }
    }

    info!(
        identity = %admission.identity,
        source = %peer,
        target = %preamble.target,
        route = %admission.route,
        "tcp flow established"
    );
    let stats = relay_tcp(stream, upstream, tap, relay_linger).await;
    debug!(
        source = %peer,
        upstream_bytes = stats.upstream_bytes + payload.len() as u64,
        downstream_bytes = stats.downstream_bytes,
        "tcp flow closed"
    );
    Ok(())
}
