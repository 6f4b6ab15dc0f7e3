//! Bidirectional byte relay between an admitted client and its upstream.
//!
//! Each direction is its own task. A clean EOF is passed on as a write
//! shutdown and the other direction keeps running for a bounded linger; an
//! I/O error in either direction aborts both and releases the sockets.

use crate::mirror::{MirrorKind, MirrorSink};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const RELAY_BUF: usize = 16 * 1024;

/// Copies relayed chunks to the mirror sink for one direction of a flow.
#[derive(Clone)]
pub struct MirrorTap {
    sink: Arc<dyn MirrorSink>,
    kind: MirrorKind,
    source: String,
    destination: String,
}

impl MirrorTap {
    pub fn new(sink: Arc<dyn MirrorSink>, kind: MirrorKind, source: String, destination: String) -> Self {
        Self {
            sink,
            kind,
            source,
            destination,
        }
    }

    /// The same flow seen from the other side.
    pub fn reversed(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            kind: self.kind,
            source: self.destination.clone(),
            destination: self.source.clone(),
        }
    }

    pub fn record(&self, payload: &[u8]) {
        if !payload.is_empty() {
            self.sink.mirror(self.kind, &self.source, &self.destination, payload);
        }
    }
}

/// Bytes moved in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub upstream_bytes: u64,
    pub downstream_bytes: u64,
}

/// Copy `reader` into `writer` until EOF, then shut the writer down.
async fn pump<R, W>(mut reader: R, mut writer: W, tap: Option<MirrorTap>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        if let Some(ref tap) = tap {
            tap.record(&buf[..n]);
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

/// The two pump tasks of one relay. Dropping the relay aborts both, so a
/// flow that is cancelled from outside releases its sockets.
struct Pumps {
    up: JoinHandle<io::Result<u64>>,
    down: JoinHandle<io::Result<u64>>,
}

impl Drop for Pumps {
    fn drop(&mut self) {
        self.up.abort();
        self.down.abort();
    }
}

/// Relay `client` ⇄ `upstream` until both directions finish or one fails.
/// `tap` describes the client → upstream direction.
///
/// Once one direction has finished cleanly, the other gets at most
/// `linger` before the flow is torn down.
pub async fn relay_tcp(
    client: TcpStream,
    upstream: TcpStream,
    tap: Option<MirrorTap>,
    linger: Duration,
) -> RelayStats {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let reverse_tap = tap.as_ref().map(MirrorTap::reversed);
    let mut pumps = Pumps {
        up: tokio::spawn(pump(client_read, upstream_write, tap)),
        down: tokio::spawn(pump(upstream_read, client_write, reverse_tap)),
    };

    let mut stats = RelayStats::default();
    let mut up_done = false;
    let mut down_done = false;
    let mut linger_until: Option<Instant> = None;

    while !(up_done && down_done) {
        let deadline = linger_until.unwrap_or_else(Instant::now);
        tokio::select! {
            result = &mut pumps.up, if !up_done => {
                up_done = true;
                match result {
                    Ok(Ok(n)) => stats.upstream_bytes = n,
                    Ok(Err(e)) => {
                        debug!(error = %e, "client->upstream relay ended");
                        break;
                    }
                    Err(_) => break,
                }
            }
            result = &mut pumps.down, if !down_done => {
                down_done = true;
                match result {
                    Ok(Ok(n)) => stats.downstream_bytes = n,
                    Ok(Err(e)) => {
                        debug!(error = %e, "upstream->client relay ended");
                        break;
                    }
                    Err(_) => break,
                }
            }
            _ = tokio::time::sleep_until(deadline), if linger_until.is_some() => {
                debug!(linger_secs = linger.as_secs(), "half-closed relay lingered too long");
                break;
            }
        }
        if linger_until.is_none() && (up_done || down_done) {
            linger_until = Some(Instant::now() + linger);
        }
    }

    stats
}
