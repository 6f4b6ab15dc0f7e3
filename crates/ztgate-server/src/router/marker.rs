//! Host packet marking for authenticated egress.
//!
//! Marking is best effort: the router logs a failure and the flow continues
//! unmarked. Rules are reference counted per source address and removed
//! when the last flow from that source ends.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, warn};

pub trait PacketMarker: Send + Sync {
    /// Tag egress from `source` for one more flow.
    fn mark(&self, source: IpAddr) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;

    /// One flow from `source` has ended.
    fn unmark(&self, source: IpAddr) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Does nothing. Used when marking is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMarker;

impl PacketMarker for NoopMarker {
    fn mark(&self, _source: IpAddr) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn unmark(&self, _source: IpAddr) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

/// Installs one `MARK` rule per source address in the mangle table, kept
/// while at least one flow from that source is open.
pub struct IptablesMarker {
    mark: u32,
    chain: String,
    /// Open flows per marked source.
    marked: Mutex<HashMap<IpAddr, usize>>,
}

impl IptablesMarker {
    pub fn new(mark: u32, chain: impl Into<String>) -> Self {
        Self {
            mark,
            chain: chain.into(),
            marked: Mutex::new(HashMap::new()),
        }
    }

    /// Rule specification after the `-C`/`-A` verb.
    fn rule_args(&self, source: IpAddr) -> Vec<String> {
        vec![
            self.chain.clone(),
            "-s".into(),
            source.to_string(),
            "-j".into(),
            "MARK".into(),
            "--set-mark".into(),
            format!("{:#x}", self.mark),
        ]
    }

    fn binary(source: IpAddr) -> &'static str {
        if source.is_ipv4() {
            "iptables"
        } else {
            "ip6tables"
        }
    }

    /// Count one more flow for `source`. `true` if it was already marked.
    fn acquire(&self, source: IpAddr) -> bool {
        let mut marked = self.marked.lock().unwrap_or_else(|e| e.into_inner());
        match marked.get_mut(&source) {
            Some(flows) => {
                *flows += 1;
                true
            }
            None => false,
        }
    }

    /// Count one flow less. `true` if that was the last one.
    fn release(&self, source: IpAddr) -> bool {
        let mut marked = self.marked.lock().unwrap_or_else(|e| e.into_inner());
        match marked.get_mut(&source) {
            Some(flows) if *flows > 1 => {
                *flows -= 1;
                false
            }
            Some(_) => {
                marked.remove(&source);
                true
            }
            None => false,
        }
    }

    async fn run(binary: &str, verb: &str, rule: &[String]) -> Result<bool, String> {
        let output = Command::new(binary)
            .args(["-t", "mangle", verb])
            .args(rule)
            .output()
            .await
            .map_err(|e| format!("{binary}: {e}"))?;
        if output.status.success() {
            return Ok(true);
        }
        if verb == "-C" {
            return Ok(false);
        }
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }

    async fn apply(&self, source: IpAddr) -> Result<(), String> {
        if self.acquire(source) {
            return Ok(());
        }
        let binary = Self::binary(source);
        let rule = self.rule_args(source);

        match Self::run(binary, "-C", &rule).await? {
            true => {}
            false => {
                Self::run(binary, "-A", &rule).await?;
            }
        }
        debug!(source = %source, mark = self.mark, "egress marked");
        *self
            .marked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(source)
            .or_insert(0) += 1;
        Ok(())
    }

    async fn remove(&self, source: IpAddr) {
        if !self.release(source) {
            return;
        }
        let rule = self.rule_args(source);
        match Self::run(Self::binary(source), "-D", &rule).await {
            Ok(_) => debug!(source = %source, "egress mark removed"),
            Err(e) => warn!(source = %source, error = %e, "removing packet mark failed"),
        }
    }
}

impl PacketMarker for IptablesMarker {
    fn mark(&self, source: IpAddr) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(self.apply(source))
    }

    fn unmark(&self, source: IpAddr) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.remove(source))
    }
}

/// Keeps the mark for one flow. Dropping it releases the mark in the
/// background.
pub struct MarkLease {
    marker: Arc<dyn PacketMarker>,
    source: IpAddr,
}

impl MarkLease {
    pub fn new(marker: Arc<dyn PacketMarker>, source: IpAddr) -> Self {
        Self { marker, source }
    }
}

impl fmt::Debug for MarkLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkLease").field("source", &self.source).finish()
    }
}

impl Drop for MarkLease {
    fn drop(&mut self) {
        let marker = self.marker.clone();
        let source = self.source;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { marker.unmark(source).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_shape() {
        let m = IptablesMarker::new(0x2a, "ZTGATE");
        let args = m.rule_args("10.200.0.5".parse().unwrap());
        assert_eq!(
            args,
            ["ZTGATE", "-s", "10.200.0.5", "-j", "MARK", "--set-mark", "0x2a"]
        );
        assert_eq!(IptablesMarker::binary("fd00::1".parse().unwrap()), "ip6tables");
    }

    #[tokio::test]
    async fn failure_is_reported_not_counted() {
        let m = IptablesMarker::new(1, "ZTGATE-TEST-NONEXISTENT");
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        if m.mark(ip).await.is_err() {
            assert!(m.marked.lock().unwrap().is_empty());
        }
    }

    #[test]
    fn flows_are_counted_per_source() {
        let m = IptablesMarker::new(1, "ZTGATE");
        let ip: IpAddr = "10.200.0.7".parse().unwrap();
        m.marked.lock().unwrap().insert(ip, 1);

        assert!(m.acquire(ip));
        assert!(!m.release(ip));
        assert!(m.release(ip));
        assert!(!m.release(ip));
        assert!(!m.acquire(ip));
    }
}
