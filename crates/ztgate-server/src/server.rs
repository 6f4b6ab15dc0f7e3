//! Server assembly and lifecycle.
//!
//! Builds the policy store, refresher, verifier, router and pipeline from a
//! [`ServerConfig`], blocks on the initial policy load, binds the enabled
//! front ends and runs them next to the refresh loop. Shutdown stops every
//! listener, gives in-flight flows the configured grace period, then closes
//! whatever remains.

use crate::auth::{AuthFailureLimiter, HttpTokenValidator, IdentityVerifier, TokenValidator};
use crate::config::ServerConfig;
use crate::frontend::http::HttpFrontend;
use crate::frontend::tcp::TcpFrontend;
use crate::frontend::udp::UdpFrontend;
use crate::frontend::{FlowTracker, Pipeline};
use crate::mirror::{ChannelMirror, MirrorRecord, MirrorSink, UdpMirrorExporter};
use crate::policy::{HttpRuleSource, PolicyRefresher, RuleSource};
use crate::router::{DestinationRouter, IptablesMarker, NoopMarker, PacketMarker, PeerTable, StaticPeerTable, WgPeerTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use ztgate_core::{GateError, GateResult, LinePreambleParser, PolicyEngine, PolicyStore, PreambleParser};

/// How often idle rate-limiter entries are collected.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// How long closed flows get to release their guards after `close_all`.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// The external collaborators a server talks to.
pub struct Collaborators {
    pub rules: Arc<dyn RuleSource>,
    pub validator: Arc<dyn TokenValidator>,
    pub peers: Arc<dyn PeerTable>,
    pub marker: Arc<dyn PacketMarker>,
}

impl Collaborators {
    /// The production set described by `config`.
    pub fn from_config(config: &ServerConfig) -> Self {
        let peers: Arc<dyn PeerTable> = if config.static_peers.is_empty() {
            Arc::new(WgPeerTable::new(config.overlay_interface.clone()))
        } else {
            Arc::new(StaticPeerTable::new(config.static_peers.clone()))
        };
        let marker: Arc<dyn PacketMarker> = if config.marking_enabled {
            Arc::new(IptablesMarker::new(config.mark, config.mark_chain.clone()))
        } else {
            Arc::new(NoopMarker)
        };
        Self {
            rules: Arc::new(HttpRuleSource::new(
                config.rules_url.clone(),
                config.rules_token.clone(),
                config.fetch_timeout,
            )),
            validator: Arc::new(HttpTokenValidator::new(
                config.validate_url.clone(),
                config.validate_token.clone(),
                config.auth_timeout,
            )),
            peers,
            marker,
        }
    }
}

/// A configured but not yet started server.
pub struct GateServer {
    config: ServerConfig,
    refresher: Arc<PolicyRefresher>,
    pipeline: Arc<Pipeline>,
    limiter: Arc<AuthFailureLimiter>,
    parser: Arc<dyn PreambleParser>,
    mirror_rx: Option<mpsc::Receiver<MirrorRecord>>,
}

impl GateServer {
    pub fn new(config: ServerConfig) -> Self {
        let collaborators = Collaborators::from_config(&config);
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: ServerConfig, c: Collaborators) -> Self {
        let store = Arc::new(PolicyStore::new());
        let refresher = Arc::new(PolicyRefresher::new(
            store.clone(),
            c.rules,
            config.refresh_min,
            config.refresh_max,
        ));

        let limiter = Arc::new(AuthFailureLimiter::new(
            config.max_auth_failures,
            config.auth_failure_window,
        ));
        let router = Arc::new(DestinationRouter::new(
            config.overlay_cidr,
            c.peers,
            c.marker,
            config.overlay_source_addr,
            config.connect_timeout,
        ));

        let (mirror, mirror_rx) = if config.mirror_enabled {
            let (sink, rx) = ChannelMirror::new(config.mirror_queue_size, config.mirror_max_payload);
            (Some(Arc::new(sink) as Arc<dyn MirrorSink>), Some(rx))
        } else {
            (None, None)
        };

        let pipeline = Arc::new(Pipeline::new(
            IdentityVerifier::new(c.validator, config.auth_timeout),
            PolicyEngine::new(store),
            router,
            limiter.clone(),
            mirror,
            FlowTracker::new(config.max_flows),
        ));

        Self {
            config,
            refresher,
            pipeline,
            limiter,
            parser: Arc::new(LinePreambleParser),
            mirror_rx,
        }
    }

    /// Load policy, bind listeners and spawn every task.
    pub async fn start(mut self) -> GateResult<RunningGate> {
        let version = self
            .refresher
            .initial_load(self.config.initial_fetch_attempts)
            .await?;
        info!(
            version,
            identities = self.refresher.store().identity_count(),
            "initial policy loaded"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut listeners = Vec::new();
        let mut http_addr = None;
        let mut tcp_addr = None;
        let mut udp_addr = None;

        if let Some(addr) = self.config.http_addr {
            let frontend = HttpFrontend::bind(
                addr,
                self.pipeline.clone(),
                self.config.idle_pool_timeout,
                self.config.connect_timeout,
            )
            .await
            .map_err(|e| GateError::Other(format!("http bind {addr}: {e}")))?;
            http_addr = Some(frontend.local_addr()?);
            listeners.push(tokio::spawn(frontend.run(shutdown_rx.clone())));
        }

        if let Some(addr) = self.config.tcp_addr {
            let frontend = TcpFrontend::bind(
                addr,
                self.pipeline.clone(),
                self.parser.clone(),
                self.config.preamble_timeout,
                self.config.relay_linger,
            )
            .await
            .map_err(|e| GateError::Other(format!("tcp bind {addr}: {e}")))?;
            tcp_addr = Some(frontend.local_addr()?);
            listeners.push(tokio::spawn(frontend.run(shutdown_rx.clone())));
        }

        if let Some(addr) = self.config.udp_addr {
            let frontend = UdpFrontend::bind(
                addr,
                self.pipeline.clone(),
                self.parser.clone(),
                self.config.udp_reply_timeout,
            )
            .await
            .map_err(|e| GateError::Other(format!("udp bind {addr}: {e}")))?;
            udp_addr = Some(frontend.local_addr()?);
            listeners.push(tokio::spawn(frontend.run(shutdown_rx.clone())));
        }

        if listeners.is_empty() {
            return Err(GateError::Config("every front end is disabled".into()));
        }

        let mut background = vec![tokio::spawn(self.refresher.clone().run(shutdown_rx.clone()))];

        if let (Some(rx), Some(collector)) = (self.mirror_rx.take(), self.config.mirror_collector.as_deref()) {
            match UdpMirrorExporter::connect(collector).await {
                Ok(exporter) => {
                    info!(collector = %exporter.collector(), "mirroring enabled");
                    background.push(tokio::spawn(exporter.run(rx, shutdown_rx.clone())));
                }
                Err(e) => warn!(collector = %collector, error = %e, "mirror exporter unavailable, mirroring disabled"),
            }
        }

        let limiter = self.limiter.clone();
        let mut gc_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => limiter.gc(),
                    _ = gc_shutdown.changed() => break,
                }
            }
        }));

        info!(
            http = ?http_addr,
            tcp = ?tcp_addr,
            udp = ?udp_addr,
            overlay = %self.pipeline.router().overlay(),
            mirror = self.config.mirror_enabled,
            "ztgate ready"
        );

        Ok(RunningGate {
            shutdown_tx,
            listeners,
            background,
            tracker: self.pipeline.tracker().clone(),
            store: self.refresher.store().clone(),
            grace: self.config.shutdown_grace,
            http_addr,
            tcp_addr,
            udp_addr,
        })
    }
}

/// Handle on a started server.
pub struct RunningGate {
    shutdown_tx: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    tracker: FlowTracker,
    store: Arc<PolicyStore>,
    grace: Duration,
    pub http_addr: Option<SocketAddr>,
    pub tcp_addr: Option<SocketAddr>,
    pub udp_addr: Option<SocketAddr>,
}

impl RunningGate {
    pub fn active_flows(&self) -> usize {
        self.tracker.active()
    }

    /// Stop accepting, wait out the grace period, then abort what is left
    /// and drop the policy snapshot.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.listeners {
            let _ = handle.await;
        }

        let active = self.tracker.active();
        if active > 0 {
            info!(active, grace_secs = self.grace.as_secs(), "waiting for in-flight flows");
            if !self.tracker.drain(self.grace).await {
                warn!(remaining = self.tracker.active(), "grace period over, closing remaining flows");
            }
        }
        self.tracker.close_all();
        if !self.tracker.drain(FORCE_CLOSE_WAIT).await {
            warn!(remaining = self.tracker.active(), "flows still open after close");
        }

        for handle in self.background {
            handle.abort();
        }
        self.store.clear();
        info!("ztgate stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::verifier::tests::FakeValidator;
    use crate::config::{CliOverrides, ConfigFile};
    use std::future::Future;
    use std::pin::Pin;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use ztgate_core::{FetchError, RuleTable};

    struct FixedRules(&'static str);

    impl RuleSource for FixedRules {
        fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<RuleTable, FetchError>> + Send + '_>> {
            let parsed = serde_json::from_str(self.0).map_err(|e| FetchError::Decode(e.to_string()));
            Box::pin(async move { parsed })
        }
    }

    struct DownRules;

    impl RuleSource for DownRules {
        fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<RuleTable, FetchError>> + Send + '_>> {
            Box::pin(async { Err(FetchError::Status(503)) })
        }
    }

    fn config() -> ServerConfig {
        let file: ConfigFile = toml::from_str(
            r#"
            [listen]
            bind_addr = "127.0.0.1"
            http_port = 0
            tcp_port = 0
            udp_port = 0
            [policy]
            rules_url = "http://rules.invalid/rules"
            initial_fetch_attempts = 1
            [auth]
            validate_url = "http://auth.invalid/validate"
            [limits]
            shutdown_grace_secs = 1
            "#,
        )
        .unwrap();
        ServerConfig::resolve(file, CliOverrides::default()).unwrap()
    }

    fn collaborators(rules: Arc<dyn RuleSource>) -> Collaborators {
        Collaborators {
            rules,
            validator: Arc::new(FakeValidator::with(&[("good", Ok("u1"))])),
            peers: Arc::new(StaticPeerTable::default()),
            marker: Arc::new(NoopMarker),
        }
    }

    const RULES: &str =
        r#"{"rules": {"u1": {"cidrs": [{"pattern": "127.0.0.0/8", "priority": 1, "action": "allow"}]}}}"#;

    #[tokio::test]
    async fn startup_fails_without_policy() {
        let server = GateServer::with_collaborators(config(), collaborators(Arc::new(DownRules)));
        assert!(matches!(server.start().await, Err(GateError::InitialLoad(_))));
    }

    #[tokio::test]
    async fn serves_tcp_then_shuts_down() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            s.write_all(b"banner").await.unwrap();
        });

        let server = GateServer::with_collaborators(config(), collaborators(Arc::new(FixedRules(RULES))));
        let running = server.start().await.unwrap();
        assert!(running.http_addr.is_some() && running.udp_addr.is_some());

        let mut client = TcpStream::connect(running.tcp_addr.unwrap()).await.unwrap();
        client
            .write_all(format!("Authorization: Bearer good\nHost: {up_addr}\n\n").as_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"banner");
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), running.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_severs_flows_past_grace() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            let (mut r, mut w) = s.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let server = GateServer::with_collaborators(config(), collaborators(Arc::new(FixedRules(RULES))));
        let running = server.start().await.unwrap();

        let mut client = TcpStream::connect(running.tcp_addr.unwrap()).await.unwrap();
        client
            .write_all(format!("Authorization: Bearer good\nHost: {up_addr}\n\nping").as_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(running.active_flows(), 1);

        tokio::time::timeout(Duration::from_secs(6), running.shutdown())
            .await
            .unwrap();

        // The flow is gone: writes go nowhere and the read side is closed.
        let _ = client.write_all(b"late").await;
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
