//! Protocol front ends and the pipeline they share.
//!
//! Every flow goes through [`Pipeline::admit`] before a single byte is
//! written upstream: rate-limit check, credential verification, policy
//! decision, then routing. A flow allowed by hostname is checked once more
//! against the addresses the name resolved to, and any of them hitting a
//! deny rule refuses the flow. Only an admitted flow is dialed and relayed.
//! The front ends differ only in how they find the credential and target:
//!
//! - **[`http`]**: headers on a plain HTTP/1.1 request, reverse-proxied.
//! - **[`tcp`]**: a text preamble at the start of the stream.
//! - **[`udp`]**: a text preamble on every datagram.

pub mod http;
pub mod relay;
pub mod tcp;
pub mod udp;

use crate::auth::{AuthFailureLimiter, IdentityVerifier};
use crate::mirror::MirrorSink;
use crate::router::{DestinationRouter, MarkLease, Route};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use ztgate_core::target::split_host_port;
use ztgate_core::{AuthError, Credential, FlowError, Identity, PolicyEngine};

/// What a front end knows about a flow before admission.
#[derive(Debug, Clone)]
pub struct FlowRequest<'a> {
    pub source: SocketAddr,
    pub credential: &'a Credential,
    /// Target forms handed to the policy engine, evaluated together.
    pub policy_targets: Vec<String>,
    /// `host[:port]` to route.
    pub route_target: &'a str,
    pub default_port: Option<u16>,
}

/// An authenticated, authorized and routed flow. Hold it for the life of
/// the flow: dropping it releases the egress mark.
#[derive(Debug)]
pub struct Admission {
    pub identity: Identity,
    pub route: Route,
    pub mark: Option<MarkLease>,
}

/// Shared authenticate → authorize → route sequence.
pub struct Pipeline {
    verifier: IdentityVerifier,
    engine: PolicyEngine,
    router: Arc<DestinationRouter>,
    limiter: Arc<AuthFailureLimiter>,
    mirror: Option<Arc<dyn MirrorSink>>,
    tracker: FlowTracker,
}

impl Pipeline {
    pub fn new(
        verifier: IdentityVerifier,
        engine: PolicyEngine,
        router: Arc<DestinationRouter>,
        limiter: Arc<AuthFailureLimiter>,
        mirror: Option<Arc<dyn MirrorSink>>,
        tracker: FlowTracker,
    ) -> Self {
        Self {
            verifier,
            engine,
            router,
            limiter,
            mirror,
            tracker,
        }
    }

    pub fn router(&self) -> &Arc<DestinationRouter> {
        &self.router
    }

    pub fn mirror(&self) -> Option<&Arc<dyn MirrorSink>> {
        self.mirror.as_ref()
    }

    pub fn tracker(&self) -> &FlowTracker {
        &self.tracker
    }

    pub async fn admit(&self, req: FlowRequest<'_>) -> Result<Admission, FlowError> {
        let source_ip = req.source.ip();

        if !self.limiter.is_allowed(source_ip) {
            warn!(source = %req.source, "too many authentication failures, flow refused");
            return Err(FlowError::RateLimited);
        }

        let identity = match self.verifier.verify(req.credential).await {
            Ok(identity) => {
                self.limiter.record_success(source_ip);
                identity
            }
            Err(e) => {
                // An unreachable verifier says nothing about the client.
                if !matches!(e, AuthError::VerifierUnavailable(_)) {
                    self.limiter.record_failure(source_ip);
                }
                info!(
                    source = %req.source,
                    credential = %req.credential.fingerprint(),
                    error = %e,
                    "authentication failed"
                );
                return Err(e.into());
            }
        };

        let targets: Vec<&str> = req.policy_targets.iter().map(String::as_str).collect();
        let decision = self.engine.evaluate_flow(identity.id(), &targets);
        if !decision.allowed {
            warn!(
                identity = %identity,
                source = %req.source,
                target = %req.route_target,
                rule = %decision.verdict,
                policy_version = decision.policy_version,
                "access denied"
            );
            return Err(FlowError::Authorization {
                target: req.route_target.to_string(),
            });
        }
        debug!(
            identity = %identity,
            target = %req.route_target,
            rule = %decision.verdict,
            "access allowed"
        );

        let route = match self.router.route(req.route_target, req.default_port).await {
            Ok(route) => route,
            Err(e) => {
                warn!(identity = %identity, target = %req.route_target, error = %e, "routing failed");
                return Err(e.into());
            }
        };

        // A hostname decision also has to hold for what the name resolved to.
        let by_name = split_host_port(req.route_target)
            .map(|(host, _)| host.parse::<IpAddr>().is_err())
            .unwrap_or(true);
        if by_name {
            let resolved: Vec<String> = route.addrs().iter().map(ToString::to_string).collect();
            let resolved: Vec<&str> = resolved.iter().map(String::as_str).collect();
            if let Some(decision) = self.engine.explicit_deny(identity.id(), &resolved) {
                warn!(
                    identity = %identity,
                    source = %req.source,
                    target = %req.route_target,
                    route = %route,
                    rule = %decision.verdict,
                    policy_version = decision.policy_version,
                    "access denied for resolved address"
                );
                return Err(FlowError::Authorization {
                    target: req.route_target.to_string(),
                });
            }
        }

        let mark = self.router.mark(source_ip).await;
        Ok(Admission { identity, route, mark })
    }
}

/// Policy targets for a raw flow: the `host:port` itself, plus the outbound
/// 5-tuple when the destination is an address literal.
pub fn flow_targets(protocol: &str, source: SocketAddr, target: &str) -> Vec<String> {
    let mut targets = vec![target.to_string()];
    if let Ok((host, Some(port))) = split_host_port(target) {
        if let Ok(ip) = host.parse::<IpAddr>() {
            let dest = SocketAddr::new(ip.to_canonical(), port);
            targets.push(format!("{protocol}:{source}->{dest}:outbound"));
        }
    }
    targets
}

/// Counts live flows and enforces `max_flows` (0 means unlimited).
///
/// Also carries the close signal: once [`FlowTracker::close_all`] is called,
/// every guard's [`FlowGuard::closed`] future resolves, including guards
/// taken afterwards.
#[derive(Debug, Clone)]
pub struct FlowTracker {
    active: Arc<AtomicUsize>,
    max_flows: usize,
    closing: Arc<watch::Sender<bool>>,
}

impl FlowTracker {
    pub fn new(max_flows: usize) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_flows,
            closing: Arc::new(closing),
        }
    }

    /// Reserve a slot for one flow, released when the guard drops.
    pub fn try_acquire(&self) -> Result<FlowGuard, FlowError> {
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        if self.max_flows > 0 && previous >= self.max_flows {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(FlowError::Capacity(self.max_flows));
        }
        Ok(FlowGuard {
            counter: self.active.clone(),
            closing: self.closing.subscribe(),
        })
    }

    /// Tell every live flow to close now.
    pub fn close_all(&self) {
        self.closing.send_replace(true);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait up to `grace` for every flow to finish. `true` if they did.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait = async {
            while self.active() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }
}

/// RAII slot from [`FlowTracker::try_acquire`]. Owns an `Arc` so it can be
/// moved into spawned tasks.
#[derive(Debug)]
pub struct FlowGuard {
    counter: Arc<AtomicUsize>,
    closing: watch::Receiver<bool>,
}

impl FlowGuard {
    /// Resolves once the tracker closes all flows. Front ends race their
    /// flow task against it; dropping the flow closes its sockets.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut closing = self.closing.clone();
        async move {
            if closing.wait_for(|closing| *closing).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
