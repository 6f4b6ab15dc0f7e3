//! HTTP reverse-proxy front end.
//!
//! Each request names its upstream in `X-Target-Host` and carries its
//! credential in `Authorization: Bearer` or `X-Peer-Certificate`. Both are
//! stripped before forwarding. The policy target is the request rebuilt as
//! `http://<target><path?query>`. Upstream clients are cached per distinct
//! upstream and dial the address the router resolved, not a fresh lookup.

use super::{FlowRequest, Pipeline};
use crate::mirror::MirrorKind;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use ztgate_core::{Credential, FlowError, FramingError};

pub const TARGET_HEADER: &str = "x-target-host";
pub const PEER_CERT_HEADER: &str = "x-peer-certificate";

const DEFAULT_HTTP_PORT: u16 = 80;

/// Headers that only describe the inbound hop.
const HOP_HEADERS: [&str; 4] = ["connection", "keep-alive", "proxy-connection", "upgrade"];

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A pooled client for one upstream.
pub struct UpstreamProxy {
    client: Client<HttpConnector, Incoming>,
}

impl UpstreamProxy {
    fn new(local: Option<IpAddr>, idle_timeout: Duration, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_local_address(local);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(idle_timeout)
            .pool_timer(TokioTimer::new())
            .build(connector);
        Self { client }
    }

    async fn forward(&self, req: Request<Incoming>) -> Result<Response<Incoming>, String> {
        self.client.request(req).await.map_err(|e| e.to_string())
    }
}

/// Upper bound on cached upstream clients.
const MAX_UPSTREAM_CLIENTS: usize = 1024;

struct CachedProxy {
    proxy: Arc<UpstreamProxy>,
    /// Milliseconds since the cache was created.
    last_used: AtomicU64,
}

/// Lazily-built upstream clients keyed by upstream.
///
/// Lookups take the read lock. Creation takes the write lock and checks
/// again, so concurrent first requests to one upstream build one client.
/// Creation also drops clients idle past the pool timeout and, when the
/// cache is still full, the least recently used one.
pub struct ProxyCache {
    proxies: RwLock<HashMap<String, CachedProxy>>,
    idle_timeout: Duration,
    connect_timeout: Duration,
    max_entries: usize,
    epoch: Instant,
}

impl ProxyCache {
    pub fn new(idle_timeout: Duration, connect_timeout: Duration, max_entries: usize) -> Self {
        Self {
            proxies: RwLock::new(HashMap::new()),
            idle_timeout,
            connect_timeout,
            max_entries: max_entries.max(1),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn get_or_create(&self, upstream: &str, local: Option<IpAddr>) -> Arc<UpstreamProxy> {
        let key = match local {
            Some(ip) => format!("{upstream}@{ip}"),
            None => upstream.to_string(),
        };
        let now = self.now_ms();

        if let Some(entry) = self
            .proxies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            entry.last_used.store(now, Ordering::Relaxed);
            return entry.proxy.clone();
        }

        let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = proxies.get(&key) {
            entry.last_used.store(now, Ordering::Relaxed);
            return entry.proxy.clone();
        }

        let idle_ms = self.idle_timeout.as_millis() as u64;
        proxies.retain(|_, entry| now.saturating_sub(entry.last_used.load(Ordering::Relaxed)) < idle_ms);
        if proxies.len() >= self.max_entries {
            let oldest = proxies
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!(upstream = %oldest, "evicting upstream proxy");
                proxies.remove(&oldest);
            }
        }

        debug!(upstream = %upstream, cached = proxies.len(), "creating upstream proxy");
        let proxy = Arc::new(UpstreamProxy::new(local, self.idle_timeout, self.connect_timeout));
        proxies.insert(
            key,
            CachedProxy {
                proxy: proxy.clone(),
                last_used: AtomicU64::new(now),
            },
        );
        proxy
    }

    pub fn len(&self) -> usize {
        self.proxies.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn contains(&self, upstream: &str) -> bool {
        self.proxies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(upstream)
    }
}

struct HttpState {
    pipeline: Arc<Pipeline>,
    cache: ProxyCache,
}

pub struct HttpFrontend {
    listener: TcpListener,
    state: Arc<HttpState>,
}

impl HttpFrontend {
    pub async fn bind(
        addr: SocketAddr,
        pipeline: Arc<Pipeline>,
        idle_pool_timeout: Duration,
        connect_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(HttpState {
                pipeline,
                cache: ProxyCache::new(idle_pool_timeout, connect_timeout, MAX_UPSTREAM_CLIENTS),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "http front end listening");
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            debug!(error = %e, "http accept error");
                            continue;
                        }
                    };
                    let guard = match self.state.pipeline.tracker().try_acquire() {
                        Ok(guard) => guard,
                        Err(e) => {
                            warn!(source = %peer, error = %e, "http connection refused");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    let closed = guard.closed();
                    tokio::spawn(async move {
                        let _guard = guard;
                        let service = service_fn(move |req: Request<Incoming>| {
                            let state = state.clone();
                            async move { Ok::<_, Infallible>(state.handle(req, peer).await) }
                        });
                        let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                        tokio::select! {
                            result = connection => {
                                if let Err(e) = result {
                                    debug!(source = %peer, error = %e, "http connection ended");
                                }
                            }
                            _ = closed => debug!(source = %peer, "http connection closed at shutdown"),
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("http front end stopped accepting");
                        break;
                    }
                }
            }
        }
    }
}

impl HttpState {
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let mut response = match self.proxy(req, peer).await {
            Ok(response) => response,
            Err(e) => {
                debug!(source = %peer, error = %e, "http request rejected");
                rejection(status_for(&e), e.rejection())
            }
        };
        harden(response.headers_mut());
        response
    }

    async fn proxy(&self, req: Request<Incoming>, peer: SocketAddr) -> Result<Response<ProxyBody>, FlowError> {
        let target = header_str(req.headers(), TARGET_HEADER)
            .map(str::to_ascii_lowercase)
            .ok_or(FlowError::Framing(FramingError::MissingTarget))?;
        let credential =
            credential_from(req.headers()).ok_or(FlowError::Framing(FramingError::MissingCredential))?;

        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let policy_target = format!("http://{target}{path}");

        let pipeline = &self.pipeline;
        let admission = pipeline
            .admit(FlowRequest {
                source: peer,
                credential: &credential,
                policy_targets: vec![policy_target],
                route_target: &target,
                default_port: Some(DEFAULT_HTTP_PORT),
            })
            .await?;

        let upstream_addr = *admission.route.addrs().first().ok_or_else(|| {
            FlowError::Routing(ztgate_core::RoutingError::Unreachable {
                addr: target.clone(),
                message: "no addresses".into(),
            })
        })?;
        let local = if admission.route.is_peer() {
            pipeline.router().peer_source()
        } else {
            None
        };

        let method = req.method().clone();
        let (mut parts, body) = req.into_parts();
        parts.uri = format!("http://{upstream_addr}{path}")
            .parse::<Uri>()
            .map_err(|e| FlowError::Routing(ztgate_core::RoutingError::InvalidTarget(e.to_string())))?;
        strip_inbound_headers(&mut parts.headers);
        if let Ok(host) = HeaderValue::from_str(&target) {
            parts.headers.insert(header::HOST, host);
        }
        if let Ok(ip) = HeaderValue::from_str(&peer.ip().to_string()) {
            parts.headers.append(HeaderName::from_static("x-forwarded-for"), ip);
        }

        let proxy = self.cache.get_or_create(&target, local);
        let response = proxy
            .forward(Request::from_parts(parts, body))
            .await
            .map_err(|message| {
                FlowError::Routing(ztgate_core::RoutingError::Unreachable {
                    addr: target.clone(),
                    message,
                })
            })?;

        info!(
            identity = %admission.identity,
            source = %peer,
            target = %target,
            method = %method,
            status = response.status().as_u16(),
            "http request proxied"
        );
        if let Some(sink) = pipeline.mirror() {
            let head = format!("{method} {path} HTTP/1.1\r\nHost: {target}\r\n\r\n");
            sink.mirror(MirrorKind::Http, &peer.to_string(), &target, head.as_bytes());
        }

        Ok(response.map(|body| body.boxed()))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn credential_from(headers: &HeaderMap) -> Option<Credential> {
    let bearer = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.split_once(char::is_whitespace))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| Credential::Bearer(token.trim().to_string()));
    bearer.or_else(|| {
        header_str(headers, PEER_CERT_HEADER).map(|fp| Credential::PeerCertificate(fp.to_string()))
    })
}

fn strip_inbound_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove(TARGET_HEADER);
    headers.remove(PEER_CERT_HEADER);
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn status_for(err: &FlowError) -> StatusCode {
    match err {
        FlowError::Framing(FramingError::MissingCredential) => StatusCode::UNAUTHORIZED,
        FlowError::Framing(_) => StatusCode::BAD_REQUEST,
        FlowError::Authentication(_) | FlowError::RateLimited => StatusCode::UNAUTHORIZED,
        FlowError::Authorization { .. } | FlowError::Capacity(_) => StatusCode::FORBIDDEN,
        FlowError::Routing(_) | FlowError::Relay(_) => StatusCode::BAD_GATEWAY,
        FlowError::Timeout => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn full_body(content: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(content.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

fn rejection(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn harden(headers: &mut HeaderMap) {
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
}
