use std::net::IpAddr;
use thiserror::Error;

/// Credential verification failures. All of them deny the flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("malformed credential")]
    MalformedCredential,

    #[error("expired credential")]
    ExpiredCredential,

    #[error("revoked credential")]
    RevokedCredential,

    /// The token-validation collaborator could not be reached or answered
    /// unexpectedly. Never treated as success.
    #[error("verifier unavailable: {0}")]
    VerifierUnavailable(String),
}

/// Failures while choosing or dialing the outbound path.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("address {0} is inside the overlay but not a configured peer")]
    UnknownPeer(IpAddr),

    #[error("peer table unavailable: {0}")]
    PeerTable(String),

    #[error("resolution failed for {host}: {message}")]
    Resolve { host: String, message: String },

    #[error("failed to connect to '{addr}': {message}")]
    Unreachable { addr: String, message: String },
}

/// Rule-distribution fetch failures. Recovered locally by the refresher.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rule source request failed: {0}")]
    Transport(String),

    #[error("rule source returned status {0}")]
    Status(u16),

    #[error("rule document could not be decoded: {0}")]
    Decode(String),
}

/// Problems with the embedded credential/destination preamble.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("preamble is incomplete")]
    Incomplete,

    #[error("preamble exceeds {0} bytes")]
    TooLarge(usize),

    #[error("credential marker missing")]
    MissingCredential,

    #[error("destination marker missing")]
    MissingTarget,

    #[error("duplicate marker: {0}")]
    Duplicate(&'static str),
}

/// Everything that can end a single proxied flow.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("access to {target} denied")]
    Authorization { target: String },

    #[error("routing failed: {0}")]
    Routing(#[from] RoutingError),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("too many authentication failures")]
    RateLimited,

    #[error("flow limit reached ({0})")]
    Capacity(usize),

    #[error("relay error: {0}")]
    Relay(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,
}

impl FlowError {
    /// Generic text safe to show the remote side. Carries no rule content or
    /// internal detail.
    pub fn rejection(&self) -> &'static str {
        match self {
            FlowError::Authentication(_) | FlowError::RateLimited => "unauthorized",
            FlowError::Framing(_) => "bad request",
            FlowError::Routing(_) | FlowError::Relay(_) | FlowError::Timeout => "bad gateway",
            FlowError::Authorization { .. } | FlowError::Capacity(_) => "forbidden",
        }
    }
}

/// Startup and server-level errors.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("config error: {0}")]
    Config(String),

    #[error("initial policy load failed: {0}")]
    InitialLoad(#[from] FetchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type GateResult<T> = Result<T, GateError>;
