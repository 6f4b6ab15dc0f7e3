//! ztgate-core: policy model for the ztgate data-plane proxy.
//!
//! Provides the rule-distribution wire types, compiled rule sets and
//! matchers, the versioned policy store, the first-match policy engine,
//! credential types, and the embedded-credential preamble parser. Nothing
//! in this crate performs I/O.

pub mod cidr;
pub mod engine;
pub mod error;
pub mod identity;
pub mod pattern;
pub mod preamble;
pub mod rules;
pub mod store;
pub mod target;

// Re-export commonly used items at crate root.
pub use cidr::IpCidr;
pub use engine::{Decision, MatchedRule, PolicyEngine, Verdict};
pub use error::{AuthError, FetchError, FlowError, FramingError, GateError, GateResult, RoutingError};
pub use identity::{credential_fingerprint, Credential, Identity};
pub use preamble::{LinePreambleParser, Preamble, PreambleParser, MAX_PREAMBLE};
pub use rules::{RuleAction, RuleKind, RuleSet, RuleTable};
pub use store::{PolicySnapshot, PolicyStore};
pub use target::{Direction, FiveTuple, PortSpec, Target};
