//! Authentication: credential verification and failure rate limiting.

pub mod rate_limit;
pub mod verifier;

pub use rate_limit::AuthFailureLimiter;
pub use verifier::{HttpTokenValidator, IdentityVerifier, TokenValidator};
