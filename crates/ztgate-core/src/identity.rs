//! Principals and the credentials that resolve to them.
//!
//! An [`Identity`] only lives as long as the flow that verified it; nothing
//! here caches identities across connections.

use sha2::{Digest, Sha256};
use std::fmt;

/// A resolved principal. The id is opaque to the proxy and is the key into
/// the policy store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    id: String,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A credential presented on a flow.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Application-layer bearer token.
    Bearer(String),
    /// Fingerprint of a peer certificate already validated during tunnel
    /// establishment.
    PeerCertificate(String),
}

impl Credential {
    /// The raw credential value.
    pub fn secret(&self) -> &str {
        match self {
            Credential::Bearer(t) => t,
            Credential::PeerCertificate(fp) => fp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Bearer(_) => "bearer",
            Credential::PeerCertificate(_) => "certificate",
        }
    }

    /// Short hex digest of the credential, safe to put in logs.
    pub fn fingerprint(&self) -> String {
        credential_fingerprint(self.secret())
    }
}

// Keep raw tokens out of `{:?}` output.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential::{}({})", self.kind(), self.fingerprint())
    }
}

/// First 12 hex chars of SHA-256 over the credential bytes.
pub fn credential_fingerprint(secret: &str) -> String {
    let hash = Sha256::digest(secret.as_bytes());
    let mut hexed = hex::encode(hash);
    hexed.truncate(12);
    hexed
}
