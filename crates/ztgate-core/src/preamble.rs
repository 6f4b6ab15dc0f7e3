//! Embedded credential/destination framing for raw TCP and UDP flows.
//!
//! Clients prefix the first bytes of a TCP stream, or every UDP datagram,
//! with a few text lines:
//!
//! ```text
//! Authorization: Bearer <token>        (or: X-Peer-Certificate: <fingerprint>)
//! Host: <host>:<port>
//!                                      (optional blank line)
//! <payload...>
//! ```
//!
//! Marker keys are case-insensitive and lines end in `\n` or `\r\n`. The
//! marker lines are consumed; everything after them is payload to replay
//! upstream. Parsing sits behind [`PreambleParser`] so the format can be
//! replaced without touching the front ends.

use crate::error::FramingError;
use crate::identity::Credential;

/// Largest preamble (marker lines only) accepted.
pub const MAX_PREAMBLE: usize = 8 * 1024;

/// A parsed preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub credential: Credential,
    pub target: String,
    /// Offset into the input where the payload begins.
    pub payload_offset: usize,
}

/// Extracts credential and destination from the start of a flow.
pub trait PreambleParser: Send + Sync {
    /// Parse `buf`. [`FramingError::Incomplete`] means more bytes are needed
    /// (stream transports may read again; datagram transports must drop).
    fn parse(&self, buf: &[u8]) -> Result<Preamble, FramingError>;
}

/// The line-oriented marker format described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinePreambleParser;

enum Marker {
    Credential(Credential),
    Target(String),
}

impl LinePreambleParser {
    fn marker(line: &str) -> Option<Marker> {
        let (key, value) = line.split_once(':')?;
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "authorization" => {
                let (scheme, token) = value.split_once(char::is_whitespace)?;
                if !scheme.eq_ignore_ascii_case("bearer") {
                    return None;
                }
                Some(Marker::Credential(Credential::Bearer(token.trim().to_string())))
            }
            "x-peer-certificate" => Some(Marker::Credential(Credential::PeerCertificate(
                value.to_string(),
            ))),
            "host" => Some(Marker::Target(value.to_string())),
            _ => None,
        }
    }
}

impl PreambleParser for LinePreambleParser {
    fn parse(&self, buf: &[u8]) -> Result<Preamble, FramingError> {
        let mut credential = None;
        let mut target = None;
        let mut offset = 0;

        loop {
            if credential.is_some() && target.is_some() {
                // Optional blank separator line.
                let rest = &buf[offset..];
                if rest.starts_with(b"\r\n") {
                    offset += 2;
                } else if rest.starts_with(b"\n") {
                    offset += 1;
                }
                break;
            }

            let rest = &buf[offset..];
            let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
                if buf.len() >= MAX_PREAMBLE {
                    return Err(FramingError::TooLarge(MAX_PREAMBLE));
                }
                return Err(FramingError::Incomplete);
            };
            if offset + nl >= MAX_PREAMBLE {
                return Err(FramingError::TooLarge(MAX_PREAMBLE));
            }

            let line = String::from_utf8_lossy(&rest[..nl]);
            let line = line.trim_end_matches('\r');

            match Self::marker(line) {
                Some(Marker::Credential(c)) => {
                    if credential.replace(c).is_some() {
                        return Err(FramingError::Duplicate("credential"));
                    }
                }
                Some(Marker::Target(t)) => {
                    if target.replace(t).is_some() {
                        return Err(FramingError::Duplicate("host"));
                    }
                }
                None if credential.is_none() => return Err(FramingError::MissingCredential),
                None => return Err(FramingError::MissingTarget),
            }
            offset += nl + 1;
        }

        match (credential, target) {
            (Some(credential), Some(target)) if !target.is_empty() => Ok(Preamble {
                credential,
                target,
                payload_offset: offset,
            }),
            (None, _) => Err(FramingError::MissingCredential),
            _ => Err(FramingError::MissingTarget),
        }
    }
}
