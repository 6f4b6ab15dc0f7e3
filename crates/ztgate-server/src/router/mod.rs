//! Destination routing.
//!
//! - **[`route`]**: [`DestinationRouter`] decides between the overlay peer
//!   path and the external path, and dials the chosen endpoint.
//! - **[`peers`]**: the live peer table ([`WgPeerTable`]) or a fixed list
//!   ([`StaticPeerTable`]).
//! - **[`marker`]**: best-effort egress marking ([`IptablesMarker`]).
//! - **[`resolver`]**: async hostname resolution.

pub mod marker;
pub mod peers;
pub mod resolver;
pub mod route;

pub use marker::{IptablesMarker, MarkLease, NoopMarker, PacketMarker};
pub use peers::{PeerTable, StaticPeerTable, WgPeerTable};
pub use resolver::DnsResolver;
pub use route::{DestinationRouter, Route};
