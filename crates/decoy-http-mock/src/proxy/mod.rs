//! Outbound side of the server: the origin client and proxy header hygiene.

pub mod client;
pub mod hop_by_hop;

pub use client::{HyperOriginClient, OriginClient, PendingResponse};
pub use hop_by_hop::strip_hop_by_hop_headers;
