//! Node identity normalization.

use std::net::{IpAddr, SocketAddr};

/// Derive a node key from a peer address string.
///
/// Everything from the first colon on is dropped, so `"10.0.0.5:54321"`
/// becomes `"10.0.0.5"`.
#[must_use]
pub fn node_identity(peer: &str) -> String {
    peer.split_once(':')
        .map_or(peer, |(host, _)| host)
        .to_string()
}

/// Derive a node key from a connected socket address.
///
/// IPv4 peers follow [`node_identity`], including IPv4-mapped peers seen on
/// a dual-stack listener. IPv6 peers use the bare address, since their
/// textual form already contains colons.
#[must_use]
pub fn node_identity_from_addr(addr: &SocketAddr) -> String {
    match addr.ip().to_canonical() {
        ip @ IpAddr::V4(_) => node_identity(&SocketAddr::new(ip, addr.port()).to_string()),
        ip @ IpAddr::V6(_) => ip.to_string(),
    }
}
