//! Locality ordering
//!
//! When this process runs on a control-plane node, the API server bound to
//! one of our own interfaces is the cheapest to reach.

use std::collections::HashSet;
use std::net::IpAddr;
use tracing::warn;

/// IP addresses bound to the local network interfaces.
/// Returns an empty set when the interfaces cannot be listed.
pub fn local_addresses() -> HashSet<IpAddr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => ifaces.into_iter().map(|(_, ip)| ip).collect(),
        Err(e) => {
            warn!("Failed to list local interfaces: {}", e);
            HashSet::new()
        }
    }
}

/// Move the first address found in `local` to the front, keeping the
/// relative order of everything else. Returns whether a move happened.
pub fn move_first_local_to_front(ips: &mut [IpAddr], local: &HashSet<IpAddr>) -> bool {
    match ips.iter().position(|ip| local.contains(ip)) {
        Some(0) => true,
        Some(pos) => {
            ips[..=pos].rotate_right(1);
            true
        }
        None => false,
    }
}
