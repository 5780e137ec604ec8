//! Listening-port allocation.
//!
//! Allocation is stateless: callers query the host's live socket table right
//! before allocating, so two deployments racing on the same host see each
//! other's bound ports instead of a stale cached view.

use std::collections::BTreeSet;

use crate::error::PortError;

/// First port handed out to services.
pub const DEFAULT_BASE_PORT: u16 = 9000;

/// Return the smallest port `>= base` that is not in `listening`.
pub fn allocate(listening: &BTreeSet<u16>, base: u16) -> Result<u16, PortError> {
    (base..=u16::MAX)
        .find(|port| !listening.contains(port))
        .ok_or(PortError::Exhausted { base })
}

/// Parse the TCP listen table printed by `ss -Hltn` or `netstat -lnt`.
///
/// Only rows in `LISTEN` state count. The local address is the first column
/// shaped like `addr:port`; wildcard peers such as `0.0.0.0:*` never parse as
/// a port, so the peer column is skipped naturally.
pub fn parse_listening_ports(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter(|line| line.split_whitespace().any(|field| field == "LISTEN"))
        .filter_map(|line| line.split_whitespace().find_map(local_port))
        .collect()
}

fn local_port(field: &str) -> Option<u16> {
    let (_, port) = field.rsplit_once(':')?;
    port.parse().ok()
}
