//! Public address of a server as published to the proxies.

use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::command::RemoteCommand;
use crate::transport::Connection;

/// A dotted-quad hostname is used as-is. Otherwise the host is asked for its
/// interfaces and the first non-loopback IPv4 address wins. A host that
/// cannot list its interfaces, or reports none, falls back to its hostname.
pub async fn resolve_address(conn: &dyn Connection, hostname: &str) -> String {
    if hostname.parse::<Ipv4Addr>().is_ok() {
        return hostname.to_string();
    }
    let output = match conn.execute(&RemoteCommand::InterfaceAddresses).await {
        Ok(output) => output,
        Err(err) => {
            warn!(host = hostname, error = %err, "listing interfaces failed, publishing the hostname");
            return hostname.to_string();
        }
    };
    match first_inet(&output) {
        Some(address) => {
            debug!(host = hostname, address = %address, "resolved server address");
            address.to_string()
        }
        None => {
            warn!(host = hostname, "no non-loopback IPv4 address found, publishing the hostname");
            hostname.to_string()
        }
    }
}

/// First `inet a.b.c.d/len` entry of `ip -4 addr show` output that is not
/// a loopback address.
pub fn first_inet(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            (fields.next()? == "inet").then_some(())?;
            let cidr = fields.next()?;
            cidr.split('/').next()?.parse::<Ipv4Addr>().ok()
        })
        .find(|addr| !addr.is_loopback())
}
