//! Connection pool keyed by hostname.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Connection, Transport};
use crate::error::TransportError;

/// One connection per distinct hostname for the duration of an
/// application's deployment.
///
/// Hosts that fail to connect are remembered with their error so callers can
/// report them without aborting work on the other hosts. [`close_all`] must be
/// called on every exit path; the orchestrator does so unconditionally.
///
/// [`close_all`]: ConnectionPool::close_all
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    connections: BTreeMap<String, Arc<dyn Connection>>,
    failures: BTreeMap<String, TransportError>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connections: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Connect to every host not already in the pool. Duplicates are
    /// collapsed; failures are recorded, not returned.
    pub async fn acquire<'a, I>(&mut self, hosts: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for host in hosts {
            if self.connections.contains_key(host) || self.failures.contains_key(host) {
                continue;
            }
            match self.transport.connect(host).await {
                Ok(conn) => {
                    debug!(host, "connected");
                    self.connections.insert(host.to_string(), conn);
                }
                Err(err) => {
                    warn!(host, error = %err, "connection failed");
                    self.failures.insert(host.to_string(), err);
                }
            }
        }
    }

    pub fn get(&self, host: &str) -> Result<Arc<dyn Connection>, TransportError> {
        if let Some(conn) = self.connections.get(host) {
            return Ok(Arc::clone(conn));
        }
        Err(self
            .failures
            .get(host)
            .cloned()
            .unwrap_or_else(|| TransportError::new(host, "connect", "host was never acquired")))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and forget every connection. Close failures are logged only:
    /// the work on the host is already done at this point.
    pub async fn close_all(&mut self) {
        for (host, conn) in std::mem::take(&mut self.connections) {
            if let Err(err) = conn.close().await {
                warn!(host = %host, error = %err, "failed to close connection");
            }
        }
        self.failures.clear();
    }
}
