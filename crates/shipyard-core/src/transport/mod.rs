//! Remote execution and file transfer.
//!
//! The orchestrator only talks to hosts through [`Transport`] and
//! [`Connection`]. [`ssh::SshTransport`] is the production implementation;
//! [`memory::MemoryTransport`] simulates hosts in-process for tests.

pub mod memory;
pub mod pool;
pub mod ssh;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::RemoteCommand;
use crate::error::TransportError;

pub use memory::{MemoryHost, MemoryTransport};
pub use pool::ConnectionPool;
pub use ssh::SshTransport;

/// Opens connections to hosts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An open channel to one host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Hostname this connection was opened for.
    fn host(&self) -> &str;

    /// Run a command and return its standard output.
    async fn execute(&self, command: &RemoteCommand) -> Result<String, TransportError>;

    /// Copy one local file to `remote`, replacing it.
    async fn send_file(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Mirror `local` into `remote`: remote files absent locally are removed.
    async fn sync_directory(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Write `contents` to a local temp file for [`Connection::send_file`].
///
/// The file is flushed before returning and deleted when the handle drops,
/// on success and error paths alike.
pub fn stage_text(contents: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}
