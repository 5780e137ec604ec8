//! Promote a staged tree to live on one server.
//!
//! The sequence is stop, swap, allocate, install, start, strictly in that
//! order. Once this engine has stopped the service, any later failure is
//! followed by an attempt to start it again from whatever `current` holds,
//! and the outcome of that attempt is carried in the error.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::command::{RemoteCommand, ServiceAction};
use crate::error::{CutoverCause, CutoverError, CutoverStep, Recovery, TransportError};
use crate::layout::RemoteLayout;
use crate::port;
use crate::settings::Settings;
use crate::transport::{Connection, stage_text};
use crate::unit::{self, UnitSpec};

/// Glob of source files removed from the live tree after a swap.
pub const SOURCE_PATTERN: &str = "*.go";

#[derive(Debug, Clone)]
pub struct CutoverEngine {
    settings: Arc<Settings>,
}

impl CutoverEngine {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Run the full cutover and return the port the service now listens on.
    pub async fn run(
        &self,
        conn: &dyn Connection,
        layout: &RemoteLayout,
    ) -> Result<u16, CutoverError> {
        let host = conn.host().to_string();
        let unit = layout.unit_name();
        info!(host = %host, app = layout.name(), "starting cutover");

        let stopped = match conn
            .execute(&RemoteCommand::service(ServiceAction::Stop, unit.as_str()))
            .await
        {
            Ok(_) => true,
            Err(err) => {
                // First deploys have nothing to stop.
                warn!(host = %host, unit = %unit, error = %err, "stop failed, continuing");
                false
            }
        };

        match self.promote(conn, layout).await {
            Ok(port) => {
                info!(host = %host, app = layout.name(), port, "cutover complete");
                Ok(port)
            }
            Err((step, cause)) => {
                let recovery = if stopped {
                    self.recover(conn, &unit).await
                } else {
                    Recovery::NotNeeded
                };
                Err(CutoverError {
                    host,
                    app: layout.name().to_string(),
                    step,
                    recovery,
                    cause,
                })
            }
        }
    }

    async fn promote(
        &self,
        conn: &dyn Connection,
        layout: &RemoteLayout,
    ) -> Result<u16, (CutoverStep, CutoverCause)> {
        self.swap(conn, layout)
            .await
            .map_err(|e| (CutoverStep::Swap, CutoverCause::from(e)))?;

        let listing = conn
            .execute(&RemoteCommand::ListeningPorts)
            .await
            .map_err(|e| (CutoverStep::Allocate, CutoverCause::from(e)))?;
        let listening = port::parse_listening_ports(&listing);
        let port = port::allocate(&listening, self.settings.base_port)
            .map_err(|e| (CutoverStep::Allocate, CutoverCause::from(e)))?;
        debug!(host = conn.host(), port, bound = listening.len(), "allocated port");

        self.install(conn, layout, port)
            .await
            .map_err(|e| (CutoverStep::Install, e))?;

        conn.execute(&RemoteCommand::service(ServiceAction::Start, layout.unit_name()))
            .await
            .map_err(|e| (CutoverStep::Start, CutoverCause::from(e)))?;
        Ok(port)
    }

    async fn swap(
        &self,
        conn: &dyn Connection,
        layout: &RemoteLayout,
    ) -> Result<(), TransportError> {
        let current = layout.current_dir();
        conn.execute(&RemoteCommand::ClearDir {
            path: current.clone(),
        })
        .await?;

        let copied = conn
            .execute(&RemoteCommand::CopyTree {
                from: layout.staging_dir(),
                to: current.clone(),
            })
            .await;
        if let Err(err) = copied {
            error!(
                host = conn.host(),
                path = %current,
                error = %err,
                "copy into the live tree failed after it was cleared; it may be empty or partial until the next deploy"
            );
            return Err(err);
        }

        if self.settings.prune_sources {
            conn.execute(&RemoteCommand::PruneFiles {
                root: current,
                pattern: SOURCE_PATTERN.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    async fn install(
        &self,
        conn: &dyn Connection,
        layout: &RemoteLayout,
        port: u16,
    ) -> Result<(), CutoverCause> {
        let text = unit::render(&UnitSpec::new(layout, port, &self.settings));
        let staged = stage_text(&text)?;
        conn.send_file(staged.path(), &layout.unit_path()).await?;
        conn.execute(&RemoteCommand::DaemonReload).await?;
        conn.execute(&RemoteCommand::service(ServiceAction::Enable, layout.unit_name()))
            .await?;
        Ok(())
    }

    async fn recover(&self, conn: &dyn Connection, unit: &str) -> Recovery {
        warn!(host = conn.host(), unit, "cutover failed after stop, restarting service");
        match conn
            .execute(&RemoteCommand::service(ServiceAction::Start, unit))
            .await
        {
            Ok(_) => Recovery::Restarted,
            Err(err) => {
                error!(host = conn.host(), unit, error = %err, "service is down");
                Recovery::RestartFailed {
                    message: err.to_string(),
                }
            }
        }
    }
}
