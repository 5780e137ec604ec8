//! Go build collaborator.
//!
//! Sources are prepared on the operator's machine (dependencies vendored
//! into the scratch copy) and then compiled either locally, before staging,
//! or on every server inside the staged tree.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use crate::command::RemoteCommand;
use crate::descriptor::ApplicationDescriptor;
use crate::error::BuildError;
use crate::layout::RemoteLayout;

/// Whether `go mod vendor` should run in `source_dir`.
pub fn needs_vendor(source_dir: &Path) -> bool {
    source_dir.join("go.mod").is_file() && !source_dir.join("vendor").exists()
}

/// Vendor module dependencies into the scratch copy so servers never fetch
/// them. Sources without a `go.mod`, or already vendored, are left as-is.
pub async fn prepare(app: &ApplicationDescriptor, source_dir: &Path) -> Result<(), BuildError> {
    if !needs_vendor(source_dir) {
        debug!(app = %app.name, "nothing to vendor");
        return Ok(());
    }
    info!(app = %app.name, "vendoring Go modules");
    run_go(source_dir, &["mod", "vendor"])
        .await
        .map_err(|message| BuildError::Prepare {
            app: app.name.clone(),
            message,
        })
}

/// Compile on the operator's machine into `output`, for Linux targets.
pub async fn build_local(
    app: &ApplicationDescriptor,
    source_dir: &Path,
    output: &Path,
) -> Result<(), BuildError> {
    info!(app = %app.name, output = %output.display(), "building locally");
    let output = output.to_string_lossy();
    run_go(source_dir, &["build", "-v", "-o", output.as_ref(), "."])
        .await
        .map_err(|message| BuildError::Local {
            app: app.name.clone(),
            message,
        })
}

/// The command that compiles the staged sources in place on a server,
/// leaving the executable where the cutover expects it.
pub fn remote_command(layout: &RemoteLayout, folder: &str) -> RemoteCommand {
    let dir = match folder.trim_matches('/') {
        "" | "." => layout.staging_dir(),
        folder => format!("{}/{}", layout.staging_dir(), folder),
    };
    RemoteCommand::GoBuild {
        dir,
        output: layout.staged_binary(),
    }
}

async fn run_go(dir: &Path, args: &[&str]) -> Result<(), String> {
    let output = Command::new("go")
        .args(args)
        .current_dir(dir)
        .env("GOOS", "linux")
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to run go: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("go {} exited with {}: {}", args.join(" "), output.status, stderr.trim()));
    }
    Ok(())
}
