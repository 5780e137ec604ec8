//! Report rendering for the terminal.

use anyhow::Result;
use console::style;

use shipyard_core::descriptor::AppKind;
use shipyard_core::error::Recovery;
use shipyard_core::report::{ApplicationReport, DeploymentReport, ServerOutcome, ServerPhase};

pub fn print_report(report: &DeploymentReport) {
    let took = report.finished_at - report.started_at;
    println!(
        "Environment: {}  ({}, {:.1}s)",
        style(&report.environment).bold(),
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        took.num_milliseconds() as f64 / 1000.0
    );

    for app in &report.applications {
        println!();
        print_application(app);
    }
}

fn print_application(app: &ApplicationReport) {
    let kind = match app.kind {
        AppKind::Service => "service",
        AppKind::Web => "web",
    };
    let digest = app
        .digest
        .as_deref()
        .map(|d| &d[..d.len().min(12)])
        .unwrap_or("-");
    println!("{} ({})  digest {}", style(&app.name).bold().cyan(), kind, digest);
    if let Some(err) = &app.error {
        println!("  {} {}", style("aborted:").red().bold(), err);
    }

    println!("  {:<24} {:<16} {:<6} Status", "Server", "Address", "Port");
    for server in &app.servers {
        println!(
            "  {:<24} {:<16} {:<6} {}",
            server.host,
            server.address.as_deref().unwrap_or("-"),
            server.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            server_status(server)
        );
    }

    if !app.proxies.is_empty() {
        println!("  {:<24} {:<16} Status", "Proxy", "Operation");
        for proxy in &app.proxies {
            let status = match &proxy.error {
                None => style("ok".to_string()).green(),
                Some(err) => style(format!("failed: {err}")).red(),
            };
            println!("  {:<24} {:<16} {}", proxy.host, proxy.operation.to_string(), status);
        }
    }
}

fn server_status(server: &ServerOutcome) -> String {
    if server.succeeded() {
        return style("ok").green().to_string();
    }
    let Some(err) = &server.error else {
        return style("skipped").yellow().to_string();
    };

    let mut status = match (server.failed_at, server.step) {
        (_, Some(step)) => format!("failed at {step}: {err}"),
        (Some(phase), None) => format!("failed at {}: {err}", phase_name(phase)),
        (None, None) => format!("failed: {err}"),
    };
    match &server.recovery {
        Some(Recovery::Restarted) => status.push_str(" (service restarted)"),
        Some(Recovery::RestartFailed { message }) => {
            status.push_str(&format!(" (service is down: {message})"))
        }
        Some(Recovery::NotNeeded) | None => {}
    }
    style(status).red().to_string()
}

fn phase_name(phase: ServerPhase) -> &'static str {
    match phase {
        ServerPhase::Connect => "connect",
        ServerPhase::Stage => "stage",
        ServerPhase::Build => "build",
        ServerPhase::Cutover => "cutover",
    }
}

pub fn print_report_json(report: &DeploymentReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    println!("{}", json);
    Ok(())
}

/// Every failure with its causal chain, on stderr.
pub fn print_failures(report: &DeploymentReport) {
    eprintln!();
    eprintln!("{}", style("Deployment finished with failures:").red().bold());
    for failure in report.failures() {
        eprintln!("  - {}", failure);
    }
}
