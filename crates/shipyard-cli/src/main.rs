//! Shipyard - deploy services to your own hosts
//!
//! Usage:
//!   shipyard deploy <root> <environment>   # Deploy every application
//!   shipyard bootstrap <host>              # Prepare a fresh host
//!   shipyard proxy show <host>             # Print a proxy's routing document
//!   shipyard proxy render <file>           # Render a local routing document

mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shipyard_core::deploy::Deployer;
use shipyard_core::proxy::{ProxyConfig, ProxyConfigStore, RenderOptions, render};
use shipyard_core::settings::{BuildLocation, Settings, SettingsStore};
use shipyard_core::transport::{SshTransport, Transport};

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Deploy services to your own hosts", version, long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.config/shipyard/settings.toml)
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy every application declared in <root>/deploy.toml
    Deploy {
        /// Source root holding the descriptor and application folders
        root: PathBuf,

        /// Environment to deploy (e.g. production)
        environment: String,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,

        /// Where to compile (overrides the settings file)
        #[arg(long)]
        build: Option<BuildArg>,
    },

    /// Create the remote root directory on a fresh host
    Bootstrap {
        host: String,
    },

    /// Inspect proxy routing documents
    Proxy(ProxyArgs),
}

#[derive(Args)]
struct ProxyArgs {
    #[command(subcommand)]
    command: ProxySubcommand,
}

#[derive(Subcommand)]
enum ProxySubcommand {
    /// Print the routing document stored on a proxy
    Show {
        host: String,

        /// Print the load-balancer configuration rendered from it instead
        #[arg(long)]
        rendered: bool,
    },

    /// Render a local routing document without contacting any host
    Render {
        file: PathBuf,

        /// Frontend bind address (defaults to the settings file)
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildArg {
    Local,
    Remote,
}

impl From<BuildArg> for BuildLocation {
    fn from(arg: BuildArg) -> Self {
        match arg {
            BuildArg::Local => BuildLocation::Local,
            BuildArg::Remote => BuildLocation::Remote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "shipyard=debug,shipyard_core=debug"
    } else {
        "shipyard=info,shipyard_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = load_settings(cli.settings)?;

    match cli.command {
        Commands::Deploy {
            root,
            environment,
            format,
            build,
        } => run_deploy(settings, root, environment, format, build).await,
        Commands::Bootstrap { host } => run_bootstrap(settings, host).await,
        Commands::Proxy(args) => match args.command {
            ProxySubcommand::Show { host, rendered } => {
                run_proxy_show(settings, host, rendered).await
            }
            ProxySubcommand::Render { file, bind } => run_proxy_render(&settings, file, bind),
        },
    }
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let store = match path {
        Some(path) => SettingsStore::from_path(path),
        None => SettingsStore::from_default_location()?,
    };
    store.load()
}

async fn run_deploy(
    mut settings: Settings,
    root: PathBuf,
    environment: String,
    format: OutputFormat,
    build: Option<BuildArg>,
) -> Result<()> {
    if let Some(build) = build {
        settings.build_location = build.into();
    }
    let transport = Arc::new(SshTransport::new(settings.ssh.clone()));
    let deployer = Deployer::new(transport, settings);

    let report = deployer
        .deploy(&root, &environment)
        .await
        .with_context(|| {
            format!(
                "Deployment of {} to `{}` was rejected before contacting any host",
                root.display(),
                environment
            )
        })?;

    match format {
        OutputFormat::Table => output::print_report(&report),
        OutputFormat::Json => output::print_report_json(&report)?,
    }

    if !report.is_success() {
        output::print_failures(&report);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_bootstrap(settings: Settings, host: String) -> Result<()> {
    let transport = Arc::new(SshTransport::new(settings.ssh.clone()));
    let deployer = Deployer::new(transport, settings);
    deployer
        .bootstrap(&host)
        .await
        .with_context(|| format!("Failed to bootstrap {host}"))?;
    println!("{} is ready", host);
    Ok(())
}

async fn run_proxy_show(settings: Settings, host: String, rendered: bool) -> Result<()> {
    let transport = SshTransport::new(settings.ssh.clone());
    let store = ProxyConfigStore::new(settings.proxy.clone());

    let conn = transport
        .connect(&host)
        .await
        .with_context(|| format!("Failed to connect to {host}"))?;
    let loaded = store.load(conn.as_ref()).await;
    if let Err(err) = conn.close().await {
        tracing::warn!(host = %host, error = %err, "failed to close connection");
    }
    let cfg = loaded.with_context(|| format!("Failed to read the routing document on {host}"))?;

    if rendered {
        print!("{}", render(&cfg, &store.render_options()));
    } else {
        print!("{}", cfg.to_document()?);
    }
    Ok(())
}

fn run_proxy_render(settings: &Settings, file: PathBuf, bind: Option<String>) -> Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let cfg: ProxyConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse routing document {}", file.display()))?;
    let options = RenderOptions {
        bind: bind.unwrap_or_else(|| settings.proxy.bind.clone()),
    };
    print!("{}", render(&cfg, &options));
    Ok(())
}
