//! Deployment orchestrator.
//!
//! Applications are deployed one after another. For each one:
//! 1. copy its sources into a scratch directory, vendor and optionally build
//! 2. connect once to every distinct server and proxy
//! 3. stage the scratch tree on every server, resolve its address, build
//! 4. web apps: withdraw the application's routes on every proxy
//! 5. cut every staged server over to the new release
//! 6. web apps: publish the complete new backend set on every proxy
//!
//! Per-server and per-proxy work runs concurrently. Host failures are
//! collected in the report instead of aborting the run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::build;
use crate::command::RemoteCommand;
use crate::cutover::CutoverEngine;
use crate::deploy::address::resolve_address;
use crate::descriptor::{
    ApplicationDescriptor, BuildKind, DeployTarget, load_descriptors, select_environment,
};
use crate::error::{
    BuildError, ConfigError, DeployError, ProxyOperation, ProxyStoreError, ProxySyncError,
    TransportError, causal_chain,
};
use crate::fs::{copy_source_tree, digest_tree};
use crate::layout::RemoteLayout;
use crate::proxy::{ProxyApplication, ProxyConfigStore, ProxyServer};
use crate::report::{ApplicationReport, DeploymentReport, ProxyOutcome, ServerOutcome, ServerPhase};
use crate::settings::{BuildLocation, Settings};
use crate::transport::{Connection, ConnectionPool, Transport};

/// Scratch copy of one application, removed when dropped.
struct PreparedSources {
    dir: TempDir,
    digest: String,
}

#[derive(Debug, Clone)]
enum ProxyChange {
    Withdraw(String),
    Upsert(ProxyApplication),
}

impl ProxyChange {
    fn operation(&self) -> ProxyOperation {
        match self {
            ProxyChange::Withdraw(_) => ProxyOperation::Withdraw,
            ProxyChange::Upsert(_) => ProxyOperation::Upsert,
        }
    }
}

pub struct Deployer {
    transport: Arc<dyn Transport>,
    settings: Arc<Settings>,
    proxy_store: Arc<ProxyConfigStore>,
    cutover: CutoverEngine,
}

impl Deployer {
    pub fn new(transport: Arc<dyn Transport>, settings: Settings) -> Self {
        let settings = Arc::new(settings);
        Self {
            transport,
            proxy_store: Arc::new(ProxyConfigStore::new(settings.proxy.clone())),
            cutover: CutoverEngine::new(Arc::clone(&settings)),
            settings,
        }
    }

    /// Deploy every application under `root` to `environment`.
    ///
    /// Configuration problems are returned before any host is contacted.
    /// Everything after that ends up in the report, which the caller must
    /// inspect with [`DeploymentReport::is_success`].
    pub async fn deploy(
        &self,
        root: &Path,
        environment: &str,
    ) -> Result<DeploymentReport, ConfigError> {
        self.settings.validate()?;
        let targets = select_environment(load_descriptors(root)?, environment)?;
        for target in &targets {
            let dir = root.join(target.app.folder_path());
            if !dir.is_dir() {
                return Err(ConfigError::InvalidField {
                    app: target.app.name.clone(),
                    field: "folder".to_string(),
                    message: format!("{} is not a directory", dir.display()),
                });
            }
        }

        info!(environment, applications = targets.len(), "starting deployment");
        let mut report = DeploymentReport::new(environment);
        for target in &targets {
            let app_report = self.deploy_application(root, target, &mut report.errors).await;
            report.applications.push(app_report);
        }
        report.finish();

        if report.is_success() {
            info!(environment, "deployment complete");
        } else {
            warn!(environment, failures = report.errors.len(), "deployment finished with failures");
        }
        Ok(report)
    }

    /// Create the remote root on a fresh host.
    pub async fn bootstrap(&self, host: &str) -> Result<(), TransportError> {
        let conn = self.transport.connect(host).await?;
        let result = conn
            .execute(&RemoteCommand::Provision {
                root: self.settings.remote_root.clone(),
            })
            .await
            .map(|_| ());
        if let Err(err) = conn.close().await {
            warn!(host, error = %err, "failed to close connection");
        }
        if result.is_ok() {
            info!(host, root = %self.settings.remote_root, "host bootstrapped");
        }
        result
    }

    async fn deploy_application(
        &self,
        root: &Path,
        target: &DeployTarget,
        errors: &mut Vec<DeployError>,
    ) -> ApplicationReport {
        let app = &target.app;
        let mut report = ApplicationReport::new(&app.name, app.kind);
        report.servers = target
            .spec
            .servers
            .iter()
            .map(ServerOutcome::pending)
            .collect();
        info!(app = %app.name, servers = report.servers.len(), "deploying application");

        let sources = match self.prepare_sources(root, app).await {
            Ok(sources) => sources,
            Err(err) => {
                error!(app = %app.name, error = %err, "preparing sources failed");
                report.error = Some(causal_chain(&err));
                errors.push(err.into());
                return report;
            }
        };
        report.digest = Some(sources.digest.clone());

        let mut pool = ConnectionPool::new(Arc::clone(&self.transport));
        pool.acquire(target.spec.hosts()).await;
        self.run_pipeline(&pool, target, &sources, &mut report, errors)
            .await;
        pool.close_all().await;
        report
    }

    async fn prepare_sources(
        &self,
        root: &Path,
        app: &ApplicationDescriptor,
    ) -> Result<PreparedSources, BuildError> {
        let prepare_err = |message: String| BuildError::Prepare {
            app: app.name.clone(),
            message,
        };

        let dir = tempfile::Builder::new()
            .prefix("shipyard-")
            .tempdir()
            .map_err(|e| prepare_err(e.to_string()))?;
        copy_source_tree(root, app.folder_path(), dir.path())
            .map_err(|e| prepare_err(format!("{e:#}")))?;

        let source_dir = dir.path().join(app.folder_path());
        match app.build {
            BuildKind::Go => {
                build::prepare(app, &source_dir).await?;
                if self.settings.build_location == BuildLocation::Local {
                    build::build_local(app, &source_dir, &dir.path().join(&app.name)).await?;
                }
            }
        }

        let digest = digest_tree(dir.path()).map_err(|e| prepare_err(format!("{e:#}")))?;
        info!(app = %app.name, digest = %digest, "sources prepared");
        Ok(PreparedSources { dir, digest })
    }

    async fn run_pipeline(
        &self,
        pool: &ConnectionPool,
        target: &DeployTarget,
        sources: &PreparedSources,
        report: &mut ApplicationReport,
        errors: &mut Vec<DeployError>,
    ) {
        let app = &target.app;
        let layout = RemoteLayout::new(&self.settings, &app.name, &target.environment);

        let staged = self
            .stage_servers(pool, target, &layout, sources.dir.path(), report, errors)
            .await;
        if report.error.is_some() {
            return;
        }
        if staged.is_empty() {
            error!(app = %app.name, "no server was staged, leaving routes and services untouched");
            report.error = Some("no server could be staged".to_string());
            return;
        }

        if app.is_web() {
            let change = ProxyChange::Withdraw(app.name.clone());
            let outcomes = self.sync_proxies(pool, target, change, errors).await;
            report.proxies.extend(outcomes);
        }

        self.cut_over(staged, &layout, report, errors).await;

        if app.is_web() {
            let servers = report
                .servers
                .iter()
                .filter(|s| s.succeeded())
                .filter_map(|s| Some(ProxyServer::new(s.address.clone()?, s.port?)))
                .collect();
            let application = ProxyApplication {
                name: app.name.clone(),
                domains: target.spec.domains.clone(),
                servers,
            };
            let change = ProxyChange::Upsert(application);
            let outcomes = self.sync_proxies(pool, target, change, errors).await;
            report.proxies.extend(outcomes);
        }
    }

    /// Stage, resolve and (remotely) build on every server. Returns the
    /// servers ready for cutover, in descriptor order. A remote build
    /// failure marks the whole application failed.
    async fn stage_servers(
        &self,
        pool: &ConnectionPool,
        target: &DeployTarget,
        layout: &RemoteLayout,
        local: &Path,
        report: &mut ApplicationReport,
        errors: &mut Vec<DeployError>,
    ) -> Vec<(usize, Arc<dyn Connection>)> {
        let app = &target.app;
        let remote_build = match (app.build, self.settings.build_location) {
            (BuildKind::Go, BuildLocation::Remote) => {
                Some(build::remote_command(layout, &app.folder))
            }
            (BuildKind::Go, BuildLocation::Local) => None,
        };

        let mut tasks = JoinSet::new();
        let mut spawned: HashMap<Id, usize> = HashMap::new();
        for (index, host) in target.spec.servers.iter().enumerate() {
            let conn = match pool.get(host) {
                Ok(conn) => conn,
                Err(err) => {
                    report.servers[index].fail(ServerPhase::Connect, &err);
                    errors.push(err.into());
                    continue;
                }
            };
            let host = host.clone();
            let layout = layout.clone();
            let local = local.to_path_buf();
            let remote_build = remote_build.clone();
            let handle = tasks.spawn(async move {
                let result =
                    stage_server(conn.as_ref(), &host, &layout, &local, remote_build.as_ref())
                        .await;
                (index, conn, result)
            });
            spawned.insert(handle.id(), index);
        }

        let mut staged = Vec::new();
        let mut failed_builds = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (index, conn, result) = match joined {
                Ok((_, done)) => done,
                Err(err) => {
                    if let Some(&index) = spawned.get(&err.id()) {
                        let outcome = &mut report.servers[index];
                        let err = task_failed(&outcome.host, &app.name, "staging", &err);
                        outcome.fail(ServerPhase::Stage, &err);
                        errors.push(err);
                    }
                    continue;
                }
            };
            let outcome = &mut report.servers[index];
            match result {
                Ok(address) => {
                    outcome.address = Some(address);
                    staged.push((index, conn));
                }
                Err((ServerPhase::Build, err)) => {
                    let err = BuildError::Remote {
                        app: app.name.clone(),
                        source: err,
                    };
                    outcome.fail(ServerPhase::Build, &err);
                    failed_builds.push(outcome.host.clone());
                    errors.push(err.into());
                }
                Err((phase, err)) => {
                    outcome.fail(phase, &err);
                    errors.push(err.into());
                }
            }
        }

        if !failed_builds.is_empty() {
            failed_builds.sort();
            error!(app = %app.name, hosts = ?failed_builds, "remote build failed, skipping cutover");
            report.error = Some(format!("remote build failed on {}", failed_builds.join(", ")));
            return Vec::new();
        }
        staged.sort_by_key(|(index, _)| *index);
        staged
    }

    async fn cut_over(
        &self,
        staged: Vec<(usize, Arc<dyn Connection>)>,
        layout: &RemoteLayout,
        report: &mut ApplicationReport,
        errors: &mut Vec<DeployError>,
    ) {
        let mut tasks = JoinSet::new();
        let mut spawned: HashMap<Id, usize> = HashMap::new();
        for (index, conn) in staged {
            let engine = self.cutover.clone();
            let layout = layout.clone();
            let handle =
                tasks.spawn(async move { (index, engine.run(conn.as_ref(), &layout).await) });
            spawned.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (index, result) = match joined {
                Ok((_, done)) => done,
                Err(err) => {
                    if let Some(&index) = spawned.get(&err.id()) {
                        let outcome = &mut report.servers[index];
                        let err = task_failed(&outcome.host, layout.name(), "cutover", &err);
                        outcome.fail(ServerPhase::Cutover, &err);
                        errors.push(err);
                    }
                    continue;
                }
            };
            let outcome = &mut report.servers[index];
            match result {
                Ok(port) => outcome.port = Some(port),
                Err(err) => {
                    outcome.fail(ServerPhase::Cutover, &err);
                    outcome.step = Some(err.step);
                    outcome.recovery = Some(err.recovery.clone());
                    errors.push(err.into());
                }
            }
        }
    }

    /// Apply `change` on every proxy concurrently; the store serializes
    /// writes per proxy host.
    async fn sync_proxies(
        &self,
        pool: &ConnectionPool,
        target: &DeployTarget,
        change: ProxyChange,
        errors: &mut Vec<DeployError>,
    ) -> Vec<ProxyOutcome> {
        let operation = change.operation();
        let mut outcomes: Vec<ProxyOutcome> = target
            .spec
            .proxies
            .iter()
            .map(|host| ProxyOutcome {
                host: host.clone(),
                operation,
                error: None,
            })
            .collect();
        let mut failures: Vec<(usize, ProxyStoreError)> = Vec::new();

        let mut tasks = JoinSet::new();
        let mut spawned: HashMap<Id, usize> = HashMap::new();
        for (index, host) in target.spec.proxies.iter().enumerate() {
            let conn = match pool.get(host) {
                Ok(conn) => conn,
                Err(err) => {
                    failures.push((index, err.into()));
                    continue;
                }
            };
            let store = Arc::clone(&self.proxy_store);
            let change = change.clone();
            let handle = tasks.spawn(async move {
                let result = match &change {
                    ProxyChange::Withdraw(name) => {
                        store.remove_application(conn.as_ref(), name).await
                    }
                    ProxyChange::Upsert(app) => store.upsert_application(conn.as_ref(), app).await,
                };
                (index, result)
            });
            spawned.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (_, Ok(())))) => {}
                Ok((_, (index, Err(err)))) => failures.push((index, err)),
                Err(err) => {
                    if let Some(&index) = spawned.get(&err.id()) {
                        failures.push((index, ProxyStoreError::Aborted(err.to_string())));
                    }
                }
            }
        }

        failures.sort_by_key(|(index, _)| *index);
        for (index, cause) in failures {
            let err = ProxySyncError {
                proxy: outcomes[index].host.clone(),
                app: target.app.name.clone(),
                operation,
                cause,
            };
            error!(proxy = %err.proxy, app = %err.app, %operation, error = %causal_chain(&err), "proxy sync failed");
            outcomes[index].error = Some(causal_chain(&err));
            errors.push(err.into());
        }
        outcomes
    }
}

fn task_failed(host: &str, app: &str, task: &'static str, err: &JoinError) -> DeployError {
    error!(host, app, task, error = %err, "host task did not complete");
    DeployError::TaskFailed {
        host: host.to_string(),
        app: app.to_string(),
        task,
        message: err.to_string(),
    }
}

/// Ensure the directory pair, mirror the scratch tree into staging, resolve
/// the published address and run the remote build if one is configured.
async fn stage_server(
    conn: &dyn Connection,
    host: &str,
    layout: &RemoteLayout,
    local: &Path,
    remote_build: Option<&RemoteCommand>,
) -> Result<String, (ServerPhase, TransportError)> {
    let stage = |e| (ServerPhase::Stage, e);
    conn.execute(&RemoteCommand::EnsureDirs {
        paths: vec![layout.staging_dir(), layout.current_dir()],
    })
    .await
    .map_err(stage)?;
    conn.sync_directory(local, &layout.staging_dir())
        .await
        .map_err(stage)?;

    let address = resolve_address(conn, host).await;

    if let Some(command) = remote_build {
        info!(host, app = layout.name(), "building remotely");
        conn.execute(command)
            .await
            .map_err(|e| (ServerPhase::Build, e))?;
    }
    Ok(address)
}
