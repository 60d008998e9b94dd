use super::handle::{Release, SharedHandle};
use crate::core::{AppError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::history::{
    HistoryConfig, HistoryStatus, RollbackOptions, RollbackReport, RunOptions, RunReport,
    UnitRunner,
};
use crate::interface::{AdapterFactory, AdapterHandle};
use crate::models::{BoundModel, ModelDefinition, ModelRegistry, ModelRuntime, Registration};
use crate::registry::config::AppConfig;
use crate::timeout::{TimeoutContext, with_timeout};
use crate::transaction::TransactionExecutor;
use crate::units::UnitKind;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{Instrument, Level, event, info_span};

/// Lifecycle of a [`ConnectionManager`].
///
/// ```text
/// Uninitialized ──initialize──> Initializing ──> Ready ──shutdown──> ShuttingDown ──> Shutdown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ManagerState::Uninitialized => "uninitialized",
            ManagerState::Initializing => "initializing",
            ManagerState::Ready => "ready",
            ManagerState::ShuttingDown => "shutting-down",
            ManagerState::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// Where a manager gets its adapter from.
#[derive(Clone)]
pub enum HandleSource {
    /// Open a fresh connection and own it.
    Connect(Arc<dyn AdapterFactory>),
    /// Reference another manager's connection.
    Share(Arc<SharedHandle>),
}

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub name: String,
    pub already_ready: bool,
    pub migrations: Option<RunReport>,
    pub seeds: Option<RunReport>,
    pub models: Vec<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReport {
    pub name: String,
    pub success: bool,
    pub reason: Option<String>,
    pub release: Option<Release>,
    pub duration: Duration,
}

struct Parts {
    handle: Arc<SharedHandle>,
    migrations: Option<UnitRunner>,
    seeds: Option<UnitRunner>,
    models: ModelRegistry,
    transactions: TransactionExecutor,
}

/// Steps that finished during initialization and must be undone if a later
/// step fails.
#[derive(Default)]
struct Completed {
    migrations: bool,
    seeds: bool,
    models: bool,
}

/// One app's connection and everything built on it.
pub struct ConnectionManager {
    name: String,
    config: AppConfig,
    source: HandleSource,
    runtime: Arc<dyn ModelRuntime>,
    events: EventBus,
    state: RwLock<ManagerState>,
    parts: RwLock<Option<Arc<Parts>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        name: impl Into<String>,
        config: AppConfig,
        source: HandleSource,
        runtime: Arc<dyn ModelRuntime>,
        events: EventBus,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            source,
            runtime,
            events,
            state: RwLock::new(ManagerState::Uninitialized),
            parts: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> ManagerState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(ManagerState::Shutdown)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ManagerState::Ready
    }

    fn set_state(&self, next: ManagerState) -> Result<()> {
        let mut state = self.state.write()?;
        event!(Level::DEBUG, connection = %self.name, from = %*state, to = %next, "state change");
        *state = next;
        Ok(())
    }

    fn parts(&self) -> Result<Arc<Parts>> {
        let state = self.state();
        if state != ManagerState::Ready {
            return Err(AppError::NotReady {
                name: self.name.clone(),
                state: state.to_string(),
            });
        }
        self.parts.read()?.clone().ok_or_else(|| AppError::NotReady {
            name: self.name.clone(),
            state: state.to_string(),
        })
    }

    pub async fn initialize(&self) -> Result<InitReport> {
        let span = info_span!("connection_initialize", connection = %self.name);
        self.initialize_inner().instrument(span).await
    }

    async fn initialize_inner(&self) -> Result<InitReport> {
        let _lifecycle = self.lifecycle.lock().await;
        let started = Instant::now();

        match self.state() {
            ManagerState::Ready => {
                return Ok(InitReport {
                    name: self.name.clone(),
                    already_ready: true,
                    ..InitReport::default()
                });
            }
            ManagerState::ShuttingDown | ManagerState::Shutdown => {
                return Err(AppError::Configuration(format!(
                    "connection '{}' has been shut down and cannot be initialized again",
                    self.name
                )));
            }
            ManagerState::Uninitialized | ManagerState::Initializing => {}
        }

        self.set_state(ManagerState::Initializing)?;
        let handle = match self.acquire().await {
            Ok(handle) => handle,
            Err(err) => {
                self.set_state(ManagerState::Uninitialized)?;
                return Err(err);
            }
        };

        let parts = Arc::new(self.build_parts(handle));
        *self.parts.write()? = Some(Arc::clone(&parts));
        self.set_state(ManagerState::Ready)?;
        event!(Level::INFO, connection = %self.name, "connection ready");

        let mut report = InitReport {
            name: self.name.clone(),
            ..InitReport::default()
        };
        let mut completed = Completed::default();
        if let Err(err) = self.auto_run(&parts, &mut report, &mut completed).await {
            self.undo_initialization(&parts, &completed, &err).await;
            drop(parts);
            if let Err(release_err) = self.release_parts().await {
                event!(Level::WARN, connection = %self.name, error = %release_err, "releasing connection after failed initialization failed");
            }
            self.set_state(ManagerState::Uninitialized)?;
            return Err(err);
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    async fn acquire(&self) -> Result<Arc<SharedHandle>> {
        match &self.source {
            HandleSource::Connect(factory) => {
                let config = &self.config.connection;
                let timeout_ms = config.connect_timeout_ms();
                let context = TimeoutContext::new("connect")
                    .detail("connection", self.name.clone())
                    .detail("url", config.to_url());
                let adapter = with_timeout(factory.connect(config), timeout_ms, context).await?;
                event!(Level::DEBUG, connection = %self.name, driver = adapter.driver(), "connection opened");
                Ok(SharedHandle::new(adapter, self.name.clone()))
            }
            HandleSource::Share(handle) => {
                let count = handle.attach(&self.name)?;
                event!(Level::DEBUG, connection = %self.name, owner = ?handle.owner(), references = count, "connection shared");
                Ok(Arc::clone(handle))
            }
        }
    }

    fn build_runner(&self, kind: UnitKind, history: &HistoryConfig, adapter: &AdapterHandle) -> UnitRunner {
        UnitRunner::new(kind, self.name.clone(), Arc::clone(adapter), Arc::clone(&history.source))
            .table(history.table_for(kind))
            .owner(history.owner.resolve(&self.name))
            .unit_timeout(history.unit_timeout_ms)
            .transactional(history.transactional)
            .events(self.events.clone())
    }

    fn build_parts(&self, handle: Arc<SharedHandle>) -> Parts {
        let adapter = handle.adapter();
        Parts {
            migrations: self
                .config
                .migrations
                .as_ref()
                .map(|h| self.build_runner(UnitKind::Migration, h, &adapter)),
            seeds: self
                .config
                .seeds
                .as_ref()
                .map(|h| self.build_runner(UnitKind::Seed, h, &adapter)),
            models: ModelRegistry::new(self.name.clone(), Arc::clone(&adapter), Arc::clone(&self.runtime)),
            transactions: TransactionExecutor::new(adapter),
            handle,
        }
    }

    async fn auto_run(&self, parts: &Parts, report: &mut InitReport, completed: &mut Completed) -> Result<()> {
        let app = self.name.clone();

        if let (Some(runner), Some(history)) = (&parts.migrations, &self.config.migrations) {
            if history.auto_run {
                self.events.emit(LifecycleEvent::AutoMigrationStarted { app: app.clone() });
                let run = runner.run(RunOptions::default()).await?;
                completed.migrations = run.batch.is_some();
                self.events.emit(LifecycleEvent::AutoMigrationCompleted {
                    app: app.clone(),
                    units: run.units.clone(),
                    batch: run.batch,
                });
                report.migrations = Some(run);
            }
        }

        if let (Some(runner), Some(history)) = (&parts.seeds, &self.config.seeds) {
            if history.auto_run {
                self.events.emit(LifecycleEvent::AutoSeedStarted { app: app.clone() });
                let run = runner.run(RunOptions::default()).await?;
                completed.seeds = run.batch.is_some();
                self.events.emit(LifecycleEvent::AutoSeedCompleted {
                    app: app.clone(),
                    units: run.units.clone(),
                    batch: run.batch,
                });
                report.seeds = Some(run);
            }
        }

        if self.config.auto_register_models && !self.config.models.is_empty() {
            self.events.emit(LifecycleEvent::AutoModelRegistrationStarted { app: app.clone() });
            let models = parts.models.register_all(self.config.models.clone())?;
            completed.models = true;
            self.events.emit(LifecycleEvent::AutoModelRegistrationCompleted {
                app,
                models: models.clone(),
            });
            report.models = models;
        }

        Ok(())
    }

    /// Undo completed auto steps in reverse order. Failures are collected,
    /// never raised.
    async fn undo_initialization(&self, parts: &Parts, completed: &Completed, cause: &AppError) {
        self.events.emit(LifecycleEvent::AppRollbackStarted {
            app: self.name.clone(),
            reason: cause.to_string(),
        });
        event!(Level::WARN, connection = %self.name, error = %cause, "initialization failed, rolling back");

        let mut errors = Vec::new();
        if completed.models {
            if let Err(err) = parts.models.clear() {
                errors.push(format!("models: {}", err));
            }
        }
        if completed.seeds {
            if let Some(runner) = &parts.seeds {
                collect_rollback(runner.rollback(RollbackOptions::default()).await, &mut errors);
            }
        }
        if completed.migrations {
            if let Some(runner) = &parts.migrations {
                collect_rollback(runner.rollback(RollbackOptions::default()).await, &mut errors);
            }
        }

        if errors.is_empty() {
            self.events.emit(LifecycleEvent::AppRollbackCompleted {
                app: self.name.clone(),
            });
        } else {
            event!(Level::ERROR, connection = %self.name, failures = errors.len(), "rollback incomplete");
            self.events.emit(LifecycleEvent::AppRollbackFailed {
                app: self.name.clone(),
                errors,
            });
        }
    }

    /// Tear down the built parts in reverse order and release the handle.
    /// `None` when nothing was built.
    async fn release_parts(&self) -> Result<Option<Release>> {
        let parts = self.parts.write()?.take();
        let Some(parts) = parts else {
            return Ok(None);
        };
        parts.models.clear()?;
        for runner in [&parts.seeds, &parts.migrations].into_iter().flatten() {
            runner.ledger().invalidate();
        }
        parts.handle.release(&self.name).await.map(Some)
    }

    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let span = info_span!("connection_shutdown", connection = %self.name);
        self.shutdown_inner().instrument(span).await
    }

    async fn shutdown_inner(&self) -> Result<ShutdownReport> {
        let _lifecycle = self.lifecycle.lock().await;
        let started = Instant::now();
        let mut report = ShutdownReport {
            name: self.name.clone(),
            success: true,
            reason: None,
            release: None,
            duration: Duration::ZERO,
        };

        if matches!(self.state(), ManagerState::ShuttingDown | ManagerState::Shutdown) {
            report.success = false;
            report.reason = Some("already-shutdown".into());
            return Ok(report);
        }

        self.set_state(ManagerState::ShuttingDown)?;
        match self.release_parts().await {
            Ok(release) => report.release = release,
            Err(err) => {
                event!(Level::WARN, connection = %self.name, error = %err, "releasing connection failed");
                report.success = false;
                report.reason = Some(err.to_string());
            }
        }

        self.set_state(ManagerState::Shutdown)?;
        report.duration = started.elapsed();
        event!(Level::INFO, connection = %self.name, success = report.success, "connection shut down");
        Ok(report)
    }

    fn runner<'a>(&self, parts: &'a Parts, kind: UnitKind) -> Result<&'a UnitRunner> {
        let runner = match kind {
            UnitKind::Migration => parts.migrations.as_ref(),
            UnitKind::Seed => parts.seeds.as_ref(),
        };
        runner.ok_or_else(|| {
            AppError::Configuration(format!("no {}s configured for '{}'", kind, self.name))
        })
    }

    pub async fn run_migrations(&self, options: RunOptions) -> Result<RunReport> {
        let parts = self.parts()?;
        self.runner(&parts, UnitKind::Migration)?.run(options).await
    }

    pub async fn rollback_migrations(&self, options: RollbackOptions) -> Result<RollbackReport> {
        let parts = self.parts()?;
        self.runner(&parts, UnitKind::Migration)?.rollback(options).await
    }

    pub async fn migration_status(&self) -> Result<HistoryStatus> {
        let parts = self.parts()?;
        self.runner(&parts, UnitKind::Migration)?.status().await
    }

    pub async fn run_seeds(&self, options: RunOptions) -> Result<RunReport> {
        let parts = self.parts()?;
        self.runner(&parts, UnitKind::Seed)?.run(options).await
    }

    pub async fn rollback_seeds(&self, options: RollbackOptions) -> Result<RollbackReport> {
        let parts = self.parts()?;
        self.runner(&parts, UnitKind::Seed)?.rollback(options).await
    }

    pub async fn seed_status(&self) -> Result<HistoryStatus> {
        let parts = self.parts()?;
        self.runner(&parts, UnitKind::Seed)?.status().await
    }

    pub fn register_model(&self, definition: ModelDefinition) -> Result<(Arc<BoundModel>, Registration)> {
        self.parts()?.models.register(definition)
    }

    pub fn replace_model(&self, definition: ModelDefinition) -> Result<(Arc<BoundModel>, Registration)> {
        self.parts()?.models.replace(definition)
    }

    pub fn model(&self, name: &str) -> Result<Option<Arc<BoundModel>>> {
        self.parts()?.models.get(name)
    }

    pub fn model_names(&self) -> Result<Vec<String>> {
        self.parts()?.models.names()
    }

    /// Run `work` inside a transaction on this app's connection.
    pub async fn transaction<F, Fut, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce(AdapterHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let parts = self.parts()?;
        parts.transactions.run(work).await
    }

    pub fn adapter(&self) -> Result<AdapterHandle> {
        Ok(self.parts()?.handle.adapter())
    }

    pub fn shared_handle(&self) -> Result<Arc<SharedHandle>> {
        Ok(Arc::clone(&self.parts()?.handle))
    }

    /// Whether this manager currently owns its connection.
    pub fn owns_handle(&self) -> bool {
        self.parts()
            .map(|p| p.handle.is_owned_by(&self.name))
            .unwrap_or(false)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn collect_rollback(result: Result<RollbackReport>, errors: &mut Vec<String>) {
    match result {
        Ok(report) => errors.extend(
            report
                .failed
                .into_iter()
                .map(|f| format!("{}: {}", f.name, f.error)),
        ),
        Err(err) => errors.push(err.to_string()),
    }
}
