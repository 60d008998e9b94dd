//! Forward runs, rollbacks and status for one unit kind on one connection.

use super::store::{DEFAULT_OWNER, HistoryRecord, Ledger};
use crate::core::{AppError, InvalidUnit, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::interface::AdapterHandle;
use crate::timeout::{TimeoutContext, with_timeout};
use crate::transaction::TransactionExecutor;
use crate::units::{UnitContext, UnitKind, UnitOfWork, UnitSource, validate};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Re-run every valid unit as a new batch and skip invalid ones.
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOptions {
    pub steps: u32,
    pub dry_run: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            steps: 1,
            dry_run: false,
        }
    }
}

impl RollbackOptions {
    pub fn steps(steps: u32) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub kind: UnitKind,
    pub owner: Option<String>,
    pub batch: Option<i64>,
    pub units: Vec<String>,
    pub skipped: Vec<String>,
    pub dry_run: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub kind: UnitKind,
    pub owner: Option<String>,
    pub rolled_back: Vec<String>,
    pub missing: Vec<String>,
    pub without_down: Vec<String>,
    pub failed: Vec<FailedUnit>,
    pub no_history: bool,
    pub dry_run: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStatus {
    pub kind: UnitKind,
    pub owner: Option<String>,
    pub executed: Vec<HistoryRecord>,
    pub pending: Vec<String>,
    #[serde(skip)]
    pub invalid: Vec<InvalidUnit>,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

/// Clears the running flag when dropped.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool, operation: String, target: &str) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AppError::AlreadyRunning {
                operation,
                target: target.to_string(),
            })?;
        Ok(Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Applies units of one kind and keeps the ledger in step.
///
/// With an owner, history is read and written for that owner only. Without
/// one the runner is in single-tenant mode: rows are written with
/// [`DEFAULT_OWNER`] and reads see every row.
pub struct UnitRunner {
    kind: UnitKind,
    connection: String,
    owner: Option<String>,
    adapter: AdapterHandle,
    ledger: Ledger,
    source: Arc<dyn UnitSource>,
    unit_timeout_ms: Option<u64>,
    transactions: Option<TransactionExecutor>,
    events: EventBus,
    running: AtomicBool,
}

impl UnitRunner {
    pub fn new(
        kind: UnitKind,
        connection: impl Into<String>,
        adapter: AdapterHandle,
        source: Arc<dyn UnitSource>,
    ) -> Self {
        let connection = connection.into();
        Self {
            kind,
            owner: Some(connection.clone()),
            connection,
            ledger: Ledger::new(Arc::clone(&adapter), kind.default_table()),
            adapter,
            source,
            unit_timeout_ms: None,
            transactions: None,
            events: EventBus::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.ledger = Ledger::new(Arc::clone(&self.adapter), table);
        self
    }

    pub fn owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    pub fn unit_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.unit_timeout_ms = timeout_ms;
        self
    }

    /// Run every unit step inside its own transaction.
    pub fn transactional(mut self, enabled: bool) -> Self {
        self.transactions = enabled.then(|| TransactionExecutor::new(Arc::clone(&self.adapter)));
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn write_owner(&self) -> &str {
        self.owner.as_deref().unwrap_or(DEFAULT_OWNER)
    }

    fn warn(&self, message: String) {
        event!(Level::WARN, kind = self.kind.label(), connection = %self.connection, "{}", message);
        self.events.emit(LifecycleEvent::warning(
            format!("{}:{}", self.kind, self.connection),
            message,
        ));
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunReport> {
        let _guard = RunGuard::acquire(
            &self.running,
            format!("{} run", self.kind),
            &self.connection,
        )?;
        let span = info_span!(
            "unit_run",
            kind = self.kind.label(),
            connection = %self.connection,
            owner = self.write_owner(),
            force = options.force,
            dry_run = options.dry_run
        );
        self.run_inner(options).instrument(span).await
    }

    async fn run_inner(&self, options: RunOptions) -> Result<RunReport> {
        let started = Instant::now();
        self.ledger.ensure().await?;

        let (valid, invalid) = validate(self.source.list().await?);
        if !invalid.is_empty() {
            if !options.force {
                return Err(AppError::Validation {
                    kind: self.kind.label().to_string(),
                    failures: invalid,
                });
            }
            for unit in &invalid {
                self.warn(format!("skipping invalid {} {}", self.kind, unit));
            }
        }
        let skipped: Vec<String> = invalid.into_iter().map(|u| u.name).collect();

        let scope = self.owner.as_deref();
        let pending: Vec<Arc<dyn UnitOfWork>> = if options.force {
            valid
        } else {
            let executed: HashSet<String> =
                self.ledger.executed_names(scope).await?.into_iter().collect();
            valid
                .into_iter()
                .filter(|unit| !executed.contains(unit.name()))
                .collect()
        };

        let mut report = RunReport {
            kind: self.kind,
            owner: self.owner.clone(),
            batch: None,
            units: Vec::new(),
            skipped,
            dry_run: options.dry_run,
            duration: Duration::ZERO,
        };

        if pending.is_empty() {
            event!(Level::DEBUG, "nothing to run");
            report.duration = started.elapsed();
            return Ok(report);
        }

        let batch = self.ledger.next_batch(scope).await?;
        report.batch = Some(batch);

        if options.dry_run {
            report.units = pending.iter().map(|u| u.name().to_string()).collect();
            report.duration = started.elapsed();
            return Ok(report);
        }

        let ctx = UnitContext {
            adapter: Arc::clone(&self.adapter),
            kind: self.kind,
            owner: self.write_owner().to_string(),
            batch,
        };

        for unit in &pending {
            let name = unit.name().to_string();
            if let Err(err) = self.apply(unit, &ctx, Direction::Up).await {
                event!(Level::ERROR, unit = %name, error = %err, "unit failed, stopping batch");
                return Err(AppError::UnitOfWork {
                    kind: self.kind.label().to_string(),
                    name,
                    source: Box::new(err),
                });
            }
            self.ledger.record(&name, batch, &ctx.owner).await?;
            event!(Level::INFO, unit = %name, batch, "unit applied");
            report.units.push(name);
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    pub async fn rollback(&self, options: RollbackOptions) -> Result<RollbackReport> {
        if options.steps == 0 {
            return Err(AppError::Configuration(
                "rollback steps must be at least 1".into(),
            ));
        }
        let _guard = RunGuard::acquire(
            &self.running,
            format!("{} rollback", self.kind),
            &self.connection,
        )?;
        let span = info_span!(
            "unit_rollback",
            kind = self.kind.label(),
            connection = %self.connection,
            owner = self.write_owner(),
            steps = options.steps,
            dry_run = options.dry_run
        );
        self.rollback_inner(options).instrument(span).await
    }

    async fn rollback_inner(&self, options: RollbackOptions) -> Result<RollbackReport> {
        let started = Instant::now();
        self.ledger.ensure().await?;

        let mut report = RollbackReport {
            kind: self.kind,
            owner: self.owner.clone(),
            rolled_back: Vec::new(),
            missing: Vec::new(),
            without_down: Vec::new(),
            failed: Vec::new(),
            no_history: false,
            dry_run: options.dry_run,
            duration: Duration::ZERO,
        };

        let scope = self.owner.as_deref();
        let Some(max_batch) = self.ledger.max_batch(scope).await? else {
            event!(Level::DEBUG, "no history to roll back");
            report.no_history = true;
            report.duration = started.elapsed();
            return Ok(report);
        };

        let target = (max_batch - i64::from(options.steps) + 1).max(1);
        let records = self.ledger.records_from_batch(target, scope).await?;

        if options.dry_run {
            report.rolled_back = records.into_iter().map(|r| r.name).collect();
            report.duration = started.elapsed();
            return Ok(report);
        }

        let units: HashMap<String, Arc<dyn UnitOfWork>> = match self.source.list().await {
            Ok(listed) => validate(listed)
                .0
                .into_iter()
                .map(|unit| (unit.name().to_string(), unit))
                .collect(),
            Err(err) => {
                self.warn(format!(
                    "cannot list {}: {}; treating every unit as missing",
                    self.source.describe(),
                    err
                ));
                HashMap::new()
            }
        };

        for record in records {
            match units.get(&record.name) {
                None => {
                    self.warn(format!(
                        "{} '{}' (batch {}) is missing; removing its history",
                        self.kind, record.name, record.batch
                    ));
                    report.missing.push(record.name.clone());
                }
                Some(unit) if !unit.has_down() => {
                    self.warn(format!(
                        "{} '{}' has no down step; removing its history",
                        self.kind, record.name
                    ));
                    report.without_down.push(record.name.clone());
                }
                Some(unit) => {
                    let ctx = UnitContext {
                        adapter: Arc::clone(&self.adapter),
                        kind: self.kind,
                        owner: record.owner.clone(),
                        batch: record.batch,
                    };
                    if let Err(err) = self.apply(unit, &ctx, Direction::Down).await {
                        self.warn(format!(
                            "rolling back {} '{}' failed: {}",
                            self.kind, record.name, err
                        ));
                        report.failed.push(FailedUnit {
                            name: record.name.clone(),
                            error: err.to_string(),
                        });
                        continue;
                    }
                }
            }

            if let Err(err) = self.ledger.remove(&record).await {
                self.warn(format!(
                    "removing history of {} '{}' failed: {}",
                    self.kind, record.name, err
                ));
                report.failed.push(FailedUnit {
                    name: record.name.clone(),
                    error: err.to_string(),
                });
                continue;
            }
            event!(Level::INFO, unit = %record.name, batch = record.batch, "unit rolled back");
            report.rolled_back.push(record.name);
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    pub async fn status(&self) -> Result<HistoryStatus> {
        self.ledger.ensure().await?;
        let executed = self.ledger.records(self.owner.as_deref()).await?;
        let done: HashSet<&str> = executed.iter().map(|r| r.name.as_str()).collect();

        let (valid, invalid) = validate(self.source.list().await?);
        let pending = valid
            .iter()
            .map(|u| u.name())
            .filter(|name| !done.contains(name))
            .map(str::to_string)
            .collect();

        Ok(HistoryStatus {
            kind: self.kind,
            owner: self.owner.clone(),
            executed,
            pending,
            invalid,
        })
    }

    async fn apply(
        &self,
        unit: &Arc<dyn UnitOfWork>,
        ctx: &UnitContext,
        direction: Direction,
    ) -> Result<()> {
        let step = async {
            match &self.transactions {
                Some(executor) => {
                    executor
                        .run(|_| async move { invoke(unit.as_ref(), ctx, direction).await })
                        .await
                }
                None => invoke(unit.as_ref(), ctx, direction).await,
            }
        };

        match self.unit_timeout_ms {
            Some(timeout_ms) => {
                let context = TimeoutContext::new(format!("{} {}", self.kind, unit.name()))
                    .detail("connection", self.connection.clone())
                    .detail("batch", ctx.batch);
                with_timeout(step, timeout_ms, context).await
            }
            None => step.await,
        }
    }
}

async fn invoke(unit: &dyn UnitOfWork, ctx: &UnitContext, direction: Direction) -> Result<()> {
    match direction {
        Direction::Up => unit.up(ctx).await,
        Direction::Down => unit.down(ctx).await,
    }
}
