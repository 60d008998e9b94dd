mod common;

use common::*;
use dbtenant::connection::HandleSource;
use dbtenant::core::{Column, DataType, TableSchema};
use dbtenant::prelude::*;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn manager(name: &str, config: AppConfig) -> ConnectionManager {
    ConnectionManager::new(
        name,
        config,
        HandleSource::Connect(Arc::new(MemoryAdapterFactory::new())),
        Arc::new(BasicModelRuntime),
        EventBus::new(),
    )
}

#[tokio::test]
async fn test_state_machine() {
    let manager = manager("app", AppConfig::new(ConnectionConfig::memory("app")));
    assert_eq!(manager.state(), ManagerState::Uninitialized);
    assert_eq!(manager.adapter().err().map(|e| e.kind()), Some(ErrorKind::NotReady));

    let report = assert_ok!(manager.initialize().await);
    assert!(!report.already_ready);
    assert_eq!(manager.state(), ManagerState::Ready);

    let again = assert_ok!(manager.initialize().await);
    assert!(again.already_ready);

    let shutdown = assert_ok!(manager.shutdown().await);
    assert!(shutdown.success);
    assert_eq!(manager.state(), ManagerState::Shutdown);

    let twice = assert_ok!(manager.shutdown().await);
    assert!(!twice.success);
    assert_eq!(twice.reason.as_deref(), Some("already-shutdown"));

    let err = assert_err!(manager.initialize().await);
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_connect_failure_leaves_manager_uninitialized() {
    let manager = manager("pg", AppConfig::new(ConnectionConfig::new("postgres", "app")));
    let err = assert_err!(manager.initialize().await);
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(manager.state(), ManagerState::Uninitialized);

    let health = manager.health_check(&HealthProbe::default()).await;
    assert_eq!(health.status, HealthStatus::Unknown);
}

#[tokio::test]
async fn test_unconfigured_history_is_a_configuration_error() {
    let manager = manager("app", AppConfig::default());
    manager.initialize().await.unwrap();

    let err = assert_err!(manager.run_seeds(RunOptions::default()).await);
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_manual_runs_and_named_owner() {
    let log = StepLog::new();
    let config = AppConfig::default()
        .migrations(
            HistoryConfig::new(unit_set("m", vec![logged_unit("001", &log)]))
                .table("tenant_migrations")
                .owner(OwnerScope::Named("tenant-7".into())),
        );
    let manager = manager("app", config);
    manager.initialize().await.unwrap();

    let report = manager.run_migrations(RunOptions::default()).await.unwrap();
    assert_eq!(report.owner.as_deref(), Some("tenant-7"));

    let status = manager.migration_status().await.unwrap();
    assert_eq!(status.executed[0].owner, "tenant-7");
    assert!(manager.adapter().unwrap().has_table("tenant_migrations").await.unwrap());

    let rollback = manager
        .rollback_migrations(RollbackOptions::default())
        .await
        .unwrap();
    assert_eq!(rollback.rolled_back, vec!["001"]);
}

#[tokio::test]
async fn test_transactions_through_manager() {
    let manager = manager("app", AppConfig::default());
    manager.initialize().await.unwrap();
    let adapter = manager.adapter().unwrap();
    adapter
        .create_table(TableSchema::new("notes").column(Column::new("body", DataType::Text)))
        .await
        .unwrap();

    let note = || Record::from([("body".to_string(), Value::from("hi"))]);
    manager
        .transaction(|db| async move { db.insert("notes", note()).await.map(|_| ()) })
        .await
        .unwrap();
    let failed = manager
        .transaction(|db| async move {
            db.insert("notes", note()).await?;
            Err::<(), _>(AppError::Model("nope".into()))
        })
        .await;
    assert!(failed.is_err());

    assert_eq!(adapter.select("notes", &Filter::all()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_model_registration_rules() {
    let manager = manager("app", AppConfig::default());
    manager.initialize().await.unwrap();

    let (_, fresh) = manager.register_model(ModelDefinition::new("User")).unwrap();
    assert_eq!(fresh, Registration::Fresh);
    assert_eq!(
        assert_err!(manager.register_model(ModelDefinition::new("User"))).kind(),
        ErrorKind::AlreadyRegistered
    );

    manager
        .register_model(ModelDefinition::new("Tag").shared().computed("slug"))
        .unwrap();
    let (merged, how) = manager
        .register_model(ModelDefinition::new("Tag").shared().computed("count"))
        .unwrap();
    assert_eq!(how, Registration::Merge);
    assert_eq!(merged.definition.computed, vec!["slug", "count"]);

    let (_, how) = manager
        .replace_model(ModelDefinition::new("Tag").shared())
        .unwrap();
    assert_eq!(how, Registration::Replace);
    assert!(manager.model("Tag").unwrap().unwrap().definition.computed.is_empty());
    assert!(manager.model("Missing").unwrap().is_none());
}

#[tokio::test]
async fn test_shutdown_clears_models_and_ledger_cache() {
    let log = StepLog::new();
    let manager = manager(
        "app",
        AppConfig::default()
            .migrations(HistoryConfig::new(unit_set("m", vec![logged_unit("001", &log)])).auto_run(true))
            .model(ModelDefinition::new("User")),
    );
    let report = manager.initialize().await.unwrap();
    assert_eq!(report.models, vec!["User"]);
    assert_eq!(report.migrations.unwrap().units, vec!["001"]);

    let adapter = manager.adapter().unwrap();
    let shutdown = manager.shutdown().await.unwrap();
    assert_eq!(shutdown.release, Some(Release::Destroyed));
    assert!(adapter.ping().await.is_err());
}

#[tokio::test]
async fn test_failed_auto_run_releases_connection() {
    let log = StepLog::new();
    let factory = Arc::new(MemoryAdapterFactory::new());
    let manager = ConnectionManager::new(
        "shop",
        AppConfig::new(ConnectionConfig::memory("shop"))
            .migrations(HistoryConfig::new(unit_set("m", vec![logged_unit("001_users", &log)])).auto_run(true))
            .seeds(HistoryConfig::new(unit_set("s", vec![failing_unit("001_admin")])).auto_run(true)),
        HandleSource::Connect(factory.clone()),
        Arc::new(BasicModelRuntime),
        EventBus::new(),
    );

    let err = assert_err!(manager.initialize().await);
    assert_eq!(err.kind(), ErrorKind::UnitOfWork);
    assert_eq!(manager.state(), ManagerState::Uninitialized);
    assert_eq!(log.entries(), vec!["up:001_users", "down:001_users"]);

    let first = factory.adapter_for("shop").unwrap().unwrap();
    assert!(first.is_destroyed());
    assert_eq!(
        manager.migration_status().await.err().map(|e| e.kind()),
        Some(ErrorKind::NotReady)
    );

    // a retry connects again and fails again instead of reporting ready
    let again = assert_err!(manager.initialize().await);
    assert_eq!(again.kind(), ErrorKind::UnitOfWork);
    assert_eq!(factory.created().unwrap().len(), 2);
    assert_eq!(manager.state(), ManagerState::Uninitialized);

    let shutdown = assert_ok!(manager.shutdown().await);
    assert!(shutdown.success);
    assert_eq!(shutdown.release, None);
}

/// Remembers the settings each connect was asked for.
#[derive(Default)]
struct RecordingFactory {
    inner: MemoryAdapterFactory,
    seen: Mutex<Vec<ConnectionConfig>>,
}

#[async_trait]
impl AdapterFactory for RecordingFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<AdapterHandle> {
        self.seen.lock().unwrap().push(config.clone());
        self.inner.connect(config).await
    }
}

#[tokio::test]
async fn test_pool_settings_reach_the_factory() {
    let factory = Arc::new(RecordingFactory::default());
    let connection = ConnectionConfig::memory("pooled")
        .max_connections(25)
        .min_connections(5)
        .query_timeout(Duration::from_secs(3))
        .idle_timeout(Duration::from_secs(60));
    let manager = ConnectionManager::new(
        "pooled",
        AppConfig::new(connection.clone()),
        HandleSource::Connect(factory.clone()),
        Arc::new(BasicModelRuntime),
        EventBus::new(),
    );
    manager.initialize().await.unwrap();

    let seen = factory.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![connection]);
    assert_eq!(seen[0].max_connections, 25);
    assert_eq!(seen[0].query_timeout, Some(Duration::from_secs(3)));
}
