mod common;

use common::*;
use dbtenant::core::{Column, DataType, Filter, Record, TableSchema};
use dbtenant::history::{DEFAULT_OWNER, UnitRunner};
use dbtenant::prelude::*;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn three_units(log: &StepLog) -> Arc<UnitSet> {
    unit_set(
        "migrations",
        vec![
            logged_unit("u1", log),
            logged_unit("u2", log),
            logged_unit("u3", log),
        ],
    )
}

fn runner(owner: &str, adapter: &AdapterHandle, source: Arc<UnitSet>) -> UnitRunner {
    UnitRunner::new(UnitKind::Migration, owner, Arc::clone(adapter), source)
}

async fn ledger_rows(adapter: &AdapterHandle) -> Vec<Record> {
    adapter
        .select("schema_migrations", &Filter::all())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_rerun_is_noop_and_force_starts_new_batch() {
    let (_, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let runner = runner("a", &adapter, three_units(&log));

    let first = runner.run(RunOptions::default()).await.unwrap();
    assert_eq!(first.units, vec!["u1", "u2", "u3"]);
    assert_eq!(first.batch, Some(1));

    let again = runner.run(RunOptions::default()).await.unwrap();
    assert!(again.units.is_empty());
    assert_eq!(again.batch, None);

    let forced = runner
        .run(RunOptions {
            force: true,
            ..RunOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(forced.units, vec!["u1", "u2", "u3"]);
    assert_eq!(forced.batch, Some(2));
    assert_eq!(log.count("up:u1"), 2);
}

#[tokio::test]
async fn test_two_owners_share_one_ledger() {
    let (memory, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let source = three_units(&log);
    let a = runner("a", &adapter, Arc::clone(&source));
    let b = runner("b", &adapter, source);

    a.run(RunOptions::default()).await.unwrap();
    b.run(RunOptions::default()).await.unwrap();
    assert_eq!(memory.row_count("schema_migrations").await.unwrap(), 6);

    let report = a.rollback(RollbackOptions::default()).await.unwrap();
    assert_eq!(report.rolled_back, vec!["u3", "u2", "u1"]);

    let rows = ledger_rows(&adapter).await;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r["owner"] == Value::from("b")));
    assert_eq!(log.count("down:u1"), 1);
}

#[tokio::test]
async fn test_batches_are_independent_per_owner() {
    let (_, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let source = three_units(&log);
    let a = runner("a", &adapter, Arc::clone(&source));
    let b = runner("b", &adapter, source);

    let forced = RunOptions {
        force: true,
        dry_run: false,
    };
    assert_eq!(a.run(forced).await.unwrap().batch, Some(1));
    assert_eq!(a.run(forced).await.unwrap().batch, Some(2));
    assert_eq!(b.run(forced).await.unwrap().batch, Some(1));

    let status = a.status().await.unwrap();
    let mut batches: Vec<i64> = status.executed.iter().map(|r| r.batch).collect();
    batches.dedup();
    assert_eq!(batches, vec![1, 2]);
}

#[tokio::test]
async fn test_legacy_ledger_is_upgraded_in_place() {
    let (_, adapter) = memory_adapter("db");
    adapter
        .create_table(
            TableSchema::new("schema_migrations")
                .column(Column::new("id", DataType::Integer).increments())
                .column(Column::new("name", DataType::Text).not_null())
                .column(Column::new("batch", DataType::Integer).not_null())
                .column(Column::new("executed_at", DataType::Timestamp).default_now()),
        )
        .await
        .unwrap();
    adapter
        .insert(
            "schema_migrations",
            Record::from([
                ("name".to_string(), Value::from("000_legacy")),
                ("batch".to_string(), Value::from(1)),
            ]),
        )
        .await
        .unwrap();

    let log = StepLog::new();
    let runner = runner("app", &adapter, unit_set("m", vec![logged_unit("001", &log)]));
    let report = runner.run(RunOptions::default()).await.unwrap();
    assert_eq!(report.units, vec!["001"]);
    assert_eq!(report.batch, Some(1));

    assert!(adapter.has_column("schema_migrations", "owner").await.unwrap());
    let rows = ledger_rows(&adapter).await;
    let owners: Vec<(String, String)> = rows
        .iter()
        .map(|r| (r["name"].to_string(), r["owner"].to_string()))
        .collect();
    assert_eq!(
        owners,
        vec![
            ("000_legacy".to_string(), "default".to_string()),
            ("001".to_string(), "app".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_invalid_units_block_run_unless_forced() {
    let (memory, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let source = unit_set(
        "m",
        vec![
            logged_unit("001", &log),
            logged_unit("002", &log),
            logged_unit("002", &log),
        ],
    );
    source.push_broken("003", "cannot be loaded");
    let runner = runner("a", &adapter, source);

    let err = runner.run(RunOptions::default()).await.unwrap_err();
    match &err {
        AppError::Validation { failures, .. } => {
            let names: Vec<_> = failures.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, vec!["002", "002", "003"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(log.entries().is_empty());
    assert_eq!(memory.row_count("schema_migrations").await.unwrap(), 0);

    let forced = runner
        .run(RunOptions {
            force: true,
            dry_run: false,
        })
        .await
        .unwrap();
    assert_eq!(forced.units, vec!["001"]);
    assert_eq!(forced.skipped, vec!["002", "002", "003"]);
}

#[tokio::test]
async fn test_failure_stops_batch_and_keeps_earlier_successes() {
    let (_, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let source = unit_set(
        "m",
        vec![
            logged_unit("001", &log),
            failing_unit("002"),
            logged_unit("003", &log),
        ],
    );
    let runner = runner("a", &adapter, source);

    let err = runner.run(RunOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnitOfWork);
    assert_eq!(err.unit_name(), Some("002"));
    assert_eq!(log.entries(), vec!["up:001"]);

    let status = runner.status().await.unwrap();
    assert_eq!(status.executed.len(), 1);
    assert_eq!(status.pending, vec!["002", "003"]);
}

#[tokio::test]
async fn test_rollback_tolerates_missing_and_failing_units() {
    let (_, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let source = unit_set(
        "m",
        vec![
            logged_unit("001", &log),
            FnUnit::new("002", |_| async { Ok(()) }),
            FnUnit::new("003", |_| async { Ok(()) })
                .with_down(|_| async { Err::<(), _>(AppError::Adapter("down failed".into())) }),
            logged_unit("004", &log),
        ],
    );
    let runner = runner("a", &adapter, Arc::clone(&source));
    runner.run(RunOptions::default()).await.unwrap();
    assert!(source.remove("004"));

    let report = runner.rollback(RollbackOptions::default()).await.unwrap();
    assert_eq!(report.rolled_back, vec!["004", "002", "001"]);
    assert_eq!(report.missing, vec!["004"]);
    assert_eq!(report.without_down, vec!["002"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "003");

    let remaining: Vec<_> = runner
        .status()
        .await
        .unwrap()
        .executed
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(remaining, vec!["003"]);
    assert_eq!(log.count("down:001"), 1);
    assert_eq!(log.count("down:004"), 0);
}

#[tokio::test]
async fn test_rollback_continues_when_history_cannot_be_removed() {
    let (_, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let source = unit_set(
        "m",
        vec![
            logged_unit("001", &log),
            FnUnit::new("002", |_| async { Ok(()) }).with_down(|ctx: UnitContext| async move {
                ctx.adapter.execute("DROP TABLE schema_migrations").await.map(|_| ())
            }),
        ],
    );
    let runner = runner("a", &adapter, source);
    runner.run(RunOptions::default()).await.unwrap();

    let report = runner.rollback(RollbackOptions::default()).await.unwrap();
    assert!(report.rolled_back.is_empty());
    let failed: Vec<_> = report.failed.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(failed, vec!["002", "001"]);
    assert_eq!(log.count("down:001"), 1);
    assert!(!runner.is_running());
}

#[tokio::test]
async fn test_rollback_steps_and_edge_cases() {
    let (_, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let source = unit_set("m", vec![logged_unit("001", &log)]);
    let runner = runner("a", &adapter, Arc::clone(&source));

    let empty = runner.rollback(RollbackOptions::default()).await.unwrap();
    assert!(empty.no_history);

    let err = runner.rollback(RollbackOptions::steps(0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    runner.run(RunOptions::default()).await.unwrap();
    source.push(Arc::new(logged_unit("002", &log)));
    runner.run(RunOptions::default()).await.unwrap();
    source.push(Arc::new(logged_unit("003", &log)));
    runner.run(RunOptions::default()).await.unwrap();

    let preview = runner
        .rollback(RollbackOptions {
            steps: 2,
            dry_run: true,
        })
        .await
        .unwrap();
    assert_eq!(preview.rolled_back, vec!["003", "002"]);
    assert_eq!(runner.status().await.unwrap().executed.len(), 3);

    let report = runner.rollback(RollbackOptions::steps(10)).await.unwrap();
    assert_eq!(report.rolled_back, vec!["003", "002", "001"]);
    assert!(runner.status().await.unwrap().executed.is_empty());
}

#[tokio::test]
async fn test_dry_run_executes_nothing() {
    let (memory, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let runner = runner("a", &adapter, three_units(&log));

    let report = runner
        .run(RunOptions {
            force: false,
            dry_run: true,
        })
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.units, vec!["u1", "u2", "u3"]);
    assert!(log.entries().is_empty());
    assert_eq!(memory.row_count("schema_migrations").await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_runs_are_rejected() {
    let (_, adapter) = memory_adapter("db");
    let source = unit_set("m", vec![slow_unit("001", Duration::from_millis(100))]);
    let runner = runner("a", &adapter, source);

    let (first, second) = tokio::join!(
        runner.run(RunOptions::default()),
        runner.rollback(RollbackOptions::default())
    );
    assert_eq!(first.unwrap().units, vec!["001"]);
    assert_eq!(second.unwrap_err().kind(), ErrorKind::AlreadyRunning);
    assert!(!runner.is_running());
}

#[tokio::test]
async fn test_global_scope_writes_default_owner() {
    let (_, adapter) = memory_adapter("db");
    let log = StepLog::new();
    let runner = runner("a", &adapter, three_units(&log)).owner(None);

    runner.run(RunOptions::default()).await.unwrap();
    let rows = ledger_rows(&adapter).await;
    assert!(rows.iter().all(|r| r["owner"] == Value::from(DEFAULT_OWNER)));
}

#[tokio::test]
async fn test_unit_timeout_surfaces_as_unit_failure() {
    let (_, adapter) = memory_adapter("db");
    let source = unit_set("m", vec![slow_unit("001", Duration::from_millis(500))]);
    let runner = runner("a", &adapter, source).unit_timeout(Some(50));

    let err = runner.run(RunOptions::default()).await.unwrap_err();
    match err {
        AppError::UnitOfWork { name, source, .. } => {
            assert_eq!(name, "001");
            assert_eq!(source.timeout_ms(), Some(50));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_transactional_units_roll_back_their_writes() {
    let (memory, adapter) = memory_adapter("db");
    adapter
        .create_table(TableSchema::new("items").column(Column::new("label", DataType::Text)))
        .await
        .unwrap();
    let source = unit_set(
        "m",
        vec![FnUnit::new("001", |ctx| async move {
            ctx.adapter
                .insert("items", Record::from([("label".to_string(), Value::from("x"))]))
                .await?;
            Err::<(), _>(AppError::Adapter("abort after write".into()))
        })],
    );
    let runner = runner("a", &adapter, source).transactional(true);

    assert!(runner.run(RunOptions::default()).await.is_err());
    assert_eq!(memory.row_count("items").await.unwrap(), 0);
}

#[tokio::test]
async fn test_sql_directory_migrations() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("001_users.sql"),
        "-- migrate:up\nCREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT NOT NULL);\n-- migrate:down\nDROP TABLE users;\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("002_seed_admin.sql"),
        "INSERT INTO users (name) VALUES ('admin');",
    )
    .unwrap();

    let (memory, adapter) = memory_adapter("db");
    let runner = UnitRunner::new(
        UnitKind::Migration,
        "app",
        Arc::clone(&adapter),
        Arc::new(DirectorySource::new(dir.path())),
    )
    .table("app_migrations");

    let report = runner.run(RunOptions::default()).await.unwrap();
    assert_eq!(report.units, vec!["001_users", "002_seed_admin"]);
    assert_eq!(memory.row_count("users").await.unwrap(), 1);
    assert_eq!(memory.row_count("app_migrations").await.unwrap(), 2);

    let rollback = runner.rollback(RollbackOptions::default()).await.unwrap();
    assert_eq!(rollback.without_down, vec!["002_seed_admin"]);
    assert!(!adapter.has_table("users").await.unwrap());
}
