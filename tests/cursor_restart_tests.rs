//! Keyset restart and deferred reads against a real SQLite database.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use sqldevice::config::DeviceConfig;
use sqldevice::device::{CapabilityProfile, NullOrdering};
use sqldevice::driver::any::AnyDriver;
use sqldevice::driver::{Driver, DriverCommand};
use sqldevice::models::enums::{CursorType, DatabaseType, IsolationLevel};
use sqldevice::query_ast::{ColumnDef, Expr, LogicalQueryPlan, SortColumn, TableVar};
use sqldevice::scalar_types::ScalarType;
use sqldevice::session::{DeviceError, DeviceSession};
use sqldevice::value::{Row, Value};

struct TempDatabase {
    url: String,
    path: PathBuf,
}

impl TempDatabase {
    async fn create(name: &str, statements: &[&str]) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let path = std::env::temp_dir().join(format!("sqldevice_{}_{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let mut connection = AnyDriver::new().connect(&url).await.unwrap();
        for statement in statements {
            connection.execute(&DriverCommand::new(*statement)).await.unwrap();
        }
        connection.close().await.unwrap();
        Self { url, path }
    }

    fn config(&self, max_execute: usize, batch_size: usize) -> DeviceConfig {
        DeviceConfig {
            dialect: Some(DatabaseType::SQLite),
            max_execute_connections: max_execute,
            batch_size,
            ..DeviceConfig::new(self.url.clone())
        }
    }
}

impl Drop for TempDatabase {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

const PAIRS: &[&str] = &[
    "CREATE TABLE Pairs (A INTEGER, B INTEGER NOT NULL, Label TEXT)",
    "INSERT INTO Pairs VALUES (3, 2, 'c2'), (1, 1, 'a1'), (NULL, 2, 'n2'), (2, 1, 'b1'), (1, 3, 'a3')",
    "INSERT INTO Pairs VALUES (3, 1, 'c1'), (NULL, 1, 'n1'), (1, 2, 'a2'), (4, 1, 'd1'), (3, 3, 'c3')",
];

fn pairs(sort: Vec<SortColumn>) -> LogicalQueryPlan {
    LogicalQueryPlan::retrieve(TableVar::new(
        "Pairs",
        vec![
            ColumnDef::new("A", ScalarType::Integer),
            ColumnDef::new("B", ScalarType::Integer).not_null(),
            ColumnDef::new("Label", ScalarType::String),
        ],
    ))
    .order(sort)
}

fn labels(rows: &[Row]) -> Vec<String> {
    rows.iter().map(|r| r[2].as_str().unwrap_or_default().to_string()).collect()
}

const ASCENDING: &[&str] = &["n1", "n2", "a1", "a2", "a3", "b1", "c1", "c2", "c3", "d1"];

/// Reads two cursors over `plan` in lock step, so each fetch takes the single
/// execute connection away from the other cursor.
async fn interleaved(session: &mut DeviceSession, plan: &LogicalQueryPlan) -> (Vec<Row>, Vec<Row>) {
    let a = session.open_cursor(plan, HashMap::new(), CursorType::Dynamic, IsolationLevel::CursorStability).await.unwrap();
    let b = session.open_cursor(plan, HashMap::new(), CursorType::Dynamic, IsolationLevel::CursorStability).await.unwrap();
    let (mut rows_a, mut rows_b) = (Vec::new(), Vec::new());
    loop {
        let next_a = session.next(a).await.unwrap();
        let next_b = session.next(b).await.unwrap();
        session.check_pool_invariants().unwrap();
        if next_a.is_none() && next_b.is_none() {
            break;
        }
        rows_a.extend(next_a);
        rows_b.extend(next_b);
    }
    (rows_a, rows_b)
}

#[tokio::test]
async fn restart_handles_ties_and_nulls() {
    let db = TempDatabase::create("ties", PAIRS).await;
    let plan = pairs(vec![SortColumn::asc("A"), SortColumn::asc("B")]);

    let mut session = DeviceSession::from_config(db.config(1, 1));
    let (a, b) = interleaved(&mut session, &plan).await;
    assert_eq!(labels(&a), ASCENDING);
    assert_eq!(labels(&b), ASCENDING);
    assert!(a[0][0].is_null());
    session.close().await.unwrap();
}

#[tokio::test]
async fn restart_with_larger_batches_and_literal_keys() {
    let db = TempDatabase::create("literals", PAIRS).await;
    let plan = pairs(vec![SortColumn::asc("A"), SortColumn::asc("B")]);

    let mut config = db.config(1, 3);
    config.use_parameters_for_cursors = false;
    let mut session = DeviceSession::from_config(config);
    let (a, b) = interleaved(&mut session, &plan).await;
    assert_eq!(labels(&a), ASCENDING);
    assert_eq!(labels(&b), ASCENDING);
    session.close().await.unwrap();
}

#[tokio::test]
async fn descending_restart_keeps_nulls_last() {
    let db = TempDatabase::create("descending", PAIRS).await;
    let plan = pairs(vec![SortColumn::desc("A"), SortColumn::desc("B")]);

    let mut session = DeviceSession::from_config(db.config(1, 2));
    let (a, _) = interleaved(&mut session, &plan).await;
    let mut expected: Vec<&str> = ASCENDING.to_vec();
    expected.reverse();
    assert_eq!(labels(&a), expected);
    session.close().await.unwrap();
}

const NULLS_LAST: &[&str] = &["a1", "a2", "a3", "b1", "c1", "c2", "c3", "d1", "n1", "n2"];

/// Lock-step read of `sort` over the pairs table under `profile`, one row per
/// fetch so every fetch restarts.
async fn restarted_under(name: &str, profile: CapabilityProfile, sort: Vec<SortColumn>) -> (Vec<String>, Vec<String>) {
    let db = TempDatabase::create(name, PAIRS).await;
    let mut config = db.config(1, 1);
    config.profile = Some(profile);
    let mut session = DeviceSession::from_config(config);
    let (a, b) = interleaved(&mut session, &pairs(sort)).await;
    session.close().await.unwrap();
    (labels(&a), labels(&b))
}

#[tokio::test]
async fn unspecified_null_ordering_restarts_past_the_null_group() {
    let profile = CapabilityProfile { null_ordering: NullOrdering::Unspecified, ..CapabilityProfile::default() };
    let (a, b) = restarted_under("unspecified", profile, vec![SortColumn::asc("A"), SortColumn::asc("B")]).await;
    assert_eq!(a, ASCENDING);
    assert_eq!(b, ASCENDING);
}

#[tokio::test]
async fn nulls_last_profile_restarts_into_the_trailing_nulls() {
    let profile = CapabilityProfile { null_ordering: NullOrdering::NullsLast, ..CapabilityProfile::default() };
    let (a, b) = restarted_under("nulls_last", profile, vec![SortColumn::asc("A"), SortColumn::asc("B")]).await;
    assert_eq!(a, NULLS_LAST);
    assert_eq!(b, NULLS_LAST);
}

#[tokio::test]
async fn descending_key_with_explicit_nulls_first() {
    let sort = vec![SortColumn { nulls_first: Some(true), ..SortColumn::desc("A") }, SortColumn::desc("B")];
    let profile = CapabilityProfile { null_ordering: NullOrdering::NullsFirst, ..CapabilityProfile::default() };
    let (a, _) = restarted_under("desc_nulls_first", profile, sort).await;
    assert_eq!(a, ["n2", "n1", "d1", "c3", "c2", "c1", "b1", "a3", "a2", "a1"]);
}

#[tokio::test]
async fn emulated_null_placement_survives_restarts() {
    let profile = CapabilityProfile {
        supports_order_by_nulls_first_last: false,
        null_ordering: NullOrdering::Unspecified,
        ..CapabilityProfile::default()
    };
    let sort = vec![SortColumn { nulls_first: Some(false), ..SortColumn::asc("A") }, SortColumn::asc("B")];
    let (a, b) = restarted_under("emulated", profile, sort).await;
    assert_eq!(a, NULLS_LAST);
    assert_eq!(b, NULLS_LAST);
}

#[tokio::test]
async fn restart_from_null_with_unknown_placement_is_refused() {
    let db = TempDatabase::create("refused", PAIRS).await;
    let mut config = db.config(1, 1);
    config.profile = Some(CapabilityProfile {
        supports_order_by_nulls_first_last: false,
        supports_order_by_expressions: false,
        null_ordering: NullOrdering::Unspecified,
        ..CapabilityProfile::default()
    });
    let mut session = DeviceSession::from_config(config);
    let plan = pairs(vec![SortColumn::asc("A"), SortColumn::asc("B")]);
    let a = session.open_cursor(&plan, HashMap::new(), CursorType::Dynamic, IsolationLevel::CursorStability).await.unwrap();
    let first = session.next(a).await.unwrap().unwrap();
    assert!(first[0].is_null());

    let b = session.open_cursor(&plan, HashMap::new(), CursorType::Dynamic, IsolationLevel::CursorStability).await.unwrap();
    assert!(!session.cursor(a).unwrap().is_attached());
    let err = session.next(a).await.unwrap_err();
    assert!(matches!(err, DeviceError::NullPlacementUnknown(0)), "{}", err);
    session.close_cursor(b).await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn materialized_scan_matches_the_restarted_one() {
    let db = TempDatabase::create("materialized", PAIRS).await;
    let plan = pairs(vec![SortColumn::asc("A"), SortColumn::asc("B")]);

    let mut session = DeviceSession::from_config(db.config(2, 0));
    let cursor = session.open_cursor(&plan, HashMap::new(), CursorType::Static, IsolationLevel::Browse).await.unwrap();
    assert_eq!(session.browse_connections(), 0);
    let mut rows = Vec::new();
    while let Some(row) = session.next(cursor).await.unwrap() {
        rows.push(row);
    }
    assert_eq!(labels(&rows), ASCENDING);
    session.close().await.unwrap();
}

#[tokio::test]
async fn deferred_columns_are_read_through_streams() {
    let db = TempDatabase::create(
        "deferred",
        &[
            "CREATE TABLE Docs (ID INTEGER NOT NULL, Body TEXT)",
            "INSERT INTO Docs VALUES (1, 'first body'), (2, NULL), (3, 'third body')",
        ],
    )
    .await;
    let plan = LogicalQueryPlan::retrieve(TableVar::new(
        "Docs",
        vec![ColumnDef::new("ID", ScalarType::Integer).not_null(), ColumnDef::new("Body", ScalarType::Text)],
    ))
    .order(vec![SortColumn::asc("ID")]);

    let mut session = DeviceSession::from_config(db.config(1, 1));
    let cursor = session.open_cursor(&plan, HashMap::new(), CursorType::Dynamic, IsolationLevel::CursorStability).await.unwrap();
    let mut bodies = Vec::new();
    while let Some(row) = session.next(cursor).await.unwrap() {
        match &row[1] {
            Value::Stream(id) => {
                let mut body = String::new();
                session.read_stream(*id).await.unwrap().read_to_string(&mut body).unwrap();
                session.release_stream(*id).unwrap();
                bodies.push(Some(body));
            }
            other => {
                assert!(other.is_null());
                bodies.push(None);
            }
        }
    }
    assert_eq!(bodies, vec![Some("first body".to_string()), None, Some("third body".to_string())]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn statements_run_inside_a_transaction() {
    let db = TempDatabase::create("execute", PAIRS).await;
    let table = TableVar::new(
        "Pairs",
        vec![
            ColumnDef::new("A", ScalarType::Integer),
            ColumnDef::new("B", ScalarType::Integer),
            ColumnDef::new("Label", ScalarType::String),
        ],
    );
    let delete = LogicalQueryPlan::Delete {
        target: table,
        condition: Some(Expr::compare(">", Expr::column("A"), Expr::parameter("limit", ScalarType::Integer))),
    };

    let mut session = DeviceSession::from_config(db.config(1, 4));
    session.begin_transaction(IsolationLevel::Isolated).await.unwrap();
    let parameters = HashMap::from([("limit".to_string(), Value::Integer(2))]);
    assert_eq!(session.execute(&delete, &parameters).await.unwrap(), 4);
    session.commit().await.unwrap();

    let plan = pairs(vec![SortColumn::asc("A"), SortColumn::asc("B")]);
    let cursor = session.open_cursor(&plan, HashMap::new(), CursorType::Dynamic, IsolationLevel::CursorStability).await.unwrap();
    let mut remaining = Vec::new();
    while let Some(row) = session.next(cursor).await.unwrap() {
        remaining.push(row);
    }
    assert_eq!(labels(&remaining), &ASCENDING[..6]);
    session.close().await.unwrap();
}
