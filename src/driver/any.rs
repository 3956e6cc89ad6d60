//! sqlx `Any` backed driver (SQLite, PostgreSQL and MySQL URLs).
//!
//! sqlx row streams borrow their connection, so an open cursor runs its query
//! on a spawned task that owns the connection and hands rows over a bounded
//! channel. The connection comes back when the task ends; any later call on
//! the connection stops an unfinished scan first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use log::{debug, warn};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Column, Connection, Executor, Row, TypeInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Driver, DriverCommand, DriverConnection, DriverCursor, DriverError};
use crate::models::enums::{CursorType, DatabaseType, IsolationLevel};
use crate::value::NativeValue;

/// SQLSTATEs after which the backend has already rolled the transaction back.
const ROLLED_BACK_STATES: &[&str] = &["40001", "40P01", "25P02", "40000"];

/// Rows a scan may run ahead of its reader.
const SCAN_BUFFER: usize = 64;

pub struct AnyDriver;

impl AnyDriver {
    pub fn new() -> Self {
        sqlx::any::install_default_drivers();
        Self
    }
}

impl Default for AnyDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for AnyDriver {
    async fn connect(&self, connection_string: &str) -> Result<Box<dyn DriverConnection>, DriverError> {
        let connection = AnyConnection::connect(connection_string).await?;
        let backend = connection.backend_name().parse().unwrap_or_default();
        debug!("connected to {} ({:?})", connection.backend_name(), backend);
        Ok(Box::new(AnyDriverConnection {
            connection: Some(connection),
            scan: None,
            health: Arc::new(Health::default()),
            backend,
            browse_applied: false,
        }))
    }
}

fn level_name(isolation: IsolationLevel) -> &'static str {
    match isolation {
        IsolationLevel::Browse => "READ UNCOMMITTED",
        IsolationLevel::CursorStability => "READ COMMITTED",
        IsolationLevel::Isolated => "SERIALIZABLE",
    }
}

/// Statements that open a transaction at `isolation` on `backend`.
pub fn begin_statements(backend: DatabaseType, isolation: IsolationLevel) -> Vec<String> {
    let level = level_name(isolation);
    match backend {
        DatabaseType::SQLite => {
            let dirty = if isolation.is_browse() { 1 } else { 0 };
            vec![format!("PRAGMA read_uncommitted = {}", dirty), "BEGIN".to_string()]
        }
        DatabaseType::PostgreSQL => vec![format!("BEGIN ISOLATION LEVEL {}", level)],
        DatabaseType::MsSQL => {
            vec![format!("SET TRANSACTION ISOLATION LEVEL {}", level), "BEGIN TRANSACTION".to_string()]
        }
        DatabaseType::MySQL | DatabaseType::Generic => {
            vec![format!("SET TRANSACTION ISOLATION LEVEL {}", level), "START TRANSACTION".to_string()]
        }
    }
}

/// Statement putting a connection's autocommit reads at read-uncommitted.
pub fn browse_statement(backend: DatabaseType) -> String {
    match backend {
        DatabaseType::SQLite => "PRAGMA read_uncommitted = 1".to_string(),
        DatabaseType::PostgreSQL => {
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL READ UNCOMMITTED".to_string()
        }
        DatabaseType::MsSQL => "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED".to_string(),
        DatabaseType::MySQL | DatabaseType::Generic => {
            "SET SESSION TRANSACTION ISOLATION LEVEL READ UNCOMMITTED".to_string()
        }
    }
}

/// Connection state shared with the task running a scan.
#[derive(Default)]
struct Health {
    broken: AtomicBool,
    rolled_back: AtomicBool,
}

impl Health {
    /// Records what an error says about the connection and its transaction.
    fn observe(&self, err: &DriverError) {
        match err {
            DriverError::Sqlx(sqlx::Error::Database(db)) => {
                if db.code().is_some_and(|code| ROLLED_BACK_STATES.contains(&code.as_ref())) {
                    warn!("backend rolled back the transaction: {}", db);
                    self.rolled_back.store(true, Ordering::SeqCst);
                }
            }
            DriverError::Sqlx(
                sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed | sqlx::Error::PoolClosed,
            )
            | DriverError::Timeout(_) => self.broken.store(true, Ordering::SeqCst),
            _ => {}
        }
    }
}

enum ScanMessage {
    Row(Vec<NativeValue>),
    End,
    Failed(DriverError),
}

struct Scan {
    task: JoinHandle<AnyConnection>,
    stop: CancellationToken,
}

pub struct AnyDriverConnection {
    /// `None` while a scan task holds the connection.
    connection: Option<AnyConnection>,
    scan: Option<Scan>,
    health: Arc<Health>,
    backend: DatabaseType,
    browse_applied: bool,
}

async fn with_timeout<T, F>(timeout: Option<Duration>, f: F) -> Result<T, DriverError>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, f).await.map_err(|_| DriverError::Timeout(limit))?.map_err(Into::into),
        None => f.await.map_err(Into::into),
    }
}

fn bind<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    parameters: &[NativeValue],
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    for value in parameters {
        query = match value.clone() {
            NativeValue::Null => query.bind(None::<String>),
            NativeValue::Boolean(b) => query.bind(b),
            NativeValue::Integer(i) => query.bind(i),
            NativeValue::Float(f) => query.bind(f),
            NativeValue::Text(s) => query.bind(s),
            NativeValue::Bytes(b) => query.bind(b),
        };
    }
    query
}

/// Runs `command` on its own task, sending decoded rows to `rows` until the
/// result ends, the reader goes away or `stop` fires.
fn spawn_scan(
    mut connection: AnyConnection,
    command: DriverCommand,
    health: Arc<Health>,
    stop: CancellationToken,
    rows: mpsc::Sender<ScanMessage>,
) -> JoinHandle<AnyConnection> {
    tokio::spawn(async move {
        {
            let query = bind(sqlx::query(&command.text), &command.parameters);
            let mut stream = query.fetch(&mut connection);
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => None,
                    next = stream.try_next() => Some(next),
                };
                let Some(next) = next else { break };
                let message = match next {
                    Ok(Some(row)) => ScanMessage::Row(decode_row(&row)),
                    Ok(None) => ScanMessage::End,
                    Err(err) => {
                        let err = DriverError::from(err);
                        health.observe(&err);
                        ScanMessage::Failed(err)
                    }
                };
                let last = !matches!(message, ScanMessage::Row(_));
                let delivered = tokio::select! {
                    _ = stop.cancelled() => false,
                    sent = rows.send(message) => sent.is_ok(),
                };
                if last || !delivered {
                    break;
                }
            }
        }
        connection
    })
}

impl AnyDriverConnection {
    /// The connection, taken back from an unfinished scan if needed.
    async fn connection(&mut self) -> Result<&mut AnyConnection, DriverError> {
        if let Some(scan) = self.scan.take() {
            scan.stop.cancel();
            match scan.task.await {
                Ok(connection) => self.connection = Some(connection),
                Err(err) => {
                    warn!("scan task failed: {}", err);
                    self.health.broken.store(true, Ordering::SeqCst);
                }
            }
        }
        self.connection.as_mut().ok_or(DriverError::Closed)
    }

    fn observe<T>(&self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        if let Err(err) = &result {
            self.health.observe(err);
        }
        result
    }

    async fn simple(&mut self, sql: &str) -> Result<(), DriverError> {
        debug!("{}", sql);
        let connection = self.connection().await?;
        let result = connection.execute(sql).await.map(|_| ()).map_err(DriverError::from);
        self.observe(result)
    }
}

#[async_trait]
impl DriverConnection for AnyDriverConnection {
    async fn execute(&mut self, command: &DriverCommand) -> Result<u64, DriverError> {
        let connection = self.connection().await?;
        let query = bind(sqlx::query(&command.text), &command.parameters);
        let result = with_timeout(command.timeout, query.execute(&mut *connection)).await.map(|r| r.rows_affected());
        self.observe(result)
    }

    async fn open_cursor(
        &mut self,
        command: &DriverCommand,
        cursor_type: CursorType,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn DriverCursor>, DriverError> {
        debug!("opening {:?} cursor ({:?})", cursor_type, isolation);
        if isolation.is_browse() && !self.browse_applied {
            self.simple(&browse_statement(self.backend)).await?;
            self.browse_applied = true;
        }
        self.connection().await?;
        let connection = self.connection.take().ok_or(DriverError::Closed)?;
        let stop = CancellationToken::new();
        let (sender, receiver) = mpsc::channel(SCAN_BUFFER);
        let task = spawn_scan(connection, command.clone(), self.health.clone(), stop.clone(), sender);
        self.scan = Some(Scan { task, stop });
        Ok(Box::new(AnyDriverCursor {
            rows: receiver,
            current: None,
            done: false,
            timeout: command.timeout,
            health: self.health.clone(),
        }))
    }

    async fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<(), DriverError> {
        self.health.rolled_back.store(false, Ordering::SeqCst);
        for statement in begin_statements(self.backend, isolation) {
            self.simple(&statement).await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.simple("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.simple("ROLLBACK").await
    }

    fn is_valid(&self) -> bool {
        (self.connection.is_some() || self.scan.is_some()) && !self.health.broken.load(Ordering::SeqCst)
    }

    fn transaction_failed(&self) -> bool {
        self.health.rolled_back.load(Ordering::SeqCst)
    }

    async fn close(mut self: Box<Self>) -> Result<(), DriverError> {
        if self.connection().await.is_err() {
            return Ok(());
        }
        match self.connection.take() {
            Some(connection) => connection.close().await.map_err(Into::into),
            None => Ok(()),
        }
    }
}

fn decode_value(row: &AnyRow, index: usize) -> NativeValue {
    let type_name = row.columns()[index].type_info().name().to_ascii_uppercase();
    let integer = || match row.try_get::<Option<i64>, _>(index) {
        Ok(v) => Some(v.map_or(NativeValue::Null, NativeValue::Integer)),
        Err(_) => row.try_get::<Option<i32>, _>(index).ok().map(|v| v.map_or(NativeValue::Null, |i| NativeValue::Integer(i.into()))),
    };
    let float = || row.try_get::<Option<f64>, _>(index).ok().map(|v| v.map_or(NativeValue::Null, NativeValue::Float));
    let text = || row.try_get::<Option<String>, _>(index).ok().map(|v| v.map_or(NativeValue::Null, NativeValue::Text));
    let bytes = || row.try_get::<Option<Vec<u8>>, _>(index).ok().map(|v| v.map_or(NativeValue::Null, NativeValue::Bytes));
    let boolean = || row.try_get::<Option<bool>, _>(index).ok().map(|v| v.map_or(NativeValue::Null, NativeValue::Boolean));

    let decoded = match type_name.as_str() {
        "NULL" => Some(NativeValue::Null),
        "BOOL" | "BOOLEAN" => boolean().or_else(integer),
        "INTEGER" | "INT" | "BIGINT" | "SMALLINT" | "INT2" | "INT4" | "INT8" => integer().or_else(text),
        "REAL" | "DOUBLE" | "FLOAT" | "FLOAT4" | "FLOAT8" => float().or_else(text),
        "BLOB" | "BYTEA" => bytes().or_else(text),
        "TEXT" | "VARCHAR" => text().or_else(bytes),
        _ => integer().or_else(float).or_else(text).or_else(bytes).or_else(boolean),
    };
    decoded.unwrap_or_else(|| {
        warn!("could not decode column {} of type {}", index, type_name);
        NativeValue::Null
    })
}

fn decode_row(row: &AnyRow) -> Vec<NativeValue> {
    (0..row.columns().len()).map(|i| decode_value(row, i)).collect()
}

pub struct AnyDriverCursor {
    rows: mpsc::Receiver<ScanMessage>,
    current: Option<Vec<NativeValue>>,
    done: bool,
    timeout: Option<Duration>,
    health: Arc<Health>,
}

#[async_trait]
impl DriverCursor for AnyDriverCursor {
    async fn next(&mut self) -> Result<bool, DriverError> {
        self.current = None;
        if self.done {
            return Ok(false);
        }
        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.rows.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    self.done = true;
                    let err = DriverError::Timeout(limit);
                    self.health.observe(&err);
                    return Err(err);
                }
            },
            None => self.rows.recv().await,
        };
        match received {
            Some(ScanMessage::Row(row)) => {
                self.current = Some(row);
                Ok(true)
            }
            Some(ScanMessage::End) => {
                self.done = true;
                Ok(false)
            }
            Some(ScanMessage::Failed(err)) => {
                self.done = true;
                Err(err)
            }
            None => {
                self.done = true;
                Err(DriverError::Interrupted)
            }
        }
    }

    fn get(&self, index: usize) -> Result<NativeValue, DriverError> {
        let row = self.current.as_ref().ok_or(DriverError::NoCurrentRow)?;
        row.get(index).cloned().ok_or(DriverError::ColumnOutOfRange(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_applies_isolation_through_the_dirty_read_pragma() {
        assert_eq!(
            begin_statements(DatabaseType::SQLite, IsolationLevel::CursorStability),
            vec!["PRAGMA read_uncommitted = 0", "BEGIN"]
        );
        assert_eq!(
            begin_statements(DatabaseType::SQLite, IsolationLevel::Browse),
            vec!["PRAGMA read_uncommitted = 1", "BEGIN"]
        );
        assert_eq!(browse_statement(DatabaseType::SQLite), "PRAGMA read_uncommitted = 1");
    }

    #[test]
    fn postgres_names_the_level_in_begin() {
        assert_eq!(
            begin_statements(DatabaseType::PostgreSQL, IsolationLevel::Isolated),
            vec!["BEGIN ISOLATION LEVEL SERIALIZABLE"]
        );
        assert_eq!(
            begin_statements(DatabaseType::PostgreSQL, IsolationLevel::CursorStability),
            vec!["BEGIN ISOLATION LEVEL READ COMMITTED"]
        );
        assert!(browse_statement(DatabaseType::PostgreSQL).ends_with("READ UNCOMMITTED"));
    }

    #[test]
    fn mysql_sets_the_level_before_starting() {
        assert_eq!(
            begin_statements(DatabaseType::MySQL, IsolationLevel::Isolated),
            vec!["SET TRANSACTION ISOLATION LEVEL SERIALIZABLE", "START TRANSACTION"]
        );
        assert_eq!(
            begin_statements(DatabaseType::MsSQL, IsolationLevel::Browse),
            vec!["SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED", "BEGIN TRANSACTION"]
        );
        assert_eq!(browse_statement(DatabaseType::MySQL), "SET SESSION TRANSACTION ISOLATION LEVEL READ UNCOMMITTED");
    }

    #[test]
    fn timeouts_mark_the_connection_broken() {
        let health = Health::default();
        health.observe(&DriverError::Timeout(Duration::from_secs(1)));
        assert!(health.broken.load(Ordering::SeqCst));
        assert!(!health.rolled_back.load(Ordering::SeqCst));
    }
}
