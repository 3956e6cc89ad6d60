//! Scripted in-memory driver for session tests.
//!
//! Every connection serves the same rows. A cursor command whose first
//! parameter is an integer is treated as a restart and only yields rows whose
//! first column is at or past it. Everything the session does is logged.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use sqldevice::config::DeviceConfig;
use sqldevice::device::Device;
use sqldevice::driver::{Driver, DriverCommand, DriverConnection, DriverCursor, DriverError};
use sqldevice::models::enums::{CursorType, DatabaseType, IsolationLevel};
use sqldevice::query_ast::{ColumnDef, LogicalQueryPlan, SortColumn, TableVar};
use sqldevice::scalar_types::ScalarType;
use sqldevice::session::DeviceSession;
use sqldevice::value::{NativeValue, Value};

/// Isolation and cursor type the session asked a connection for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Open(CursorType, IsolationLevel),
    Begin(IsolationLevel),
}

#[derive(Default)]
pub struct ScriptedDriver {
    rows: Vec<Vec<NativeValue>>,
    events: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<Request>>>,
    connects: AtomicUsize,
    /// Next `execute` fails, reporting the transaction as rolled back.
    fail_execute: Arc<AtomicBool>,
}

impl ScriptedDriver {
    pub fn with_rows(count: i64) -> Arc<Self> {
        let rows = (1..=count)
            .map(|i| vec![NativeValue::Integer(i), NativeValue::Text(format!("item {}", i))])
            .collect();
        Arc::new(Self { rows, ..Default::default() })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn fail_next_execute(&self) {
        self.fail_execute.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn connect(&self, _connection_string: &str) -> Result<Box<dyn DriverConnection>, DriverError> {
        let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.lock().unwrap().push(format!("connect {}", id));
        Ok(Box::new(ScriptedConnection {
            id,
            rows: self.rows.clone(),
            events: self.events.clone(),
            requests: self.requests.clone(),
            fail_execute: self.fail_execute.clone(),
            failed: false,
        }))
    }
}

struct ScriptedConnection {
    id: usize,
    rows: Vec<Vec<NativeValue>>,
    events: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<Request>>>,
    fail_execute: Arc<AtomicBool>,
    failed: bool,
}

impl ScriptedConnection {
    fn log(&self, event: &str) {
        self.events.lock().unwrap().push(format!("{} {}", event, self.id));
    }
}

#[async_trait]
impl DriverConnection for ScriptedConnection {
    async fn execute(&mut self, _command: &DriverCommand) -> Result<u64, DriverError> {
        self.log("execute");
        if self.fail_execute.swap(false, Ordering::SeqCst) {
            self.failed = true;
            return Err(DriverError::Backend("deadlock detected".into()));
        }
        Ok(3)
    }

    async fn open_cursor(
        &mut self,
        command: &DriverCommand,
        cursor_type: CursorType,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn DriverCursor>, DriverError> {
        self.log("open");
        self.requests.lock().unwrap().push(Request::Open(cursor_type, isolation));
        let rows = match command.parameters.first() {
            Some(NativeValue::Integer(from)) => {
                self.rows.iter().filter(|r| matches!(r[0], NativeValue::Integer(i) if i >= *from)).cloned().collect()
            }
            _ => self.rows.iter().cloned().collect(),
        };
        Ok(Box::new(ScriptedCursor { rows, current: None, events: self.events.clone(), connection: self.id }))
    }

    async fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<(), DriverError> {
        self.log("begin");
        self.requests.lock().unwrap().push(Request::Begin(isolation));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.log("commit");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.log("rollback");
        Ok(())
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn transaction_failed(&self) -> bool {
        self.failed
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.log("close");
        Ok(())
    }
}

struct ScriptedCursor {
    rows: VecDeque<Vec<NativeValue>>,
    current: Option<Vec<NativeValue>>,
    events: Arc<Mutex<Vec<String>>>,
    connection: usize,
}

impl Drop for ScriptedCursor {
    fn drop(&mut self) {
        self.events.lock().unwrap().push(format!("cursor closed {}", self.connection));
    }
}

#[async_trait]
impl DriverCursor for ScriptedCursor {
    async fn next(&mut self) -> Result<bool, DriverError> {
        self.current = self.rows.pop_front();
        Ok(self.current.is_some())
    }

    fn get(&self, index: usize) -> Result<NativeValue, DriverError> {
        let row = self.current.as_ref().ok_or(DriverError::NoCurrentRow)?;
        row.get(index).cloned().ok_or(DriverError::ColumnOutOfRange(index))
    }
}

pub fn items_table() -> TableVar {
    TableVar::new(
        "Items",
        vec![ColumnDef::new("ID", ScalarType::Integer).not_null(), ColumnDef::new("Name", ScalarType::String)],
    )
    .with_key(&["ID"])
}

/// Items ordered by their key, so cursors over it can restart.
pub fn items_by_id() -> LogicalQueryPlan {
    LogicalQueryPlan::retrieve(items_table()).order(vec![SortColumn::asc("ID")])
}

pub fn config(max_execute: usize, max_browse: usize, batch_size: usize) -> DeviceConfig {
    DeviceConfig {
        connection_string: "scripted://".into(),
        dialect: Some(DatabaseType::SQLite),
        max_execute_connections: max_execute,
        max_browse_connections: max_browse,
        batch_size,
        ..Default::default()
    }
}

pub fn session(driver: &Arc<ScriptedDriver>, config: DeviceConfig) -> DeviceSession {
    let device = Arc::new(Device::from_config(&config));
    DeviceSession::new(device, driver.clone(), config)
}

pub fn no_parameters() -> HashMap<String, Value> {
    HashMap::new()
}

pub fn id_of(row: &[Value]) -> i64 {
    row[0].as_i64().unwrap()
}
