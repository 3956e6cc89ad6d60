//! Driver boundary.
//!
//! The session talks to backends only through these traits. A driver cursor
//! owns whatever state it needs, so a connection can be handed to another
//! cursor once the previous one is dropped.

pub mod any;

use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::enums::{CursorType, IsolationLevel};
use crate::scalar_types::TypeMapError;
use crate::value::NativeValue;

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection is closed")]
    Closed,
    #[error("column {0} is out of range")]
    ColumnOutOfRange(usize),
    #[error("scan was stopped before its result ended")]
    Interrupted,
    #[error("cursor is not positioned on a row")]
    NoCurrentRow,
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    TypeMap(#[from] TypeMapError),
}

/// One statement as sent to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverCommand {
    pub text: String,
    /// Values in marker order.
    pub parameters: Vec<NativeValue>,
    pub timeout: Option<Duration>,
    pub is_cursor: bool,
}

impl DriverCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), parameters: Vec::new(), timeout: None, is_cursor: false }
    }

    pub fn with_parameters(mut self, parameters: Vec<NativeValue>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cursor(mut self) -> Self {
        self.is_cursor = true;
        self
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, connection_string: &str) -> Result<Box<dyn DriverConnection>, DriverError>;
}

#[async_trait]
pub trait DriverConnection: Send {
    /// Runs a statement that returns no rows; yields the affected row count.
    async fn execute(&mut self, command: &DriverCommand) -> Result<u64, DriverError>;

    async fn open_cursor(
        &mut self,
        command: &DriverCommand,
        cursor_type: CursorType,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn DriverCursor>, DriverError>;

    async fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// False once the connection can no longer carry statements.
    fn is_valid(&self) -> bool;

    /// True when the backend has already rolled back the open transaction.
    fn transaction_failed(&self) -> bool;

    async fn close(self: Box<Self>) -> Result<(), DriverError>;
}

#[async_trait]
pub trait DriverCursor: Send {
    /// Moves to the next row; `false` at end of scan.
    async fn next(&mut self) -> Result<bool, DriverError>;

    fn get(&self, index: usize) -> Result<NativeValue, DriverError>;

    fn is_null(&self, index: usize) -> Result<bool, DriverError> {
        Ok(self.get(index)?.is_null())
    }

    /// Whether the column is exposed as a native stream.
    fn is_deferred(&self, _index: usize) -> bool {
        false
    }

    fn read_deferred(&mut self, index: usize) -> Result<Box<dyn Read + Send>, DriverError> {
        Ok(Box::new(std::io::Cursor::new(native_bytes(self.get(index)?))))
    }
}

/// Byte content of a native value, as read through a deferred stream.
pub fn native_bytes(value: NativeValue) -> Vec<u8> {
    match value {
        NativeValue::Null => Vec::new(),
        NativeValue::Bytes(b) => b,
        NativeValue::Text(s) => s.into_bytes(),
        NativeValue::Boolean(b) => b.to_string().into_bytes(),
        NativeValue::Integer(i) => i.to_string().into_bytes(),
        NativeValue::Float(f) => f.to_string().into_bytes(),
    }
}
