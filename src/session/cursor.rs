//! Device cursor: a scan over a prepared select that survives losing its
//! connection.
//!
//! When the session takes the connection away, the cursor remembers the key of
//! the last row it fetched. On its next fetch it reacquires a connection and
//! reopens the statement restricted to rows at or past that key, skipping the
//! boundary row that the inclusive restriction delivers again.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::device::{Device, OrderKey, PreparedPlan};
use crate::driver::{DriverCommand, DriverCursor};
use crate::models::enums::{CursorType, IsolationLevel};
use crate::query_ast::ast::{Expression, SelectStatement, Statement};
use crate::query_ast::errors::{QueryAstError, RewriteError};
use crate::query_ast::rewrite::{self, KeyColumn};
use crate::scalar_types::ScalarType;
use crate::value::{NativeValue, Row, Value};

use super::errors::DeviceError;
use super::pool::ConnectionId;
use super::stream::{StreamRegistry, StreamSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorId(pub u64);

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor#{}", self.0)
    }
}

/// A value bound to a generated parameter of a rewritten statement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyBinding {
    pub name: String,
    pub ty: ScalarType,
    pub value: Value,
}

pub(crate) fn key_columns(order: &[OrderKey]) -> Vec<KeyColumn> {
    order.iter().map(|k| KeyColumn { index: k.index, ascending: k.ascending, nulls: k.nulls }).collect()
}

fn key_of(order: &[OrderKey], row: &Row) -> Vec<Value> {
    order.iter().map(|k| row.get(k.index).cloned().unwrap_or(Value::Null)).collect()
}

/// Key values as expressions: parameters named `__k<i>`, or literals.
pub(crate) fn key_values(
    device: &Device,
    order: &[OrderKey],
    values: &[Value],
    use_parameters: bool,
) -> Result<(Vec<Expression>, Vec<KeyBinding>), DeviceError> {
    let mut expressions = Vec::with_capacity(values.len());
    let mut bindings = Vec::new();
    for (i, (key, value)) in order.iter().zip(values).enumerate() {
        if use_parameters {
            let name = format!("__k{}", i);
            expressions.push(Expression::parameter(name.clone()));
            bindings.push(KeyBinding { name, ty: key.ty, value: value.clone() });
        } else {
            expressions.push(device.type_maps().get(key.ty)?.literal(value)?);
        }
    }
    Ok((expressions, bindings))
}

pub(crate) fn select_of(prepared: &PreparedPlan) -> Result<&SelectStatement, DeviceError> {
    match &prepared.translated.statement {
        Statement::Select(select) => Ok(select),
        _ => Err(QueryAstError::NotTableValued("statement").into()),
    }
}

/// Encodes the values for the parameter markers `names`, in marker order.
pub(crate) fn bind_parameters(
    device: &Device,
    prepared: &PreparedPlan,
    names: &[String],
    parameters: &HashMap<String, Value>,
    keys: &[KeyBinding],
) -> Result<Vec<NativeValue>, DeviceError> {
    let mut natives = Vec::with_capacity(names.len());
    for name in names {
        if let Some(key) = keys.iter().find(|k| &k.name == name) {
            natives.push(device.type_maps().encode(key.ty, &key.value)?);
            continue;
        }
        let value = parameters.get(name).ok_or_else(|| DeviceError::MissingParameter(name.clone()))?;
        let declared = prepared.translated.parameters.iter().find(|p| &p.name == name);
        natives.push(match declared {
            Some(p) => device.type_maps().encode(p.ty, value)?,
            None => untyped_native(value),
        });
    }
    Ok(natives)
}

fn untyped_native(value: &Value) -> NativeValue {
    match value {
        Value::Null | Value::Stream(_) => NativeValue::Null,
        Value::Boolean(b) => NativeValue::Boolean(*b),
        Value::Integer(i) => NativeValue::Integer(*i),
        Value::Float(f) => NativeValue::Float(*f),
        Value::Binary(b) => NativeValue::Bytes(b.clone()),
        other => NativeValue::Text(other.to_string()),
    }
}

/// Command for the prepared statement, restricted past `restart` when given.
pub(crate) fn scan_command(
    device: &Device,
    prepared: &PreparedPlan,
    parameters: &HashMap<String, Value>,
    restart: Option<&[Value]>,
    use_parameters: bool,
    timeout: Option<Duration>,
) -> Result<DriverCommand, DeviceError> {
    let (sql, bindings) = match restart {
        None => (prepared.sql.clone(), Vec::new()),
        Some(values) => {
            let order = &prepared.translated.order;
            if order.is_empty() {
                return Err(DeviceError::RestartRequiresKey);
            }
            if let Some(i) = order.iter().zip(values).position(|(k, v)| k.nulls.is_none() && v.is_null()) {
                return Err(RewriteError::NullPlacementUnknown(i).into());
            }
            let (expressions, bindings) = key_values(device, order, values, use_parameters)?;
            let restricted = rewrite::restrict_past_key(
                select_of(prepared)?,
                prepared.translated.is_aggregate,
                &key_columns(order),
                &expressions,
            )?;
            (device.emit(&Statement::Select(restricted))?, bindings)
        }
    };
    let natives = bind_parameters(device, prepared, &sql.parameters, parameters, &bindings)?;
    Ok(DriverCommand::new(sql.text).with_parameters(natives).with_timeout(timeout).cursor())
}

pub struct DeviceCursor {
    pub id: CursorId,
    pub prepared: Arc<PreparedPlan>,
    pub parameters: HashMap<String, Value>,
    pub cursor_type: CursorType,
    pub isolation: IsolationLevel,
    pub(crate) driver_cursor: Option<Box<dyn DriverCursor>>,
    pub(crate) connection: Option<ConnectionId>,
    /// Rows fetched from the backend but not yet handed out.
    pub(crate) buffer: VecDeque<Row>,
    pub(crate) eof: bool,
    /// Key of the last fetched row.
    pub(crate) last_key: Option<Vec<Value>>,
    /// Set after a restart until the boundary row has been passed.
    pub(crate) skip_boundary: Option<Vec<Value>>,
    pub(crate) fetched: usize,
    pub(crate) delivered: usize,
}

impl DeviceCursor {
    pub fn new(
        id: CursorId,
        prepared: Arc<PreparedPlan>,
        parameters: HashMap<String, Value>,
        cursor_type: CursorType,
        isolation: IsolationLevel,
    ) -> Self {
        Self {
            id,
            prepared,
            parameters,
            cursor_type,
            isolation,
            driver_cursor: None,
            connection: None,
            buffer: VecDeque::new(),
            eof: false,
            last_key: None,
            skip_boundary: None,
            fetched: 0,
            delivered: 0,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_browse(&self) -> bool {
        self.isolation.is_browse()
    }

    pub fn rows_delivered(&self) -> usize {
        self.delivered
    }

    pub fn is_exhausted(&self) -> bool {
        self.eof && self.buffer.is_empty()
    }

    /// Key to resume from, once anything has been fetched.
    pub(crate) fn restart_key(&self) -> Option<&[Value]> {
        if self.fetched == 0 { None } else { self.last_key.as_deref() }
    }

    pub(crate) fn command(
        &self,
        device: &Device,
        use_parameters: bool,
        timeout: Option<Duration>,
    ) -> Result<DriverCommand, DeviceError> {
        scan_command(device, &self.prepared, &self.parameters, self.restart_key(), use_parameters, timeout)
    }

    pub(crate) fn attach(&mut self, connection: ConnectionId, driver_cursor: Box<dyn DriverCursor>) {
        self.skip_boundary = self.restart_key().map(<[Value]>::to_vec);
        self.connection = Some(connection);
        self.driver_cursor = Some(driver_cursor);
    }

    pub(crate) fn detach(&mut self) -> Option<ConnectionId> {
        self.driver_cursor = None;
        self.skip_boundary = None;
        self.connection.take()
    }

    /// Reads the next backend row, or `None` at end of scan.
    pub(crate) async fn read_row(
        &mut self,
        device: &Device,
        streams: &mut StreamRegistry,
        abort: &CancellationToken,
    ) -> Result<Option<Row>, DeviceError> {
        loop {
            if abort.is_cancelled() {
                return Err(DeviceError::Aborted);
            }
            let Some(driver) = self.driver_cursor.as_mut() else { return Ok(None) };
            if !driver.next().await? {
                self.eof = true;
                return Ok(None);
            }
            let row = self.decode(device, streams)?;
            let key = key_of(&self.prepared.translated.order, &row);
            if let Some(boundary) = &self.skip_boundary {
                if *boundary == key {
                    debug!("{}: skipping restart boundary row", self.id);
                    continue;
                }
                self.skip_boundary = None;
            }
            self.last_key = Some(key);
            self.fetched += 1;
            return Ok(Some(row));
        }
    }

    fn decode(&mut self, device: &Device, streams: &mut StreamRegistry) -> Result<Row, DeviceError> {
        let Some(driver) = self.driver_cursor.as_mut() else { return Ok(Vec::new()) };
        let translated = &self.prepared.translated;
        let mut row = Vec::with_capacity(translated.columns.len());
        let mut deferred = Vec::new();
        for (i, column) in translated.columns.iter().enumerate() {
            if column.deferred || driver.is_deferred(i) {
                if !driver.is_null(i)? {
                    deferred.push(i);
                }
                row.push(Value::Null);
            } else {
                row.push(device.type_maps().decode(column.ty, driver.get(i)?)?);
            }
        }
        for i in deferred {
            let source = if translated.order.is_empty() {
                let mut bytes = Vec::new();
                driver.read_deferred(i)?.read_to_end(&mut bytes)?;
                StreamSource::Materialized(bytes)
            } else {
                StreamSource::Keyed {
                    prepared: self.prepared.clone(),
                    column: i,
                    key_values: key_of(&translated.order, &row),
                    parameters: self.parameters.clone(),
                    isolation: self.isolation,
                }
            };
            row[i] = Value::Stream(streams.register(source));
        }
        Ok(row)
    }
}
