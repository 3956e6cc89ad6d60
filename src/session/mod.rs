//! Device session: connection pools, transactions and cursors for one caller.
//!
//! Two pools back a session. The execute pool carries reads and writes and
//! joins the session transaction; the browse pool serves read-uncommitted
//! cursors, never joins a transaction, and disposes of a connection as soon as
//! its cursor lets go of it. When the execute pool is full a requester takes
//! the connection of another cursor, which restarts from its last key later.

pub mod cursor;
pub mod errors;
pub mod pool;
pub mod stream;

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::device::Device;
use crate::driver::any::AnyDriver;
use crate::driver::{Driver, DriverCommand, DriverConnection, DriverError, native_bytes};
use crate::models::enums::{CursorType, IsolationLevel};
use crate::query_ast::errors::QueryAstError;
use crate::query_ast::logical::{LogicalQueryPlan, ResultKind};
use crate::value::{Row, StreamId, Value};

pub use cursor::{CursorId, DeviceCursor};
pub use errors::DeviceError;
pub use pool::{ConnectionId, ConnectionPool, PoolEntry};
pub use stream::{StreamDescriptor, StreamRegistry, StreamSource};

pub struct DeviceSession {
    device: Arc<Device>,
    driver: Arc<dyn Driver>,
    config: DeviceConfig,
    execute_pool: ConnectionPool,
    browse_pool: ConnectionPool,
    cursors: HashMap<CursorId, DeviceCursor>,
    streams: StreamRegistry,
    /// Isolation of the open transaction; connections join it lazily.
    transaction: Option<IsolationLevel>,
    transaction_failed: bool,
    abort: CancellationToken,
    next_cursor: u64,
    next_connection: u64,
}

/// Reads the single value of a deferred fetch.
async fn fetch_deferred(
    connection: &mut dyn DriverConnection,
    command: &DriverCommand,
    isolation: IsolationLevel,
) -> Result<Option<Box<dyn Read + Send>>, DriverError> {
    let mut cursor = connection.open_cursor(command, CursorType::Static, isolation).await?;
    if !cursor.next().await? {
        return Ok(None);
    }
    if cursor.is_deferred(0) {
        return cursor.read_deferred(0).map(Some);
    }
    let reader: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(native_bytes(cursor.get(0)?)));
    Ok(Some(reader))
}

impl DeviceSession {
    pub fn new(device: Arc<Device>, driver: Arc<dyn Driver>, config: DeviceConfig) -> Self {
        Self {
            execute_pool: ConnectionPool::new("execute", config.max_execute_connections),
            browse_pool: ConnectionPool::new("browse", config.max_browse_connections),
            device,
            driver,
            config,
            cursors: HashMap::new(),
            streams: StreamRegistry::new(),
            transaction: None,
            transaction_failed: false,
            abort: CancellationToken::new(),
            next_cursor: 0,
            next_connection: 0,
        }
    }

    /// Session over the sqlx driver, with a device built from the same config.
    pub fn from_config(config: DeviceConfig) -> Self {
        let device = Arc::new(Device::from_config(&config));
        Self::new(device, Arc::new(AnyDriver::new()), config)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Cancelling the token makes the next row fetch fail with `Aborted`.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn reset_abort(&mut self) {
        self.abort = CancellationToken::new();
    }

    /// Whether the backend has already rolled back the open transaction.
    pub fn transaction_failed(&self) -> bool {
        self.transaction_failed
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn execute_connections(&self) -> usize {
        self.execute_pool.len()
    }

    pub fn browse_connections(&self) -> usize {
        self.browse_pool.len()
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.len()
    }

    pub fn cursor(&self, id: CursorId) -> Option<&DeviceCursor> {
        self.cursors.get(&id)
    }

    fn timeout(&self) -> Option<Duration> {
        match self.config.command_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn pool_mut(&mut self, browse: bool) -> &mut ConnectionPool {
        if browse { &mut self.browse_pool } else { &mut self.execute_pool }
    }

    fn fail(&mut self, source: DriverError, transaction_failed: bool) -> DeviceError {
        if transaction_failed {
            warn!("transaction rolled back by the backend: {}", source);
            self.transaction_failed = true;
        }
        DeviceError::Backend { source, transaction_failed }
    }

    /// Re-tags a backend error with the status of the connection it came from.
    fn note(&mut self, err: DeviceError, transaction_failed: bool) -> DeviceError {
        match err {
            DeviceError::Backend { source, .. } => self.fail(source, transaction_failed),
            other => other,
        }
    }

    fn connection_failed(&self, id: ConnectionId, browse: bool) -> bool {
        let pool = if browse { &self.browse_pool } else { &self.execute_pool };
        pool.get(id).is_some_and(|e| e.connection.transaction_failed())
    }

    async fn connect(&mut self, browse: bool) -> Result<PoolEntry, DeviceError> {
        let mut connection = self.driver.connect(&self.config.connection_string).await?;
        let setup = if browse { &self.config.on_new_browse_connection } else { &self.config.on_new_connection };
        if let Some(sql) = setup.clone() {
            let command = DriverCommand::new(sql).with_timeout(self.timeout());
            if let Err(source) = connection.execute(&command).await {
                warn!("connection setup failed: {}", source);
                if let Err(err) = connection.close().await {
                    debug!("close after failed setup: {}", err);
                }
                return Err(source.into());
            }
        }
        self.next_connection += 1;
        let id = ConnectionId(self.next_connection);
        debug!("opened {} connection {}", if browse { "browse" } else { "execute" }, id);
        Ok(PoolEntry::new(id, connection))
    }

    /// Finds a connection for `requester`: an idle one, a new one, or, in the
    /// execute pool only, one taken from another cursor.
    async fn request_connection(&mut self, requester: Option<CursorId>, browse: bool) -> Result<ConnectionId, DeviceError> {
        for entry in self.pool_mut(browse).take_invalid_idle() {
            warn!("discarding invalid connection {}", entry.id);
            if let Err(err) = entry.connection.close().await {
                debug!("close of invalid connection failed: {}", err);
            }
        }
        let id = if let Some(id) = self.pool_mut(browse).first_idle() {
            debug!("reusing idle connection {}", id);
            id
        } else if !self.pool_mut(browse).is_full() {
            let entry = self.connect(browse).await?;
            let id = entry.id;
            self.pool_mut(browse).push(entry);
            id
        } else if browse {
            return Err(DeviceError::PoolExhausted(self.browse_pool.name()));
        } else {
            let Some((id, owner)) = self.execute_pool.steal_candidate(requester) else {
                return Err(DeviceError::PoolExhausted(self.execute_pool.name()));
            };
            debug!("cursor switch: {} released from {}", id, owner);
            self.release_cursor(owner, true).await?;
            self.execute_pool.move_to_tail(id);
            id
        };
        if !browse {
            self.join_transaction(id).await?;
        }
        Ok(id)
    }

    async fn join_transaction(&mut self, id: ConnectionId) -> Result<(), DeviceError> {
        let Some(isolation) = self.transaction else { return Ok(()) };
        let Some(entry) = self.execute_pool.get_mut(id) else { return Ok(()) };
        if entry.in_transaction {
            return Ok(());
        }
        let result = entry.connection.begin_transaction(isolation).await;
        let failed = entry.connection.transaction_failed();
        if result.is_ok() {
            entry.in_transaction = true;
        }
        result.map_err(|source| self.fail(source, failed))
    }

    /// Clears the owner of `id`; browse connections are closed instead.
    async fn detach_connection(&mut self, id: ConnectionId, browse: bool) -> bool {
        if browse {
            let Some(entry) = self.browse_pool.remove(id) else { return false };
            let failed = entry.connection.transaction_failed();
            debug!("disposing browse connection {}", id);
            if let Err(err) = entry.connection.close().await {
                debug!("close of browse connection failed: {}", err);
            }
            return failed;
        }
        match self.execute_pool.get_mut(id) {
            Some(entry) => {
                entry.cursor = None;
                entry.connection.transaction_failed()
            }
            None => false,
        }
    }

    /// Detaches cursor `id` from its connection. A static cursor first reads
    /// the rest of its scan into its buffer when `drain` is set.
    async fn release_cursor(&mut self, id: CursorId, drain: bool) -> Result<(), DeviceError> {
        let Some(cursor) = self.cursors.get_mut(&id) else { return Ok(()) };
        let Some(connection) = cursor.connection else { return Ok(()) };
        let browse = cursor.is_browse();
        let mut outcome = Ok(());
        if drain && cursor.cursor_type == CursorType::Static && !cursor.eof {
            debug!("{} drains before releasing {}", id, connection);
            loop {
                match cursor.read_row(&self.device, &mut self.streams, &self.abort).await {
                    Ok(Some(row)) => cursor.buffer.push_back(row),
                    Ok(None) => break,
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                }
            }
        }
        cursor.detach();
        let failed = self.detach_connection(connection, browse).await;
        outcome.map_err(|err| self.note(err, failed))
    }

    /// Opens the cursor's statement on a connection, restricted past the last
    /// fetched key when the scan is being resumed.
    async fn attach(&mut self, id: CursorId) -> Result<(), DeviceError> {
        let (command, browse, cursor_type, isolation) = {
            let cursor = self.cursors.get(&id).ok_or(DeviceError::CursorNotFound(id))?;
            let command = cursor.command(&self.device, self.config.use_parameters_for_cursors, self.timeout())?;
            (command, cursor.is_browse(), cursor.cursor_type, cursor.isolation)
        };
        let connection = self.request_connection(Some(id), browse).await?;
        let Some(entry) = self.pool_mut(browse).get_mut(connection) else {
            return Err(DeviceError::PoolInvariant(format!("{} left the pool while attaching {}", connection, id)));
        };
        debug!("{} opens on {}", id, connection);
        let result = entry.connection.open_cursor(&command, cursor_type, isolation).await;
        let failed = entry.connection.transaction_failed();
        match result {
            Ok(driver_cursor) => {
                entry.cursor = Some(id);
                if let Some(cursor) = self.cursors.get_mut(&id) {
                    cursor.attach(connection, driver_cursor);
                }
                Ok(())
            }
            Err(source) => {
                if browse {
                    self.detach_connection(connection, true).await;
                }
                Err(self.fail(source, failed))
            }
        }
    }

    /// Fetches the next batch into the cursor buffer.
    async fn fill(&mut self, id: CursorId) -> Result<(), DeviceError> {
        let attached = self.cursors.get(&id).ok_or(DeviceError::CursorNotFound(id))?.is_attached();
        if !attached {
            self.attach(id).await?;
        }
        let batch = self.config.batch_size;
        let cursor = self.cursors.get_mut(&id).ok_or(DeviceError::CursorNotFound(id))?;
        let connection = cursor.connection;
        let browse = cursor.is_browse();
        let mut read = 0;
        let mut outcome = Ok(());
        while batch == 0 || read < batch {
            match cursor.read_row(&self.device, &mut self.streams, &self.abort).await {
                Ok(Some(row)) => {
                    cursor.buffer.push_back(row);
                    read += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        let finished = cursor.eof;
        if let Err(err) = outcome {
            let failed = connection.is_some_and(|c| self.connection_failed(c, browse));
            return Err(self.note(err, failed));
        }
        if finished {
            debug!("{} reached end of scan", id);
            self.release_cursor(id, false).await?;
        }
        Ok(())
    }

    pub async fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<(), DeviceError> {
        if self.transaction.is_some() {
            return Err(DeviceError::TransactionActive);
        }
        debug!("begin transaction ({:?})", isolation);
        self.transaction = Some(isolation);
        self.transaction_failed = false;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), DeviceError> {
        self.end_transaction(true).await
    }

    pub async fn rollback(&mut self) -> Result<(), DeviceError> {
        self.end_transaction(false).await
    }

    /// Releases every cursor holding an execute connection, then commits or
    /// rolls back each connection and closes it.
    async fn end_transaction(&mut self, commit: bool) -> Result<(), DeviceError> {
        let mut outcome = Ok(());
        for id in self.execute_pool.attached_cursors() {
            if let Err(err) = self.release_cursor(id, true).await
                && outcome.is_ok()
            {
                outcome = Err(err);
            }
        }
        let mut backend_error = None;
        for mut entry in self.execute_pool.take_all() {
            if entry.in_transaction {
                let failed = entry.connection.transaction_failed();
                let result = if commit {
                    entry.connection.commit().await
                } else if failed {
                    debug!("{}: transaction already rolled back", entry.id);
                    Ok(())
                } else {
                    entry.connection.rollback().await
                };
                if let Err(source) = result
                    && backend_error.is_none()
                {
                    backend_error = Some((source, failed || entry.connection.transaction_failed()));
                }
            }
            if let Err(err) = entry.connection.close().await {
                debug!("close of {} failed: {}", entry.id, err);
            }
        }
        info!("{} complete", if commit { "commit" } else { "rollback" });
        self.transaction = None;
        self.transaction_failed = false;
        if let Some((source, failed)) = backend_error {
            return Err(self.fail(source, failed));
        }
        outcome
    }

    /// Runs a statement plan; yields the affected row count.
    pub async fn execute(&mut self, plan: &LogicalQueryPlan, parameters: &HashMap<String, Value>) -> Result<u64, DeviceError> {
        let prepared = self.device.prepare(plan)?;
        let natives = cursor::bind_parameters(&self.device, &prepared, &prepared.sql.parameters, parameters, &[])?;
        let command = DriverCommand::new(prepared.sql.text.clone()).with_parameters(natives).with_timeout(self.timeout());
        let connection = self.request_connection(None, false).await?;
        let Some(entry) = self.execute_pool.get_mut(connection) else {
            return Err(DeviceError::PoolInvariant(format!("{} left the pool before execute", connection)));
        };
        let result = entry.connection.execute(&command).await;
        let failed = entry.connection.transaction_failed();
        match result {
            Ok(rows) => {
                debug!("{} affected {} rows", plan.kind_name(), rows);
                Ok(rows)
            }
            Err(source) => Err(self.fail(source, failed)),
        }
    }

    /// Opens a cursor over a table- or row-valued plan.
    pub async fn open_cursor(
        &mut self,
        plan: &LogicalQueryPlan,
        parameters: HashMap<String, Value>,
        cursor_type: CursorType,
        isolation: IsolationLevel,
    ) -> Result<CursorId, DeviceError> {
        let prepared = self.device.prepare(plan)?;
        if prepared.translated.kind == ResultKind::Statement {
            return Err(QueryAstError::NotTableValued(plan.kind_name()).into());
        }
        self.next_cursor += 1;
        let id = CursorId(self.next_cursor);
        self.cursors.insert(id, DeviceCursor::new(id, prepared, parameters, cursor_type, isolation));
        let opened = match self.attach(id).await {
            Ok(()) if self.config.batch_size == 0 => self.fill(id).await,
            other => other,
        };
        if let Err(err) = opened {
            if let Err(release) = self.release_cursor(id, false).await {
                debug!("release after failed open: {}", release);
            }
            self.cursors.remove(&id);
            return Err(err);
        }
        debug!("opened {} over {}", id, plan.kind_name());
        Ok(id)
    }

    /// Next row of cursor `id`, or `None` at end of scan.
    pub async fn next(&mut self, id: CursorId) -> Result<Option<Row>, DeviceError> {
        loop {
            if self.abort.is_cancelled() {
                return Err(DeviceError::Aborted);
            }
            let cursor = self.cursors.get_mut(&id).ok_or(DeviceError::CursorNotFound(id))?;
            if let Some(row) = cursor.buffer.pop_front() {
                cursor.delivered += 1;
                return Ok(Some(row));
            }
            if cursor.eof {
                return Ok(None);
            }
            self.fill(id).await?;
        }
    }

    pub async fn close_cursor(&mut self, id: CursorId) -> Result<(), DeviceError> {
        if !self.cursors.contains_key(&id) {
            return Err(DeviceError::CursorNotFound(id));
        }
        let released = self.release_cursor(id, false).await;
        self.cursors.remove(&id);
        released
    }

    /// Opens a reader over a deferred value produced by a cursor row.
    pub async fn read_stream(&mut self, id: StreamId) -> Result<Box<dyn Read + Send>, DeviceError> {
        let descriptor = self.streams.get(id).ok_or(DeviceError::StreamNotFound(id))?;
        let (command, isolation) = match &descriptor.source {
            StreamSource::Materialized(bytes) => return Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            StreamSource::Keyed { prepared, column, key_values, parameters, isolation } => {
                let command = stream::fetch_command(
                    &self.device,
                    prepared,
                    *column,
                    key_values,
                    parameters,
                    self.config.use_parameters_for_cursors,
                    self.timeout(),
                )?;
                (command, *isolation)
            }
        };
        let browse = isolation.is_browse();
        let connection = self.request_connection(None, browse).await?;
        let Some(entry) = self.pool_mut(browse).get_mut(connection) else {
            return Err(DeviceError::PoolInvariant(format!("{} left the pool while reading {}", connection, id)));
        };
        let result = fetch_deferred(entry.connection.as_mut(), &command, isolation).await;
        let failed = entry.connection.transaction_failed();
        if browse {
            self.detach_connection(connection, true).await;
        }
        match result {
            Ok(Some(reader)) => Ok(reader),
            Ok(None) => Err(DeviceError::StreamNotFound(id)),
            Err(source) => Err(self.fail(source, failed)),
        }
    }

    pub fn release_stream(&mut self, id: StreamId) -> Result<(), DeviceError> {
        if self.streams.release(id) { Ok(()) } else { Err(DeviceError::StreamNotFound(id)) }
    }

    /// Checks that every pooled connection and cursor agree on who owns what.
    pub fn check_pool_invariants(&self) -> Result<(), DeviceError> {
        let violation = |message: String| Err(DeviceError::PoolInvariant(message));
        let mut owners = HashMap::new();
        for (pool, browse) in [(&self.execute_pool, false), (&self.browse_pool, true)] {
            if pool.len() > pool.max() {
                return violation(format!("{} pool holds {} of {} connections", pool.name(), pool.len(), pool.max()));
            }
            for entry in pool.entries() {
                if browse && entry.in_transaction {
                    return violation(format!("browse connection {} is in a transaction", entry.id));
                }
                let Some(owner) = entry.cursor else { continue };
                if let Some(other) = owners.insert(owner, entry.id) {
                    return violation(format!("{} owns both {} and {}", owner, other, entry.id));
                }
                match self.cursors.get(&owner) {
                    Some(cursor) if cursor.connection == Some(entry.id) && cursor.is_browse() == browse => {}
                    Some(_) => return violation(format!("{} does not point back at {}", owner, entry.id)),
                    None => return violation(format!("{} is owned by unknown {}", entry.id, owner)),
                }
            }
        }
        for cursor in self.cursors.values() {
            if let Some(connection) = cursor.connection
                && owners.get(&cursor.id) != Some(&connection)
            {
                return violation(format!("{} claims {} without owning it", cursor.id, connection));
            }
        }
        Ok(())
    }

    /// Closes every cursor, rolls back any open transaction and disconnects.
    pub async fn close(&mut self) -> Result<(), DeviceError> {
        let ids: Vec<CursorId> = self.cursors.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.release_cursor(id, false).await {
                debug!("release of {} on close failed: {}", id, err);
            }
        }
        self.cursors.clear();
        let result = self.end_transaction(false).await;
        for entry in self.browse_pool.take_all() {
            if let Err(err) = entry.connection.close().await {
                debug!("close of {} failed: {}", entry.id, err);
            }
        }
        self.streams.clear();
        info!("session closed");
        result
    }
}
