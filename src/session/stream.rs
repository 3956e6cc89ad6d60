//! Deferred stream bridge.
//!
//! Large-object columns are not read with their row. The cursor registers a
//! descriptor instead, and the value is fetched when the caller reads it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::device::{Device, PreparedPlan};
use crate::driver::DriverCommand;
use crate::models::enums::IsolationLevel;
use crate::query_ast::ast::Statement;
use crate::query_ast::rewrite;
use crate::value::{StreamId, Value};

use super::cursor::{bind_parameters, key_columns, key_values, select_of};
use super::errors::DeviceError;

pub enum StreamSource {
    /// Bytes already read, used when the row has no key to find it again.
    Materialized(Vec<u8>),
    /// A single-row query over the cursor's statement, keyed by `key_values`.
    Keyed {
        prepared: Arc<PreparedPlan>,
        column: usize,
        key_values: Vec<Value>,
        parameters: HashMap<String, Value>,
        isolation: IsolationLevel,
    },
}

pub struct StreamDescriptor {
    pub id: StreamId,
    pub source: StreamSource,
}

#[derive(Default)]
pub struct StreamRegistry {
    next_id: u64,
    descriptors: HashMap<StreamId, StreamDescriptor>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: StreamSource) -> StreamId {
        self.next_id += 1;
        let id = StreamId(self.next_id);
        self.descriptors.insert(id, StreamDescriptor { id, source });
        id
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamDescriptor> {
        self.descriptors.get(&id)
    }

    pub fn release(&mut self, id: StreamId) -> bool {
        self.descriptors.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn clear(&mut self) {
        self.descriptors.clear();
    }
}

/// Single-row, single-column query reading `column` of the keyed row.
pub(crate) fn fetch_command(
    device: &Device,
    prepared: &PreparedPlan,
    column: usize,
    key: &[Value],
    parameters: &HashMap<String, Value>,
    use_parameters: bool,
    timeout: Option<Duration>,
) -> Result<DriverCommand, DeviceError> {
    let order = &prepared.translated.order;
    let (expressions, bindings) = key_values(device, order, key, use_parameters)?;
    let fetch = rewrite::deferred_fetch(
        select_of(prepared)?,
        prepared.translated.is_aggregate,
        column,
        &key_columns(order),
        &expressions,
    )?;
    let sql = device.emit(&Statement::Select(fetch))?;
    let natives = bind_parameters(device, prepared, &sql.parameters, parameters, &bindings)?;
    Ok(DriverCommand::new(sql.text).with_parameters(natives).with_timeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::enums::DatabaseType;
    use crate::query_ast::logical::{ColumnDef, LogicalQueryPlan, SortColumn, TableVar};
    use crate::scalar_types::ScalarType;

    #[test]
    fn fetch_selects_one_column_of_the_keyed_row() {
        let device = Device::new(DatabaseType::SQLite);
        let plan = LogicalQueryPlan::retrieve(TableVar::new(
            "Docs",
            vec![ColumnDef::new("ID", ScalarType::Integer), ColumnDef::new("Body", ScalarType::Text)],
        ))
        .order(vec![SortColumn::asc("ID")]);
        let prepared = device.prepare(&plan).unwrap();
        assert!(prepared.translated.columns[1].deferred);

        let command =
            fetch_command(&device, &prepared, 1, &[Value::Integer(4)], &HashMap::new(), false, None).unwrap();
        assert!(!command.is_cursor);
        assert!(command.text.starts_with("SELECT `T1`.`Body` FROM"), "{}", command.text);
        assert!(!command.text.contains("ORDER BY"), "{}", command.text);
        assert!(command.text.contains("= 4"), "{}", command.text);
    }

    #[test]
    fn ids_are_not_reused_after_release() {
        let mut streams = StreamRegistry::new();
        let first = streams.register(StreamSource::Materialized(b"abc".to_vec()));
        assert!(streams.release(first));
        assert!(!streams.release(first));
        let second = streams.register(StreamSource::Materialized(Vec::new()));
        assert_ne!(first, second);
        assert_eq!(streams.len(), 1);
        assert!(matches!(
            streams.get(second).map(|d| &d.source),
            Some(StreamSource::Materialized(bytes)) if bytes.is_empty()
        ));
    }
}
