use crate::driver::DriverError;
use crate::query_ast::errors::{QueryAstError, RewriteError};
use crate::scalar_types::TypeMapError;
use crate::value::StreamId;

use super::cursor::CursorId;

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    /// A backend call failed. `transaction_failed` is set when the backend has
    /// already rolled the transaction back.
    #[error("backend error: {source}")]
    Backend {
        #[source]
        source: DriverError,
        transaction_failed: bool,
    },
    #[error("cursor has no key columns to restart its scan from")]
    RestartRequiresKey,
    /// The scan stopped on a NULL in sort key `.0` and the backend's NULL
    /// placement for that key is unknown, so no predicate can resume past it.
    #[error("cannot restart past a NULL in sort key {0}: NULL placement is unknown")]
    NullPlacementUnknown(usize),
    #[error("deferred stream {0} not found")]
    StreamNotFound(StreamId),
    #[error("cursor {0} not found")]
    CursorNotFound(CursorId),
    #[error("operation aborted")]
    Aborted,
    #[error("no connection available in the {0} pool")]
    PoolExhausted(&'static str),
    #[error("a transaction is already in progress")]
    TransactionActive,
    #[error("no value supplied for parameter {0}")]
    MissingParameter(String),
    #[error("pool invariant violated: {0}")]
    PoolInvariant(String),
    #[error(transparent)]
    Translate(#[from] QueryAstError),
    #[error(transparent)]
    TypeMap(#[from] TypeMapError),
    #[error("failed to read deferred value: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    pub fn is_transaction_failed(&self) -> bool {
        matches!(self, DeviceError::Backend { transaction_failed: true, .. })
    }
}

impl From<DriverError> for DeviceError {
    fn from(source: DriverError) -> Self {
        DeviceError::Backend { source, transaction_failed: false }
    }
}

impl From<RewriteError> for DeviceError {
    fn from(err: RewriteError) -> Self {
        match err {
            RewriteError::NoKey => DeviceError::RestartRequiresKey,
            RewriteError::NullPlacementUnknown(key) => DeviceError::NullPlacementUnknown(key),
            other => DeviceError::Translate(other.into()),
        }
    }
}
