//! Connection pools of a session.
//!
//! A pool is an ordered list: idle entries are reused front first, and a
//! stolen entry moves to the tail so the next steal picks a different cursor.

use std::fmt;

use crate::driver::DriverConnection;

use super::cursor::CursorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

pub struct PoolEntry {
    pub id: ConnectionId,
    pub connection: Box<dyn DriverConnection>,
    /// The cursor that owns this connection, if any.
    pub cursor: Option<CursorId>,
    pub in_transaction: bool,
}

impl PoolEntry {
    pub fn new(id: ConnectionId, connection: Box<dyn DriverConnection>) -> Self {
        Self { id, connection, cursor: None, in_transaction: false }
    }

    pub fn is_idle(&self) -> bool {
        self.cursor.is_none()
    }
}

pub struct ConnectionPool {
    name: &'static str,
    entries: Vec<PoolEntry>,
    max: usize,
}

impl ConnectionPool {
    pub fn new(name: &'static str, max: usize) -> Self {
        Self { name, entries: Vec::new(), max }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn get(&self, id: ConnectionId) -> Option<&PoolEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut PoolEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    pub fn push(&mut self, entry: PoolEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<PoolEntry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Removes idle entries whose connection is no longer usable.
    pub fn take_invalid_idle(&mut self) -> Vec<PoolEntry> {
        let (invalid, keep) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.is_idle() && !e.connection.is_valid());
        self.entries = keep;
        invalid
    }

    pub fn first_idle(&self) -> Option<ConnectionId> {
        self.entries.iter().find(|e| e.is_idle()).map(|e| e.id)
    }

    /// First entry owned by a cursor other than `requester`.
    pub fn steal_candidate(&self, requester: Option<CursorId>) -> Option<(ConnectionId, CursorId)> {
        self.entries.iter().find_map(|e| match e.cursor {
            Some(owner) if Some(owner) != requester => Some((e.id, owner)),
            _ => None,
        })
    }

    pub fn move_to_tail(&mut self, id: ConnectionId) {
        if let Some(index) = self.entries.iter().position(|e| e.id == id) {
            let entry = self.entries.remove(index);
            self.entries.push(entry);
        }
    }

    pub fn attached_cursors(&self) -> Vec<CursorId> {
        self.entries.iter().filter_map(|e| e.cursor).collect()
    }

    pub fn take_all(&mut self) -> Vec<PoolEntry> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCommand, DriverCursor, DriverError};
    use crate::models::enums::{CursorType, IsolationLevel};
    use async_trait::async_trait;

    struct Idle {
        valid: bool,
    }

    #[async_trait]
    impl DriverConnection for Idle {
        async fn execute(&mut self, _command: &DriverCommand) -> Result<u64, DriverError> {
            Ok(0)
        }

        async fn open_cursor(
            &mut self,
            _command: &DriverCommand,
            _cursor_type: CursorType,
            _isolation: IsolationLevel,
        ) -> Result<Box<dyn DriverCursor>, DriverError> {
            Err(DriverError::Closed)
        }

        async fn begin_transaction(&mut self, _isolation: IsolationLevel) -> Result<(), DriverError> {
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        fn is_valid(&self) -> bool {
            self.valid
        }

        fn transaction_failed(&self) -> bool {
            false
        }

        async fn close(self: Box<Self>) -> Result<(), DriverError> {
            Ok(())
        }
    }

    fn pool_of(owners: &[Option<u64>]) -> ConnectionPool {
        let mut pool = ConnectionPool::new("execute", owners.len());
        for (i, owner) in owners.iter().enumerate() {
            let mut entry = PoolEntry::new(ConnectionId(i as u64), Box::new(Idle { valid: true }));
            entry.cursor = owner.map(CursorId);
            pool.push(entry);
        }
        pool
    }

    #[test]
    fn steal_skips_the_requesting_cursor() {
        let pool = pool_of(&[Some(1), Some(2)]);
        assert_eq!(pool.steal_candidate(Some(CursorId(1))), Some((ConnectionId(1), CursorId(2))));
        assert_eq!(pool.steal_candidate(None), Some((ConnectionId(0), CursorId(1))));
        assert!(pool.is_full());
        assert_eq!(pool.first_idle(), None);
    }

    #[test]
    fn stolen_entry_moves_to_the_tail() {
        let mut pool = pool_of(&[Some(1), Some(2), Some(3)]);
        pool.move_to_tail(ConnectionId(0));
        let order: Vec<_> = pool.entries().iter().map(|e| e.id.0).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert_eq!(pool.steal_candidate(Some(CursorId(3))), Some((ConnectionId(1), CursorId(2))));
    }

    #[test]
    fn invalid_idle_entries_are_discarded() {
        let mut pool = ConnectionPool::new("browse", 3);
        pool.push(PoolEntry::new(ConnectionId(1), Box::new(Idle { valid: false })));
        let mut busy = PoolEntry::new(ConnectionId(2), Box::new(Idle { valid: false }));
        busy.cursor = Some(CursorId(9));
        pool.push(busy);
        pool.push(PoolEntry::new(ConnectionId(3), Box::new(Idle { valid: true })));

        let dropped = pool.take_invalid_idle();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, ConnectionId(1));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.first_idle(), Some(ConnectionId(3)));
    }
}
