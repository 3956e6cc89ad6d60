use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::enums::DatabaseType;

use super::logical::LogicalQueryPlan;

/// Compiled plans keyed by their serialized form and target dialect. One
/// cache per device; entries never change once inserted.
pub struct PlanCache<V: Clone> {
    inner: Mutex<HashMap<String, V>>,
    capacity: usize,
}

impl<V: Clone> PlanCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(HashMap::new()), capacity }
    }

    /// `None` when the plan cannot be serialized; such plans are not cached.
    pub fn key(plan: &LogicalQueryPlan, db_type: DatabaseType) -> Option<String> {
        serde_json::to_string(plan).ok().map(|json| format!("{:?}::{}", db_type, json))
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().ok()?.get(key).cloned()
    }

    pub fn insert(&self, key: String, entry: V) {
        if let Ok(mut g) = self.inner.lock() {
            if g.len() >= self.capacity && !g.contains_key(&key) {
                g.clear();
            }
            g.insert(key, entry);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for PlanCache<V> {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::logical::{ColumnDef, TableVar};
    use crate::scalar_types::ScalarType;

    #[test]
    fn keys_differ_by_dialect_and_capacity_is_bounded() {
        let plan = LogicalQueryPlan::retrieve(TableVar::new("S", vec![ColumnDef::new("ID", ScalarType::Integer)]));
        let sqlite = PlanCache::<u32>::key(&plan, DatabaseType::SQLite).unwrap();
        let pg = PlanCache::<u32>::key(&plan, DatabaseType::PostgreSQL).unwrap();
        assert_ne!(sqlite, pg);

        let cache = PlanCache::new(1);
        cache.insert(sqlite.clone(), 1);
        assert_eq!(cache.get(&sqlite), Some(1));
        cache.insert(pg.clone(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&pg), Some(2));
    }
}
