use crate::core::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rows keyed by a `u64` primary key.
///
/// Auto-increment tables take their next key from `peek_next_id`; tables
/// keyed by an external id (members) bring their own. `insert_keyed` keeps
/// `next_row_id` ahead of every key ever stored, so replayed and fresh rows
/// never collide and removed keys are never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table<R> {
    name: String,
    rows: BTreeMap<u64, R>,
    next_row_id: u64,
}

impl<R> Table<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
            next_row_id: 1,
        }
    }

    /// Key the next auto-increment insert should use
    pub fn peek_next_id(&self) -> u64 {
        self.next_row_id
    }

    pub fn insert_keyed(&mut self, key: u64, row: R) -> Result<&R> {
        if self.rows.contains_key(&key) {
            return Err(TrackerError::ConstraintViolation(format!(
                "Primary key {} already exists in table '{}'",
                key, self.name
            )));
        }
        self.next_row_id = self.next_row_id.max(key.saturating_add(1));
        Ok(self.rows.entry(key).or_insert(row))
    }

    pub fn get(&self, key: u64) -> Option<&R> {
        self.rows.get(&key)
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut R> {
        self.rows.get_mut(&key)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.rows.contains_key(&key)
    }

    pub fn remove(&mut self, key: u64) -> Option<R> {
        self.rows.remove(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.rows.keys().copied()
    }

    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
