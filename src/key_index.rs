/// KeyIndex: per-table ordered set of primary keys
///
/// Mirrors the keys the remote engine holds so existence checks and range
/// positions never need a round trip. Only keys are kept, never row bodies.

use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TetherError};
use crate::types::{DbKey, KeyType};

#[derive(Debug, Clone)]
pub struct KeyIndex {
    /// Sorted ascending, no duplicates
    keys: Vec<DbKey>,

    /// Fixed when the table is declared
    auto_increment: bool,

    /// Next auto-increment value; always above every integer key inserted.
    /// `None` once a key at `i64::MAX` has been seen.
    next_auto_increment: Option<i64>,
}

impl KeyIndex {
    pub fn new(auto_increment: bool) -> Self {
        Self {
            keys: Vec::new(),
            auto_increment,
            next_auto_increment: Some(1),
        }
    }

    pub fn auto_increment(&self) -> bool {
        self.auto_increment
    }

    pub fn next_auto_increment(&self) -> Option<i64> {
        self.next_auto_increment
    }

    /// Insert a key at its sorted position. No-op if already present.
    pub fn add(&mut self, key: DbKey) {
        self.bump_counter(&key);
        if let Err(pos) = self.keys.binary_search(&key) {
            self.keys.insert(pos, key);
        }
    }

    /// Remove a key by value. No-op if absent.
    pub fn remove(&mut self, key: &DbKey) {
        if let Ok(pos) = self.keys.binary_search(key) {
            self.keys.remove(pos);
        }
    }

    /// Position of `key` in the ordered sequence.
    pub fn index_of(&self, key: &DbKey) -> Option<usize> {
        self.keys.binary_search(key).ok()
    }

    pub fn contains(&self, key: &DbKey) -> bool {
        self.index_of(key).is_some()
    }

    pub fn keys(&self) -> &[DbKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// First position whose key is >= `key`.
    pub fn lower_bound(&self, key: &DbKey) -> usize {
        self.keys.partition_point(|k| k < key)
    }

    /// First position whose key is > `key`.
    pub fn upper_bound(&self, key: &DbKey) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    /// Produce a fresh key for a row that arrived without one.
    ///
    /// Auto-increment tables draw from the counter and advance it. Other
    /// tables synthesize an identifier suited to `key_type`.
    pub fn generate_key(&mut self, key_type: &KeyType) -> Result<DbKey> {
        if self.auto_increment {
            let Some(key) = self.next_auto_increment else {
                return Err(TetherError::NoPrimaryKey {
                    key_type: key_type.name().to_string(),
                });
            };
            self.next_auto_increment = key.checked_add(1);
            return Ok(DbKey::Int(key));
        }

        match key_type {
            KeyType::String | KeyType::Uuid => Ok(DbKey::Text(Uuid::new_v4().to_string())),
            KeyType::TimeId => Ok(DbKey::Text(time_id(false))),
            KeyType::TimeIdMs => Ok(DbKey::Text(time_id(true))),
            KeyType::Int | KeyType::Number | KeyType::Other(_) => Err(TetherError::NoPrimaryKey {
                key_type: key_type.name().to_string(),
            }),
        }
    }

    /// Bulk-set the ordered key set.
    ///
    /// Input order does not matter; the stored sequence is sorted and
    /// deduplicated. The counter is moved past the largest integer key.
    pub fn replace_all(&mut self, mut keys: Vec<DbKey>) {
        keys.sort();
        keys.dedup();
        if let Some(max) = keys.iter().filter_map(DbKey::as_int).max() {
            self.advance_past(max);
        }
        debug!("KeyIndex: replaced with {} keys", keys.len());
        self.keys = keys;
    }

    fn bump_counter(&mut self, key: &DbKey) {
        if !self.auto_increment {
            return;
        }
        if let Some(n) = key.as_int() {
            self.advance_past(n);
        }
    }

    /// Move the counter above `n`. Never wraps: past `i64::MAX` the
    /// counter is exhausted.
    fn advance_past(&mut self, n: i64) {
        if !self.auto_increment {
            return;
        }
        if let Some(next) = self.next_auto_increment {
            if n >= next {
                self.next_auto_increment = n.checked_add(1);
            }
        }
    }
}

/// Time-ordered identifier: zero-padded timestamp followed by random hex.
/// Lexical order follows creation time at the chosen resolution.
fn time_id(millis: bool) -> String {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let stamp = if millis {
        format!("{:013}", elapsed.as_millis())
    } else {
        format!("{:010}", elapsed.as_secs())
    };
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &random[..5])
}
