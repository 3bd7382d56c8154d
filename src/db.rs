//! Keyspace: values plus absolute expiry deadlines.
//!
//! Expired keys are removed lazily when read and, in the background, by
//! sampling the expire dictionary from a periodic timer.

use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::dict::Dict;
use crate::object::Obj;

pub const EXPIRE_CHECK_COUNT: usize = 100;

#[derive(Debug, Default)]
pub struct Db {
    data: Dict<Bytes, Rc<Obj>>,
    expire: Dict<Bytes, u64>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of keys carrying a deadline.
    pub fn expires(&self) -> usize {
        self.expire.len()
    }

    /// Deletes `key` if its deadline has passed. Returns true if it did.
    pub fn expire_if_needed(&mut self, key: &Bytes, now_ms: u64) -> bool {
        let due = matches!(self.expire.get(key), Some(&when) if when <= now_ms);
        if due {
            trace!(key = ?key, "lazy expire");
            self.delete(key);
        }
        due
    }

    /// Value for `key`, honoring expiry.
    pub fn lookup_read(&mut self, key: &Bytes, now_ms: u64) -> Option<Rc<Obj>> {
        self.expire_if_needed(key, now_ms);
        self.data.get(key).cloned()
    }

    /// Stores `val`, dropping any previous value and deadline.
    pub fn set(&mut self, key: Bytes, val: Rc<Obj>) {
        let _ = self.expire.delete(&key);
        self.data.set(key, val);
    }

    /// Sets an absolute deadline. Keys that do not exist, or whose current
    /// deadline has already passed at `now_ms`, are left without one.
    pub fn set_expire(&mut self, key: &Bytes, when_ms: u64, now_ms: u64) -> bool {
        self.expire_if_needed(key, now_ms);
        if !self.data.contains_key(key) {
            return false;
        }
        self.expire.set(key.clone(), when_ms);
        true
    }

    pub fn delete(&mut self, key: &Bytes) -> bool {
        let _ = self.expire.delete(key);
        self.data.delete(key).is_ok()
    }

    /// Samples up to `EXPIRE_CHECK_COUNT` keys with deadlines and deletes
    /// those that are due. Returns how many were removed.
    pub fn active_expire_cycle(&mut self, now_ms: u64) -> usize {
        let mut removed = 0;
        for _ in 0..EXPIRE_CHECK_COUNT {
            let due = match self.expire.random_entry() {
                None => break,
                Some(entry) if *entry.val() <= now_ms => entry.key().clone(),
                Some(_) => continue,
            };
            self.delete(&due);
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, remaining = self.expire.len(), "active expire");
        }
        removed
    }
}
