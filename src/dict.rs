//! Chained hash dictionary with incremental rehashing.
//!
//! Two tables exist while a resize is in flight: `primary` and an `incoming`
//! table that is twice as large. Every lookup or insert migrates a bounded
//! number of buckets, so the cost of growing is spread across many calls
//! instead of one stop-the-world pass. Entries are boxed and linked into their
//! bucket intrusively; migration moves the box from one bucket list to another
//! without touching the key or value.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::DictError;

pub const INIT_SIZE: usize = 8;
const FORCE_RATIO: usize = 2;
const GROW_RATIO: usize = 2;
const DEFAULT_STEP: usize = 1;
const MAX_RANDOM_ATTEMPTS: usize = 1000;

/// Pluggable hashing and equality for dictionary keys.
pub struct DictType<K> {
    pub hash: fn(&K) -> u64,
    pub equal: fn(&K, &K) -> bool,
}

impl<K> Clone for DictType<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for DictType<K> {}

impl<K> std::fmt::Debug for DictType<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictType").finish_non_exhaustive()
    }
}

impl<K: Hash + Eq> DictType<K> {
    /// `Hash` + `Eq` based key semantics.
    pub fn standard() -> Self {
        Self {
            hash: hash_std::<K>,
            equal: equal_std::<K>,
        }
    }
}

pub fn hash_std<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn equal_std<K: Eq>(a: &K, b: &K) -> bool {
    a == b
}

#[derive(Debug)]
pub struct Entry<K, V> {
    link: LinkedListLink,
    hcode: u64,
    key: K,
    val: V,
}

impl<K, V> Entry<K, V> {
    fn new(hcode: u64, key: K, val: V) -> Box<Self> {
        Box::new(Self {
            link: LinkedListLink::new(),
            hcode,
            key,
            val,
        })
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn val(&self) -> &V {
        &self.val
    }
}

intrusive_adapter!(pub EntryAdapter<K, V> = Box<Entry<K, V>>: Entry<K, V> { link: LinkedListLink });

#[derive(Debug)]
struct HashTable<K, V> {
    buckets: Vec<LinkedList<EntryAdapter<K, V>>>,
    size: usize,
    mask: usize,
    used: usize,
}

impl<K, V> HashTable<K, V> {
    fn new(size: usize) -> Self {
        assert!(size.is_power_of_two());

        let buckets = (0..size)
            .map(|_| LinkedList::new(EntryAdapter::new()))
            .collect::<Vec<_>>();

        Self {
            buckets,
            size,
            mask: size - 1,
            used: 0,
        }
    }

    fn index(&self, hcode: u64) -> usize {
        (hcode as usize) & self.mask
    }

    fn push(&mut self, entry: Box<Entry<K, V>>) -> usize {
        let idx = self.index(entry.hcode);
        self.buckets[idx].push_front(entry);
        self.used += 1;
        idx
    }

    fn find(&self, hcode: u64, key: &K, equal: fn(&K, &K) -> bool) -> Option<&Entry<K, V>> {
        let mut cursor = self.buckets[self.index(hcode)].front();
        while let Some(entry) = cursor.get() {
            if entry.hcode == hcode && equal(&entry.key, key) {
                return Some(entry);
            }
            cursor.move_next();
        }
        None
    }

    fn remove(&mut self, hcode: u64, key: &K, equal: fn(&K, &K) -> bool) -> Option<Box<Entry<K, V>>> {
        let idx = self.index(hcode);
        let mut cursor = self.buckets[idx].front_mut();
        while let Some(entry) = cursor.get() {
            if entry.hcode == hcode && equal(&entry.key, key) {
                let removed = cursor.remove();
                if removed.is_some() {
                    self.used -= 1;
                }
                return removed;
            }
            cursor.move_next();
        }
        None
    }

    fn iter(&self) -> impl Iterator<Item = &Entry<K, V>> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }
}

/// Destination table of an in-flight rehash plus the next primary bucket to
/// migrate. Its presence is what "rehashing" means.
#[derive(Debug)]
struct Incoming<K, V> {
    table: HashTable<K, V>,
    cursor: usize,
}

#[derive(Debug)]
pub struct Dict<K, V> {
    ty: DictType<K>,
    primary: HashTable<K, V>,
    incoming: Option<Incoming<K, V>>,
    rng: StdRng,
}

impl<K: Hash + Eq, V> Default for Dict<K, V> {
    fn default() -> Self {
        Self::new(DictType::standard())
    }
}

impl<K, V> Dict<K, V> {
    pub fn new(ty: DictType<K>) -> Self {
        Self {
            ty,
            primary: HashTable::new(INIT_SIZE),
            incoming: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn is_rehashing(&self) -> bool {
        self.incoming.is_some()
    }

    /// Number of live entries across both tables.
    pub fn len(&self) -> usize {
        self.primary.used + self.incoming.as_ref().map_or(0, |inc| inc.table.used)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket count of the primary table.
    pub fn size(&self) -> usize {
        self.primary.size
    }

    /// Inserts `key` only if it is absent.
    pub fn insert_new(&mut self, key: K, val: V) -> Result<&Entry<K, V>, DictError> {
        let (in_incoming, idx) = self.add_raw(key, val).map_err(|_| DictError::KeyExists)?;
        let table = if in_incoming {
            &self.incoming.as_ref().expect("rehash in flight").table
        } else {
            &self.primary
        };
        Ok(table.buckets[idx]
            .front()
            .get()
            .expect("bucket holds the entry just pushed"))
    }

    /// Upsert. The previous value, if any, is dropped.
    pub fn set(&mut self, key: K, val: V) {
        let Err((key, val)) = self.add_raw(key, val) else {
            return;
        };

        let hcode = (self.ty.hash)(&key);
        let equal = self.ty.equal;
        if let Some(inc) = self.incoming.as_mut() {
            if let Some(mut entry) = inc.table.remove(hcode, &key, equal) {
                entry.val = val;
                inc.table.push(entry);
                return;
            }
        }
        if let Some(mut entry) = self.primary.remove(hcode, &key, equal) {
            entry.val = val;
            self.primary.push(entry);
        }
    }

    pub fn find(&mut self, key: &K) -> Option<&Entry<K, V>> {
        if self.is_rehashing() {
            self.rehash(DEFAULT_STEP);
        }
        let hcode = (self.ty.hash)(key);
        self.lookup(hcode, key)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.find(key).map(Entry::val)
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.find(key).is_some()
    }

    pub fn delete(&mut self, key: &K) -> Result<(), DictError> {
        if self.is_rehashing() {
            self.rehash(DEFAULT_STEP);
        }

        let hcode = (self.ty.hash)(key);
        let equal = self.ty.equal;
        if let Some(inc) = self.incoming.as_mut() {
            if inc.table.remove(hcode, key, equal).is_some() {
                return Ok(());
            }
        }
        match self.primary.remove(hcode, key, equal) {
            Some(_) => Ok(()),
            None => Err(DictError::NotFound),
        }
    }

    /// Best-effort uniform sample used by expiry. Gives up after
    /// `MAX_RANDOM_ATTEMPTS` empty buckets, so it may return `None` on a
    /// non-empty but sparse dictionary.
    pub fn random_entry(&mut self) -> Option<&Entry<K, V>> {
        if self.is_empty() {
            return None;
        }
        if self.is_rehashing() {
            self.rehash(DEFAULT_STEP);
        }

        let primary_size = self.primary.size;
        let (span, offset) = match &self.incoming {
            None => (primary_size, 0),
            Some(inc) => (primary_size - inc.cursor + inc.table.size, inc.cursor),
        };

        let mut hit = None;
        for _ in 0..MAX_RANDOM_ATTEMPTS {
            let mut idx = self.rng.gen_range(0..span) + offset;
            let table = if idx >= primary_size {
                idx -= primary_size;
                &self.incoming.as_ref()?.table
            } else {
                &self.primary
            };
            if !table.buckets[idx].is_empty() {
                hit = Some((table, idx));
                break;
            }
        }

        let (table, idx) = hit?;
        let chain_len = table.buckets[idx].iter().count();
        let pick = self.rng.gen_range(0..chain_len);
        table.buckets[idx].iter().nth(pick)
    }

    /// Migrates up to `n` non-empty buckets from the primary table into the
    /// incoming one. Empty buckets are skipped without counting against `n`.
    pub fn rehash(&mut self, mut n: usize) {
        let Some(inc) = self.incoming.as_mut() else {
            return;
        };

        while n > 0 && self.primary.used > 0 {
            while self.primary.buckets[inc.cursor].is_empty() {
                inc.cursor += 1;
            }
            while let Some(entry) = self.primary.buckets[inc.cursor].pop_front() {
                self.primary.used -= 1;
                inc.table.push(entry);
            }
            inc.cursor += 1;
            n -= 1;
        }

        if self.primary.used == 0 {
            if let Some(inc) = self.incoming.take() {
                debug!(size = inc.table.size, "rehash complete");
                self.primary = inc.table;
            }
        }
    }

    /// Starts a rehash into a table of at least `size` buckets.
    pub fn expand(&mut self, size: usize) -> Result<(), DictError> {
        let requested = next_power(size);
        if self.is_rehashing() || self.primary.size >= requested {
            return Err(DictError::Expand {
                requested,
                current: self.primary.size,
            });
        }

        debug!(from = self.primary.size, to = requested, "dict expand");
        self.incoming = Some(Incoming {
            table: HashTable::new(requested),
            cursor: 0,
        });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<K, V>> {
        let incoming = self.incoming.as_ref().map(|inc| inc.table.iter()).into_iter().flatten();
        self.primary.iter().chain(incoming)
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        let (used, size) = (self.primary.used, self.primary.size);
        if used > size && used / size > FORCE_RATIO {
            // Cannot fail: not rehashing and the target is strictly larger.
            let _ = self.expand(size * GROW_RATIO);
        }
    }

    fn lookup(&self, hcode: u64, key: &K) -> Option<&Entry<K, V>> {
        if let Some(inc) = &self.incoming {
            if let Some(entry) = inc.table.find(hcode, key, self.ty.equal) {
                return Some(entry);
            }
        }
        self.primary.find(hcode, key, self.ty.equal)
    }

    // Returns which table received the entry and its bucket, or gives the
    // pair back if the key is already present.
    fn add_raw(&mut self, key: K, val: V) -> Result<(bool, usize), (K, V)> {
        if self.is_rehashing() {
            self.rehash(DEFAULT_STEP);
        }
        self.expand_if_needed();

        let hcode = (self.ty.hash)(&key);
        if self.lookup(hcode, &key).is_some() {
            return Err((key, val));
        }

        let entry = Entry::new(hcode, key, val);
        Ok(match self.incoming.as_mut() {
            Some(inc) => (true, inc.table.push(entry)),
            None => (false, self.primary.push(entry)),
        })
    }
}

fn next_power(size: usize) -> usize {
    size.max(INIT_SIZE).next_power_of_two()
}
