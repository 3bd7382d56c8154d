use std::cell::RefCell;
use std::collections::VecDeque;

use bytes::Bytes;

use crate::dict::Dict;
use crate::skiplist::{Range, SkipList};

/// A stored value. Held behind `Rc` in the keyspace; aggregate types use a
/// `RefCell` so commands can mutate them through a shared handle.
#[derive(Debug)]
pub enum Obj {
    Str(Bytes),
    List(RefCell<VecDeque<Bytes>>),
    ZSet(RefCell<ZSet>),
}

impl Obj {
    pub fn new_list() -> Self {
        Obj::List(RefCell::new(VecDeque::new()))
    }

    pub fn new_zset() -> Self {
        Obj::ZSet(RefCell::new(ZSet::new()))
    }
}

/// Sorted set: members ordered by `(score, member)` in a skip list, plus a
/// member-to-score index so updates can find the old position.
#[derive(Debug, Default)]
pub struct ZSet {
    zsl: SkipList<Bytes>,
    scores: Dict<Bytes, f64>,
}

impl ZSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&mut self, member: &Bytes) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Adds `member` or moves it to `score`. Returns true for a new member.
    pub fn add(&mut self, score: f64, member: Bytes) -> bool {
        match self.score(&member) {
            Some(old) if old == score => false,
            Some(old) => {
                self.zsl.delete(old, &member);
                self.zsl.insert(score, member.clone());
                self.scores.set(member, score);
                false
            }
            None => {
                self.zsl.insert(score, member.clone());
                self.scores.set(member, score);
                true
            }
        }
    }

    /// Members at inclusive positions `start..=end`; negative indexes count
    /// from the end.
    pub fn range(&self, start: i64, end: i64) -> Range<'_, Bytes> {
        self.zsl.range(start, end)
    }
}
