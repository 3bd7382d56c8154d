//! Rank-indexed skip list ordered by `(score, element)`.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Every
//! forward link carries a span (how many level-0 nodes it jumps over), which
//! is what makes positional lookups O(log n).

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const MAX_LEVEL: usize = 32;
const P: f64 = 0.25;

pub type NodeId = usize;

const HEAD: NodeId = 0;

/// Element ordering used to break ties between equal scores.
pub struct ZSetType<T> {
    pub less: fn(&T, &T) -> bool,
    pub equal: fn(&T, &T) -> bool,
}

impl<T> Clone for ZSetType<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ZSetType<T> {}

impl<T> std::fmt::Debug for ZSetType<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZSetType").finish_non_exhaustive()
    }
}

impl<T: Ord> ZSetType<T> {
    pub fn standard() -> Self {
        Self {
            less: less_std::<T>,
            equal: equal_std::<T>,
        }
    }
}

fn less_std<T: Ord>(a: &T, b: &T) -> bool {
    a < b
}

fn equal_std<T: Ord>(a: &T, b: &T) -> bool {
    a == b
}

#[derive(Debug, Clone, Copy, Default)]
struct Level {
    next: Option<NodeId>,
    span: usize,
}

#[derive(Debug)]
struct Node<T> {
    // None for the head sentinel and for free arena slots.
    ele: Option<T>,
    score: f64,
    prev: Option<NodeId>,
    levels: Vec<Level>,
}

impl<T> Node<T> {
    fn new(level: usize, score: f64, ele: Option<T>) -> Self {
        Self {
            ele,
            score,
            prev: None,
            levels: vec![Level::default(); level],
        }
    }
}

#[derive(Debug)]
pub struct SkipList<T> {
    ty: ZSetType<T>,
    nodes: Vec<Node<T>>,
    free: Vec<NodeId>,
    tail: Option<NodeId>,
    length: usize,
    level: usize,
    rng: StdRng,
}

impl<T: Ord> Default for SkipList<T> {
    fn default() -> Self {
        Self::new(ZSetType::standard())
    }
}

impl<T> SkipList<T> {
    pub fn new(ty: ZSetType<T>) -> Self {
        Self {
            ty,
            nodes: vec![Node::new(MAX_LEVEL, 0.0, None)],
            free: Vec::new(),
            tail: None,
            length: 0,
            level: 1,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn first(&self) -> Option<NodeId> {
        self.nodes[HEAD].levels[0].next
    }

    pub fn last(&self) -> Option<NodeId> {
        self.tail
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].levels[0].next
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].prev
    }

    pub fn score(&self, id: NodeId) -> f64 {
        self.nodes[id].score
    }

    pub fn element(&self, id: NodeId) -> Option<&T> {
        self.nodes[id].ele.as_ref()
    }

    /// Inserts `(score, ele)`; returns false if that exact pair is present.
    pub fn insert(&mut self, score: f64, ele: T) -> bool {
        let (mut update, mut rank) = self.descend(score, &ele);

        if let Some(next) = self.nodes[update[0]].levels[0].next {
            if self.matches(next, score, &ele) {
                return false;
            }
        }

        let level = self.random_level();
        if level > self.level {
            for i in self.level..level {
                rank[i] = 0;
                update[i] = HEAD;
                self.nodes[HEAD].levels[i].span = self.length;
            }
            self.level = level;
        }

        let id = self.alloc(Node::new(level, score, Some(ele)));
        for i in 0..level {
            let pred = update[i];
            let skipped = rank[0] - rank[i];
            let pred_level = self.nodes[pred].levels[i];

            self.nodes[id].levels[i] = Level {
                next: pred_level.next,
                span: pred_level.span - skipped,
            };
            self.nodes[pred].levels[i] = Level {
                next: Some(id),
                span: skipped + 1,
            };
        }
        for i in level..self.level {
            self.nodes[update[i]].levels[i].span += 1;
        }

        self.nodes[id].prev = (update[0] != HEAD).then_some(update[0]);
        match self.nodes[id].levels[0].next {
            Some(next) => self.nodes[next].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.length += 1;
        true
    }

    pub fn find(&self, score: f64, ele: &T) -> Option<NodeId> {
        let (update, _) = self.descend(score, ele);
        self.nodes[update[0]].levels[0]
            .next
            .filter(|&next| self.matches(next, score, ele))
    }

    pub fn delete(&mut self, score: f64, ele: &T) -> bool {
        let (update, _) = self.descend(score, ele);
        match self.nodes[update[0]].levels[0].next {
            Some(x) if self.matches(x, score, ele) => {
                self.unlink(x, &update);
                true
            }
            _ => false,
        }
    }

    /// Node at 0-based position `rank`.
    pub fn get_by_rank(&self, rank: usize) -> Option<NodeId> {
        if rank >= self.length {
            return None;
        }
        let target = rank + 1;
        let mut traversed = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].levels[i].next {
                let span = self.nodes[x].levels[i].span;
                if traversed + span > target {
                    break;
                }
                traversed += span;
                x = next;
            }
            if traversed == target {
                return Some(x);
            }
        }
        None
    }

    /// Resolves an inclusive, possibly negative, index range to its first
    /// node and element count. `None` when the range is empty.
    pub fn find_range(&self, start: i64, end: i64) -> Option<(NodeId, usize)> {
        let len = self.length as i64;
        if len == 0 || start >= len {
            return None;
        }
        let mut start = if start < -len { 0 } else { start };
        let mut end = end.min(len - 1);
        if end < -len {
            return None;
        }
        if start < 0 {
            start += len;
        }
        if end < 0 {
            end += len;
        }
        if end < start {
            return None;
        }

        let first = self.get_by_rank(start as usize)?;
        Some((first, (end - start + 1) as usize))
    }

    /// Walks the elements selected by [`SkipList::find_range`].
    pub fn range(&self, start: i64, end: i64) -> Range<'_, T> {
        let (cursor, remaining) = match self.find_range(start, end) {
            Some((first, count)) => (Some(first), count),
            None => (None, 0),
        };
        Range {
            list: self,
            cursor,
            remaining,
        }
    }

    pub fn iter(&self) -> Range<'_, T> {
        Range {
            list: self,
            cursor: self.first(),
            remaining: self.length,
        }
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen_bool(P) {
            level += 1;
        }
        level
    }

    // Strict (score, element) ordering of node `id` before the target.
    fn precedes(&self, id: NodeId, score: f64, ele: &T) -> bool {
        let node = &self.nodes[id];
        let (a, b) = (OrderedFloat(node.score), OrderedFloat(score));
        a < b || (a == b && node.ele.as_ref().is_some_and(|e| (self.ty.less)(e, ele)))
    }

    fn matches(&self, id: NodeId, score: f64, ele: &T) -> bool {
        let node = &self.nodes[id];
        OrderedFloat(node.score) == OrderedFloat(score)
            && node.ele.as_ref().is_some_and(|e| (self.ty.equal)(e, ele))
    }

    // Per level, the last node strictly before the target and its rank.
    fn descend(&self, score: f64, ele: &T) -> ([NodeId; MAX_LEVEL], [usize; MAX_LEVEL]) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];
        let mut x = HEAD;

        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.nodes[x].levels[i].next {
                if !self.precedes(next, score, ele) {
                    break;
                }
                rank[i] += self.nodes[x].levels[i].span;
                x = next;
            }
            update[i] = x;
        }
        (update, rank)
    }

    fn unlink(&mut self, x: NodeId, update: &[NodeId; MAX_LEVEL]) {
        for i in 0..self.level {
            let pred = update[i];
            if self.nodes[pred].levels[i].next == Some(x) {
                let removed = self.nodes[x].levels[i];
                let pred_level = &mut self.nodes[pred].levels[i];
                pred_level.span = pred_level.span + removed.span - 1;
                pred_level.next = removed.next;
            } else {
                self.nodes[pred].levels[i].span -= 1;
            }
        }

        let prev = self.nodes[x].prev;
        match self.nodes[x].levels[0].next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }

        while self.level > 1 && self.nodes[HEAD].levels[self.level - 1].next.is_none() {
            self.level -= 1;
        }
        self.length -= 1;
        self.release(x);
    }

    fn alloc(&mut self, node: Node<T>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id] = Node::new(0, 0.0, None);
        self.free.push(id);
    }
}

/// Forward walk over level-0 links.
pub struct Range<'a, T> {
    list: &'a SkipList<T>,
    cursor: Option<NodeId>,
    remaining: usize,
}

impl<'a, T> Iterator for Range<'a, T> {
    type Item = (&'a T, f64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.cursor?;
        let node = &self.list.nodes[id];
        self.cursor = node.levels[0].next;
        self.remaining -= 1;
        Some((node.ele.as_ref()?, node.score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &SkipList<String>, start: i64, end: i64) -> Vec<(String, f64)> {
        list.range(start, end).map(|(e, s)| (e.clone(), s)).collect()
    }

    fn check_spans(list: &SkipList<String>) {
        // Every level's spans must sum to the list length.
        for i in 0..list.level {
            let mut x = HEAD;
            let mut total = 0;
            while let Some(next) = list.nodes[x].levels[i].next {
                total += list.nodes[x].levels[i].span;
                x = next;
            }
            assert!(total <= list.len());
            if i == 0 {
                assert_eq!(total, list.len());
            }
        }
    }

    #[test]
    fn test_insert_orders_by_score_then_element() {
        let mut zsl = SkipList::default();
        assert!(zsl.insert(2.0, "b".to_string()));
        assert!(zsl.insert(1.0, "z".to_string()));
        assert!(zsl.insert(2.0, "a".to_string()));
        assert!(zsl.insert(0.5, "m".to_string()));

        let all = collect(&zsl, 0, -1);
        assert_eq!(
            all,
            vec![
                ("m".to_string(), 0.5),
                ("z".to_string(), 1.0),
                ("a".to_string(), 2.0),
                ("b".to_string(), 2.0),
            ]
        );
    }

    #[test]
    fn test_duplicate_pair_is_noop() {
        let mut zsl = SkipList::default();
        assert!(zsl.insert(1.0, "a".to_string()));
        assert!(!zsl.insert(1.0, "a".to_string()));
        assert!(zsl.insert(2.0, "a".to_string()));
        assert_eq!(zsl.len(), 2);
    }

    #[test]
    fn test_find_and_delete() {
        let mut zsl = SkipList::default();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            zsl.insert(i as f64, name.to_string());
        }

        let id = zsl.find(2.0, &"c".to_string()).unwrap();
        assert_eq!(zsl.element(id).map(String::as_str), Some("c"));
        assert!(zsl.find(2.0, &"x".to_string()).is_none());

        assert!(zsl.delete(2.0, &"c".to_string()));
        assert!(!zsl.delete(2.0, &"c".to_string()));
        assert_eq!(zsl.len(), 3);
        assert_eq!(
            collect(&zsl, 0, -1).into_iter().map(|(e, _)| e).collect::<Vec<_>>(),
            vec!["a", "b", "d"]
        );
        check_spans(&zsl);
    }

    #[test]
    fn test_tail_and_prev_links() {
        let mut zsl = SkipList::default();
        zsl.insert(1.0, "a".to_string());
        zsl.insert(3.0, "c".to_string());
        zsl.insert(2.0, "b".to_string());

        let tail = zsl.last().unwrap();
        assert_eq!(zsl.element(tail).map(String::as_str), Some("c"));
        let mid = zsl.prev(tail).unwrap();
        assert_eq!(zsl.element(mid).map(String::as_str), Some("b"));
        let first = zsl.prev(mid).unwrap();
        assert_eq!(zsl.prev(first), None);

        zsl.delete(3.0, &"c".to_string());
        assert_eq!(zsl.last(), Some(mid));
    }

    #[test]
    fn test_find_range_bounds() {
        let mut zsl = SkipList::default();
        for i in 0..5 {
            zsl.insert(i as f64, format!("e{i}"));
        }

        assert_eq!(zsl.find_range(5, 10), None);
        assert_eq!(zsl.find_range(3, 1), None);
        assert_eq!(zsl.find_range(0, -6), None);
        assert_eq!(zsl.find_range(1, 100).map(|(_, n)| n), Some(4));
        assert_eq!(zsl.find_range(-100, 1).map(|(_, n)| n), Some(2));

        let tail: Vec<_> = collect(&zsl, -2, -1).into_iter().map(|(e, _)| e).collect();
        assert_eq!(tail, vec!["e3", "e4"]);

        let empty: SkipList<String> = SkipList::default();
        assert_eq!(empty.find_range(0, -1), None);
        assert_eq!(empty.find_range(-1, -1), None);
    }

    #[test]
    fn test_rank_lookup_matches_traversal() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut zsl = SkipList::default();
        for i in 0..500 {
            let score = rng.gen_range(0..50) as f64;
            zsl.insert(score, format!("m{i}"));
        }
        check_spans(&zsl);

        let ordered: Vec<_> = collect(&zsl, 0, -1);
        assert_eq!(ordered.len(), 500);
        for pair in ordered.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(a.1 < b.1 || (a.1 == b.1 && a.0 < b.0), "{a:?} !< {b:?}");
        }
        for (i, expected) in ordered.iter().enumerate() {
            let id = zsl.get_by_rank(i).unwrap();
            assert_eq!(zsl.element(id), Some(&expected.0));
            assert_eq!(zsl.score(id), expected.1);
        }
    }

    #[test]
    fn test_delete_then_reinsert_restores_range() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut zsl = SkipList::default();
        let mut members = Vec::new();
        for i in 0..200 {
            let score = rng.gen_range(0..20) as f64;
            members.push((score, format!("m{i}")));
            zsl.insert(score, format!("m{i}"));
        }
        let before = collect(&zsl, 0, -1);

        for (score, name) in members.iter().step_by(3) {
            assert!(zsl.delete(*score, name));
        }
        check_spans(&zsl);
        for (score, name) in members.iter().step_by(3) {
            assert!(zsl.insert(*score, name.clone()));
        }
        check_spans(&zsl);

        assert_eq!(collect(&zsl, 0, -1), before);
        assert_eq!(collect(&zsl, 10, 20), before[10..=20].to_vec());
    }

    #[test]
    fn test_delete_all_shrinks_level() {
        let mut zsl = SkipList::default();
        for i in 0..100 {
            zsl.insert(i as f64, format!("m{i}"));
        }
        for i in 0..100 {
            assert!(zsl.delete(i as f64, &format!("m{i}")));
        }
        assert!(zsl.is_empty());
        assert_eq!(zsl.level, 1);
        assert_eq!(zsl.last(), None);
        assert_eq!(zsl.first(), None);
    }
}
