//! Ordered record index.
//!
//! A red-black tree over an arena of nodes. Records are ordered by key
//! and, for indexes that allow duplicate keys, by value after that.
//!
//! Deletion only marks a node as a tombstone. Tombstones keep their
//! position in the order, so a later insert of an equal record revives
//! the node in place. Once tombstones make up more than
//! `tombstone_ratio` of all nodes, the tree is rebuilt from its live
//! records into a balanced shape, which is why no delete fix-up exists.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;
use tracing::trace;

use crate::key::{compare, Key};
use crate::key_range::KeyRange;

/// Default fraction of tombstoned nodes that triggers a rebuild.
pub const DEFAULT_TOMBSTONE_RATIO: f64 = 2.0 / 3.0;

/// A record: a key and the value stored under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<V> {
    pub key: Key,
    pub value: V,
}

impl<V> Record<V> {
    pub fn new(key: Key, value: V) -> Self {
        Self { key, value }
    }
}

/// Values that can break ties between records with equal keys.
pub trait RecordValue: Clone + fmt::Debug {
    fn compare_value(&self, other: &Self) -> Ordering;
}

impl RecordValue for Key {
    fn compare_value(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl RecordValue for JsonValue {
    /// Documents are only stored in unique-key indexes and never compared.
    fn compare_value(&self, _other: &Self) -> Ordering {
        Ordering::Equal
    }
}

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

type NodeId = usize;

#[derive(Debug, Clone)]
struct Node<V> {
    record: Record<V>,
    color: Color,
    left: Option<NodeId>,
    right: Option<NodeId>,
    parent: Option<NodeId>,
    tombstone: bool,
}

/// Ordered index of records.
#[derive(Debug, Clone)]
pub struct OrderedIndex<V> {
    nodes: Vec<Node<V>>,
    root: Option<NodeId>,
    /// Order by key only.
    unique: bool,
    live: usize,
    tombstones: usize,
    tombstone_ratio: f64,
}

impl<V: RecordValue> OrderedIndex<V> {
    /// Create an empty index. `unique` indexes order by key alone.
    pub fn new(unique: bool) -> Self {
        Self::with_tombstone_ratio(unique, DEFAULT_TOMBSTONE_RATIO)
    }

    /// Create an empty index with a custom rebuild threshold.
    pub fn with_tombstone_ratio(unique: bool, tombstone_ratio: f64) -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            unique,
            live: 0,
            tombstones: 0,
            tombstone_ratio,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of tombstoned nodes awaiting compaction.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    fn order(&self, key: &Key, value: &V, other: &Record<V>) -> Ordering {
        match compare(key, &other.key) {
            Ordering::Equal if !self.unique => value.compare_value(&other.value),
            order => order,
        }
    }

    // ==================== Lookup ====================

    /// First record inside `range`.
    pub fn get(&self, range: &KeyRange) -> Option<&Record<V>> {
        self.iter(range, ScanDirection::Forward).next()
    }

    /// Whether a live record has exactly this key.
    pub fn contains_key(&self, key: &Key) -> bool {
        self.get(&KeyRange::from(key.clone())).is_some()
    }

    /// Number of live records inside `range`.
    pub fn count(&self, range: &KeyRange) -> usize {
        self.iter(range, ScanDirection::Forward).count()
    }

    /// Iterate records inside `range` in the given direction.
    pub fn iter(&self, range: &KeyRange, direction: ScanDirection) -> Iter<'_, V> {
        let start = match direction {
            ScanDirection::Forward => self.seek_first(range),
            ScanDirection::Backward => self.seek_last(range),
        };
        Iter {
            index: self,
            next: start,
            range: range.clone(),
            direction,
        }
    }

    /// Iterate every record in ascending order.
    pub fn iter_all(&self) -> Iter<'_, V> {
        self.iter(&KeyRange::unbounded(), ScanDirection::Forward)
    }

    fn find_exact(&self, key: &Key, value: &V) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            let node = &self.nodes[id];
            cur = match self.order(key, value, &node.record) {
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
                Ordering::Equal => return Some(id),
            };
        }
        None
    }

    /// Leftmost node whose key is not below the range.
    fn seek_first(&self, range: &KeyRange) -> Option<NodeId> {
        let mut cur = self.root;
        let mut candidate = None;
        while let Some(id) = cur {
            let node = &self.nodes[id];
            if range.is_below(&node.record.key) {
                cur = node.right;
            } else {
                candidate = Some(id);
                cur = node.left;
            }
        }
        candidate
    }

    /// Rightmost node whose key is not above the range.
    fn seek_last(&self, range: &KeyRange) -> Option<NodeId> {
        let mut cur = self.root;
        let mut candidate = None;
        while let Some(id) = cur {
            let node = &self.nodes[id];
            if range.is_above(&node.record.key) {
                cur = node.left;
            } else {
                candidate = Some(id);
                cur = node.right;
            }
        }
        candidate
    }

    fn successor(&self, id: NodeId) -> Option<NodeId> {
        if let Some(mut cur) = self.nodes[id].right {
            while let Some(left) = self.nodes[cur].left {
                cur = left;
            }
            return Some(cur);
        }
        let mut child = id;
        let mut parent = self.nodes[id].parent;
        while let Some(p) = parent {
            if self.nodes[p].right != Some(child) {
                break;
            }
            child = p;
            parent = self.nodes[p].parent;
        }
        parent
    }

    fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        if let Some(mut cur) = self.nodes[id].left {
            while let Some(right) = self.nodes[cur].right {
                cur = right;
            }
            return Some(cur);
        }
        let mut child = id;
        let mut parent = self.nodes[id].parent;
        while let Some(p) = parent {
            if self.nodes[p].left != Some(child) {
                break;
            }
            child = p;
            parent = self.nodes[p].parent;
        }
        parent
    }

    fn live_ids(&self, range: &KeyRange) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut cur = self.seek_first(range);
        while let Some(id) = cur {
            let node = &self.nodes[id];
            if range.is_above(&node.record.key) {
                break;
            }
            if !node.tombstone {
                ids.push(id);
            }
            cur = self.successor(id);
        }
        ids
    }

    // ==================== Mutation ====================

    /// Insert a record.
    ///
    /// Callers check uniqueness first; inserting a record equal to a live
    /// one under the index order replaces it.
    pub fn insert(&mut self, record: Record<V>) {
        let mut parent = None;
        let mut went_left = false;
        let mut cur = self.root;

        while let Some(id) = cur {
            let node = &self.nodes[id];
            match self.order(&record.key, &record.value, &node.record) {
                Ordering::Less => {
                    parent = Some(id);
                    went_left = true;
                    cur = node.left;
                }
                Ordering::Greater => {
                    parent = Some(id);
                    went_left = false;
                    cur = node.right;
                }
                Ordering::Equal => {
                    let node = &mut self.nodes[id];
                    if node.tombstone {
                        node.tombstone = false;
                        self.tombstones -= 1;
                        self.live += 1;
                    }
                    node.record = record;
                    return;
                }
            }
        }

        let id = self.nodes.len();
        self.nodes.push(Node {
            record,
            color: Color::Red,
            left: None,
            right: None,
            parent,
            tombstone: false,
        });
        match parent {
            None => self.root = Some(id),
            Some(p) if went_left => self.nodes[p].left = Some(id),
            Some(p) => self.nodes[p].right = Some(id),
        }
        self.live += 1;
        self.insert_fixup(id);
    }

    /// Remove every record whose key is inside `range`.
    pub fn delete_range(&mut self, range: &KeyRange) -> Vec<Record<V>> {
        let ids = self.live_ids(range);
        let removed = ids
            .iter()
            .map(|&id| {
                let node = &mut self.nodes[id];
                node.tombstone = true;
                node.record.clone()
            })
            .collect::<Vec<_>>();
        self.live -= removed.len();
        self.tombstones += removed.len();
        self.maybe_compact();
        removed
    }

    /// Remove every record with exactly this key.
    pub fn delete_key(&mut self, key: &Key) -> Vec<Record<V>> {
        self.delete_range(&KeyRange::from(key.clone()))
    }

    /// Remove the record equal to `(key, value)` under the index order.
    pub fn delete_record(&mut self, key: &Key, value: &V) -> Option<Record<V>> {
        let id = self.find_exact(key, value)?;
        let node = &mut self.nodes[id];
        if node.tombstone {
            return None;
        }
        node.tombstone = true;
        let record = node.record.clone();
        self.live -= 1;
        self.tombstones += 1;
        self.maybe_compact();
        Some(record)
    }

    /// Remove every record, returning them in ascending order.
    pub fn clear(&mut self) -> Vec<Record<V>> {
        let removed = self.iter_all().cloned().collect();
        self.nodes.clear();
        self.root = None;
        self.live = 0;
        self.tombstones = 0;
        removed
    }

    fn maybe_compact(&mut self) {
        if self.tombstones == 0 {
            return;
        }
        if (self.tombstones as f64) > (self.nodes.len() as f64) * self.tombstone_ratio {
            trace!(
                live = self.live,
                tombstones = self.tombstones,
                "Rebuilding ordered index"
            );
            self.rebuild();
        }
    }

    /// Rebuild a balanced tree from the live records.
    fn rebuild(&mut self) {
        let order = self.live_ids(&KeyRange::unbounded());
        let mut old: Vec<Option<Node<V>>> =
            std::mem::take(&mut self.nodes).into_iter().map(Some).collect();

        self.nodes = order
            .into_iter()
            .filter_map(|id| old[id].take())
            .map(|node| Node {
                record: node.record,
                color: Color::Black,
                left: None,
                right: None,
                parent: None,
                tombstone: false,
            })
            .collect();
        self.live = self.nodes.len();
        self.tombstones = 0;

        let count = self.nodes.len();
        // Nodes on the deepest level are red; every nil then sits below
        // the same number of black nodes.
        let red_depth = if count > 1 { Some(count.ilog2()) } else { None };
        self.root = self.link(0, count, None, 0, red_depth);
    }

    fn link(
        &mut self,
        lo: usize,
        hi: usize,
        parent: Option<NodeId>,
        depth: u32,
        red_depth: Option<u32>,
    ) -> Option<NodeId> {
        if lo >= hi {
            return None;
        }
        let mid = lo + (hi - lo) / 2;
        let left = self.link(lo, mid, Some(mid), depth + 1, red_depth);
        let right = self.link(mid + 1, hi, Some(mid), depth + 1, red_depth);
        let node = &mut self.nodes[mid];
        node.parent = parent;
        node.left = left;
        node.right = right;
        node.color = if red_depth == Some(depth) {
            Color::Red
        } else {
            Color::Black
        };
        Some(mid)
    }

    // ==================== Balancing ====================

    fn is_red(&self, id: Option<NodeId>) -> bool {
        id.is_some_and(|id| self.nodes[id].color == Color::Red)
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while let Some(p) = self.nodes[z].parent {
            if self.nodes[p].color == Color::Black {
                break;
            }
            // A red parent is never the root, so the grandparent exists.
            let Some(g) = self.nodes[p].parent else { break };

            if self.nodes[g].left == Some(p) {
                let uncle = self.nodes[g].right;
                if self.is_red(uncle) {
                    self.set_color(p, Color::Black);
                    self.set_color_opt(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                    continue;
                }
                if self.nodes[p].right == Some(z) {
                    z = p;
                    self.rotate_left(z);
                }
                let Some(p) = self.nodes[z].parent else { break };
                let Some(g) = self.nodes[p].parent else { break };
                self.set_color(p, Color::Black);
                self.set_color(g, Color::Red);
                self.rotate_right(g);
            } else {
                let uncle = self.nodes[g].left;
                if self.is_red(uncle) {
                    self.set_color(p, Color::Black);
                    self.set_color_opt(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                    continue;
                }
                if self.nodes[p].left == Some(z) {
                    z = p;
                    self.rotate_right(z);
                }
                let Some(p) = self.nodes[z].parent else { break };
                let Some(g) = self.nodes[p].parent else { break };
                self.set_color(p, Color::Black);
                self.set_color(g, Color::Red);
                self.rotate_left(g);
            }
        }
        if let Some(root) = self.root {
            self.set_color(root, Color::Black);
        }
    }

    fn set_color(&mut self, id: NodeId, color: Color) {
        self.nodes[id].color = color;
    }

    fn set_color_opt(&mut self, id: Option<NodeId>, color: Color) {
        if let Some(id) = id {
            self.nodes[id].color = color;
        }
    }

    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: NodeId) {
        match parent {
            None => self.root = Some(new),
            Some(p) if self.nodes[p].left == Some(old) => self.nodes[p].left = Some(new),
            Some(p) => self.nodes[p].right = Some(new),
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let Some(y) = self.nodes[x].right else { return };
        let y_left = self.nodes[y].left;
        self.nodes[x].right = y_left;
        if let Some(c) = y_left {
            self.nodes[c].parent = Some(x);
        }
        let parent = self.nodes[x].parent;
        self.nodes[y].parent = parent;
        self.replace_child(parent, x, y);
        self.nodes[y].left = Some(x);
        self.nodes[x].parent = Some(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let Some(y) = self.nodes[x].left else { return };
        let y_right = self.nodes[y].right;
        self.nodes[x].left = y_right;
        if let Some(c) = y_right {
            self.nodes[c].parent = Some(x);
        }
        let parent = self.nodes[x].parent;
        self.nodes[y].parent = parent;
        self.replace_child(parent, x, y);
        self.nodes[y].right = Some(x);
        self.nodes[x].parent = Some(y);
    }

    /// Verify ordering, coloring and parent links. Returns the black height.
    #[cfg(test)]
    fn check_invariants(&self) -> usize {
        fn walk<V: RecordValue>(tree: &OrderedIndex<V>, id: Option<NodeId>) -> usize {
            let Some(id) = id else { return 1 };
            let node = &tree.nodes[id];
            for child in [node.left, node.right].into_iter().flatten() {
                assert_eq!(tree.nodes[child].parent, Some(id), "broken parent link");
                if node.color == Color::Red {
                    assert_eq!(tree.nodes[child].color, Color::Black, "red node with red child");
                }
            }
            let left = walk(tree, node.left);
            let right = walk(tree, node.right);
            assert_eq!(left, right, "unequal black height");
            left + usize::from(node.color == Color::Black)
        }

        if let Some(root) = self.root {
            assert_eq!(self.nodes[root].color, Color::Black);
            assert_eq!(self.nodes[root].parent, None);
        }
        let records: Vec<_> = self.iter_all().collect();
        for pair in records.windows(2) {
            let order = self.order(&pair[0].key, &pair[0].value, pair[1]);
            assert_eq!(order, Ordering::Less, "records out of order");
        }
        assert_eq!(records.len(), self.live);
        walk(self, self.root)
    }
}

/// Lazy iterator over a range of an [`OrderedIndex`].
pub struct Iter<'a, V> {
    index: &'a OrderedIndex<V>,
    next: Option<NodeId>,
    range: KeyRange,
    direction: ScanDirection,
}

impl<'a, V: RecordValue> Iterator for Iter<'a, V> {
    type Item = &'a Record<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.next?;
            let node = &self.index.nodes[id];
            let out_of_range = match self.direction {
                ScanDirection::Forward => self.range.is_above(&node.record.key),
                ScanDirection::Backward => self.range.is_below(&node.record.key),
            };
            if out_of_range {
                self.next = None;
                return None;
            }
            self.next = match self.direction {
                ScanDirection::Forward => self.index.successor(id),
                ScanDirection::Backward => self.index.predecessor(id),
            };
            if !node.tombstone {
                return Some(&node.record);
            }
        }
    }
}
