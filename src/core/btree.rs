//! Purpose: Ordered in-memory B+ tree backing the secondary indexes.
//! Exports: `BTree`, `Range`, `DEFAULT_ORDER`, `MIN_ORDER`.
//! Role: Generic over key and value; knows nothing about rows or tables.
//! Invariants: All leaves sit at the same depth; leaves are chained in key order.
//! Invariants: Non-root nodes hold between `min_keys` and `max_keys` keys.
//! Invariants: For separator `keys[i]`, every key under `children[i]` is smaller and
//! every key under `children[i + 1]` is greater or equal.
//! Notes: Nodes live in an arena addressed by index; freed slots are recycled.

use std::fmt;
use std::ops::Bound;

pub const DEFAULT_ORDER: usize = 32;
pub const MIN_ORDER: usize = 4;

type NodeId = usize;

struct Node<K, V> {
    keys: Vec<K>,
    // Leaves only.
    vals: Vec<V>,
    next: Option<NodeId>,
    // Internal nodes only; a node without children is a leaf.
    children: Vec<NodeId>,
}

impl<K, V> Default for Node<K, V> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            vals: Vec::new(),
            next: None,
            children: Vec::new(),
        }
    }
}

impl<K, V> Node<K, V> {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

pub struct BTree<K, V> {
    nodes: Vec<Node<K, V>>,
    free: Vec<NodeId>,
    root: NodeId,
    order: usize,
    len: usize,
}

impl<K: Ord + Clone, V> fmt::Debug for BTree<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTree")
            .field("order", &self.order)
            .field("len", &self.len)
            .field("height", &self.height())
            .finish()
    }
}

impl<K: Ord + Clone, V> Default for BTree<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER)
    }
}

impl<K: Ord + Clone, V> BTree<K, V> {
    /// `order` is the maximum fan-out of an internal node; values below
    /// `MIN_ORDER` are raised to it.
    pub fn new(order: usize) -> Self {
        Self {
            nodes: vec![Node::default()],
            free: Vec::new(),
            root: 0,
            order: order.max(MIN_ORDER),
            len: 0,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of levels, counting the leaf level.
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut id = self.root;
        while let Some(&child) = self.nodes[id].children.first() {
            height += 1;
            id = child;
        }
        height
    }

    fn max_keys(&self) -> usize {
        self.order - 1
    }

    fn min_keys(&self) -> usize {
        (self.order - 1) / 2
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let leaf = &self.nodes[self.find_leaf(key)];
        let pos = leaf.keys.binary_search(key).ok()?;
        leaf.vals.get(pos)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let id = self.find_leaf(key);
        let leaf = &mut self.nodes[id];
        let pos = leaf.keys.binary_search(key).ok()?;
        leaf.vals.get_mut(pos)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or replaces; returns the previous value for an existing key.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let (leaf, mut path) = self.descend(&key);
        let node = &mut self.nodes[leaf];
        match node.keys.binary_search(&key) {
            Ok(pos) => return Some(std::mem::replace(&mut node.vals[pos], value)),
            Err(pos) => {
                node.keys.insert(pos, key);
                node.vals.insert(pos, value);
            }
        }
        self.len += 1;

        let mut current = leaf;
        while self.nodes[current].keys.len() > self.max_keys() {
            let (separator, right) = self.split(current);
            match path.pop() {
                Some((parent, idx)) => {
                    let parent_node = &mut self.nodes[parent];
                    parent_node.keys.insert(idx, separator);
                    parent_node.children.insert(idx + 1, right);
                    current = parent;
                }
                None => {
                    self.root = self.alloc(Node {
                        keys: vec![separator],
                        children: vec![current, right],
                        ..Node::default()
                    });
                    break;
                }
            }
        }
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (leaf, mut path) = self.descend(key);
        let node = &mut self.nodes[leaf];
        let pos = node.keys.binary_search(key).ok()?;
        node.keys.remove(pos);
        let value = node.vals.remove(pos);
        self.len -= 1;

        let mut current = leaf;
        while let Some((parent, idx)) = path.pop() {
            if self.nodes[current].keys.len() >= self.min_keys() {
                break;
            }
            self.rebalance(parent, idx);
            current = parent;
        }
        while !self.nodes[self.root].is_leaf() && self.nodes[self.root].keys.is_empty() {
            let old = self.root;
            self.root = self.nodes[old].children[0];
            self.release(old);
        }
        Some(value)
    }

    pub fn iter(&self) -> Range<'_, K, V> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    /// Entries with keys inside the bounds, ascending.
    pub fn range(&self, lower: Bound<&K>, upper: Bound<&K>) -> Range<'_, K, V> {
        let (leaf, pos) = match lower {
            Bound::Unbounded => (self.first_leaf(), 0),
            Bound::Included(key) => {
                let leaf = self.find_leaf(key);
                (leaf, self.nodes[leaf].keys.partition_point(|k| k < key))
            }
            Bound::Excluded(key) => {
                let leaf = self.find_leaf(key);
                (leaf, self.nodes[leaf].keys.partition_point(|k| k <= key))
            }
        };
        Range {
            tree: self,
            leaf: Some(leaf),
            pos,
            upper: upper.cloned(),
        }
    }

    fn find_leaf(&self, key: &K) -> NodeId {
        let mut id = self.root;
        while !self.nodes[id].is_leaf() {
            let node = &self.nodes[id];
            id = node.children[node.keys.partition_point(|k| k <= key)];
        }
        id
    }

    fn first_leaf(&self) -> NodeId {
        let mut id = self.root;
        while let Some(&child) = self.nodes[id].children.first() {
            id = child;
        }
        id
    }

    // Leaf for `key` plus the (node, child index) pairs taken to reach it.
    fn descend(&self, key: &K) -> (NodeId, Vec<(NodeId, usize)>) {
        let mut path = Vec::new();
        let mut id = self.root;
        while !self.nodes[id].is_leaf() {
            let node = &self.nodes[id];
            let idx = node.keys.partition_point(|k| k <= key);
            path.push((id, idx));
            id = node.children[idx];
        }
        (id, path)
    }

    fn alloc(&mut self, node: Node<K, V>) -> NodeId {
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
        self.nodes[id] = Node::default();
        self.free.push(id);
    }

    // Splits an overfull node in half; returns the separator for the parent and
    // the new right sibling.
    fn split(&mut self, id: NodeId) -> (K, NodeId) {
        let node = &mut self.nodes[id];
        let mid = node.keys.len() / 2;
        if node.is_leaf() {
            let keys = node.keys.split_off(mid);
            let vals = node.vals.split_off(mid);
            let separator = keys[0].clone();
            let right = Node {
                keys,
                vals,
                next: node.next,
                children: Vec::new(),
            };
            let right_id = self.alloc(right);
            self.nodes[id].next = Some(right_id);
            (separator, right_id)
        } else {
            let mut keys = node.keys.split_off(mid);
            let children = node.children.split_off(mid + 1);
            let separator = keys.remove(0);
            let right = Node {
                keys,
                children,
                ..Node::default()
            };
            (separator, self.alloc(right))
        }
    }

    // Restores the minimum fill of `children[idx]` of `parent`.
    fn rebalance(&mut self, parent: NodeId, idx: usize) {
        let min = self.min_keys();
        let siblings = self.nodes[parent].children.len();
        if idx > 0 {
            let left = self.nodes[parent].children[idx - 1];
            if self.nodes[left].keys.len() > min {
                self.borrow_from_left(parent, idx);
                return;
            }
        }
        if idx + 1 < siblings {
            let right = self.nodes[parent].children[idx + 1];
            if self.nodes[right].keys.len() > min {
                self.borrow_from_right(parent, idx);
                return;
            }
        }
        if idx > 0 {
            self.merge(parent, idx - 1);
        } else if idx + 1 < siblings {
            self.merge(parent, idx);
        }
    }

    fn borrow_from_left(&mut self, parent: NodeId, idx: usize) {
        let left_id = self.nodes[parent].children[idx - 1];
        let child_id = self.nodes[parent].children[idx];
        let mut left = std::mem::take(&mut self.nodes[left_id]);
        let mut child = std::mem::take(&mut self.nodes[child_id]);
        if left.is_leaf() {
            if let (Some(key), Some(val)) = (left.keys.pop(), left.vals.pop()) {
                child.keys.insert(0, key);
                child.vals.insert(0, val);
            }
            if let Some(first) = child.keys.first() {
                self.nodes[parent].keys[idx - 1] = first.clone();
            }
        } else if let (Some(key), Some(grandchild)) = (left.keys.pop(), left.children.pop()) {
            let separator = std::mem::replace(&mut self.nodes[parent].keys[idx - 1], key);
            child.keys.insert(0, separator);
            child.children.insert(0, grandchild);
        }
        self.nodes[left_id] = left;
        self.nodes[child_id] = child;
    }

    fn borrow_from_right(&mut self, parent: NodeId, idx: usize) {
        let child_id = self.nodes[parent].children[idx];
        let right_id = self.nodes[parent].children[idx + 1];
        let mut child = std::mem::take(&mut self.nodes[child_id]);
        let mut right = std::mem::take(&mut self.nodes[right_id]);
        if right.is_leaf() {
            child.keys.push(right.keys.remove(0));
            child.vals.push(right.vals.remove(0));
            if let Some(first) = right.keys.first() {
                self.nodes[parent].keys[idx] = first.clone();
            }
        } else {
            let separator = std::mem::replace(&mut self.nodes[parent].keys[idx], right.keys.remove(0));
            child.keys.push(separator);
            child.children.push(right.children.remove(0));
        }
        self.nodes[child_id] = child;
        self.nodes[right_id] = right;
    }

    // Folds `children[left_idx + 1]` into `children[left_idx]`.
    fn merge(&mut self, parent: NodeId, left_idx: usize) {
        let left_id = self.nodes[parent].children[left_idx];
        let right_id = self.nodes[parent].children[left_idx + 1];
        let right = std::mem::take(&mut self.nodes[right_id]);
        let separator = self.nodes[parent].keys.remove(left_idx);
        self.nodes[parent].children.remove(left_idx + 1);
        let left = &mut self.nodes[left_id];
        if right.is_leaf() {
            left.keys.extend(right.keys);
            left.vals.extend(right.vals);
            left.next = right.next;
        } else {
            left.keys.push(separator);
            left.keys.extend(right.keys);
            left.children.extend(right.children);
        }
        self.free.push(right_id);
    }

    /// Walks the whole tree and reports the first structural violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut leaf_depth = None;
        let counted = self.check_node(self.root, 0, None, None, &mut leaf_depth)?;
        if counted != self.len {
            return Err(format!("tree holds {counted} entries, len says {}", self.len));
        }

        let mut chained = 0usize;
        let mut previous: Option<&K> = None;
        let mut leaf = Some(self.first_leaf());
        while let Some(id) = leaf {
            for key in &self.nodes[id].keys {
                if previous.is_some_and(|prev| prev >= key) {
                    return Err(format!("leaf chain out of order at node {id}"));
                }
                previous = Some(key);
                chained += 1;
            }
            leaf = self.nodes[id].next;
        }
        if chained != self.len {
            return Err(format!("leaf chain reaches {chained} of {} entries", self.len));
        }
        Ok(())
    }

    fn check_node(
        &self,
        id: NodeId,
        depth: usize,
        lower: Option<&K>,
        upper: Option<&K>,
        leaf_depth: &mut Option<usize>,
    ) -> Result<usize, String> {
        let node = &self.nodes[id];
        if node.keys.len() > self.max_keys() {
            return Err(format!("node {id} overfull: {} keys", node.keys.len()));
        }
        if id != self.root && node.keys.len() < self.min_keys() {
            return Err(format!("node {id} underfull: {} keys", node.keys.len()));
        }
        if node.keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(format!("node {id} keys not strictly ascending"));
        }
        let in_bounds = |key: &K| lower.is_none_or(|low| key >= low) && upper.is_none_or(|high| key < high);
        if !node.keys.iter().all(in_bounds) {
            return Err(format!("node {id} has a key outside its separator bounds"));
        }

        if node.is_leaf() {
            if node.vals.len() != node.keys.len() {
                return Err(format!("leaf {id} has {} values for {} keys", node.vals.len(), node.keys.len()));
            }
            match *leaf_depth {
                Some(expected) if expected != depth => {
                    return Err(format!("leaf {id} at depth {depth}, expected {expected}"));
                }
                _ => *leaf_depth = Some(depth),
            }
            return Ok(node.keys.len());
        }

        if node.children.len() != node.keys.len() + 1 {
            return Err(format!(
                "internal node {id} has {} children for {} keys",
                node.children.len(),
                node.keys.len()
            ));
        }
        let mut total = 0;
        for (i, &child) in node.children.iter().enumerate() {
            let low = if i == 0 { lower } else { node.keys.get(i - 1) };
            let high = node.keys.get(i).or(upper);
            total += self.check_node(child, depth + 1, low, high, leaf_depth)?;
        }
        Ok(total)
    }
}

/// Ascending iterator over a key range; follows the leaf chain.
pub struct Range<'a, K, V> {
    tree: &'a BTree<K, V>,
    leaf: Option<NodeId>,
    pos: usize,
    upper: Bound<K>,
}

impl<'a, K: Ord, V> Iterator for Range<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.leaf?;
            let node = &self.tree.nodes[id];
            if self.pos >= node.keys.len() {
                self.leaf = node.next;
                self.pos = 0;
                continue;
            }
            let key = &node.keys[self.pos];
            let within = match &self.upper {
                Bound::Unbounded => true,
                Bound::Included(high) => key <= high,
                Bound::Excluded(high) => key < high,
            };
            if !within {
                self.leaf = None;
                return None;
            }
            let val = &node.vals[self.pos];
            self.pos += 1;
            return Some((key, val));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BTree;
    use std::collections::BTreeMap;
    use std::ops::Bound;

    // Deterministic shuffle without pulling in an RNG crate.
    fn scrambled(n: u64, seed: u64) -> Vec<u64> {
        let mut keys: Vec<u64> = (0..n).collect();
        let mut state = seed;
        for i in (1..keys.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            keys.swap(i, j);
        }
        keys
    }

    #[test]
    fn ascending_descending_and_scrambled_inserts_stay_balanced() {
        for order in [4, 5, 7, 32] {
            let orders: [Vec<u64>; 3] = [
                (0..500).collect(),
                (0..500).rev().collect(),
                scrambled(500, order as u64),
            ];
            for keys in orders {
                let mut tree = BTree::new(order);
                for &key in &keys {
                    assert_eq!(tree.insert(key, key * 10), None);
                    tree.check_invariants().expect("invariants after insert");
                }
                assert_eq!(tree.len(), 500);
                for key in 0..500u64 {
                    assert_eq!(tree.get(&key), Some(&(key * 10)));
                }
                assert_eq!(tree.get(&500), None);
                let walked: Vec<u64> = tree.iter().map(|(k, _)| *k).collect();
                assert_eq!(walked, (0..500).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn height_grows_logarithmically() {
        let mut tree = BTree::new(4);
        for key in 0..4096u32 {
            tree.insert(key, ());
        }
        // Every non-root node has at least two children at order 4.
        assert!(tree.height() <= 13, "height {}", tree.height());
        let mut wide = BTree::new(32);
        for key in 0..4096u32 {
            wide.insert(key, ());
        }
        assert!(wide.height() <= 4, "height {}", wide.height());
    }

    #[test]
    fn replace_returns_previous_value() {
        let mut tree = BTree::new(4);
        assert_eq!(tree.insert("k".to_string(), 1), None);
        assert_eq!(tree.insert("k".to_string(), 2), Some(1));
        assert_eq!(tree.len(), 1);
        if let Some(value) = tree.get_mut(&"k".to_string()) {
            *value += 40;
        }
        assert_eq!(tree.get(&"k".to_string()), Some(&42));
    }

    #[test]
    fn interleaved_removals_match_reference_map() {
        for order in [4, 5, 6, 16] {
            let mut tree = BTree::new(order);
            let mut reference = BTreeMap::new();
            for key in scrambled(800, 7) {
                tree.insert(key, key);
                reference.insert(key, key);
            }
            for (step, key) in scrambled(800, 11).into_iter().enumerate() {
                if step % 3 == 2 {
                    let again = key + 1000;
                    assert_eq!(tree.insert(again, again), reference.insert(again, again));
                }
                assert_eq!(tree.remove(&key), reference.remove(&key));
                assert_eq!(tree.remove(&key), None);
                tree.check_invariants().expect("invariants after remove");
                assert_eq!(tree.len(), reference.len());
            }
            let left: Vec<_> = tree.iter().map(|(k, v)| (*k, *v)).collect();
            let expected: Vec<_> = reference.iter().map(|(k, v)| (*k, *v)).collect();
            assert_eq!(left, expected);
        }
    }

    #[test]
    fn draining_collapses_to_an_empty_leaf() {
        let mut tree = BTree::new(4);
        for key in 0..200u16 {
            tree.insert(key, ());
        }
        for key in 0..200u16 {
            tree.remove(&key);
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.iter().count(), 0);
        tree.check_invariants().expect("empty tree");
        tree.insert(7, ());
        assert_eq!(tree.iter().count(), 1);
    }

    #[test]
    fn ranges_respect_bounds() {
        let mut tree = BTree::new(5);
        let mut reference = BTreeMap::new();
        for key in (0..300i64).map(|k| k * 2) {
            tree.insert(key, key);
            reference.insert(key, key);
        }
        let probes = [-5i64, 0, 1, 2, 99, 100, 101, 598, 599, 700];
        for &low in &probes {
            for &high in &probes {
                let bounds = [
                    (Bound::Included(&low), Bound::Included(&high)),
                    (Bound::Excluded(&low), Bound::Excluded(&high)),
                    (Bound::Included(&low), Bound::Unbounded),
                    (Bound::Unbounded, Bound::Excluded(&high)),
                ];
                for (lower, upper) in bounds {
                    let got: Vec<i64> = tree.range(lower, upper).map(|(k, _)| *k).collect();
                    let expected: Vec<i64> = if low > high
                        && !matches!(lower, Bound::Unbounded)
                        && !matches!(upper, Bound::Unbounded)
                    {
                        Vec::new()
                    } else if low == high
                        && matches!(lower, Bound::Excluded(_))
                        && matches!(upper, Bound::Excluded(_))
                    {
                        Vec::new()
                    } else {
                        reference.range((lower, upper)).map(|(k, _)| *k).collect()
                    };
                    assert_eq!(got, expected, "range {lower:?}..{upper:?}");
                }
            }
        }
    }
}
