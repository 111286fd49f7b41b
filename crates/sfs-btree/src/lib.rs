#![forbid(unsafe_code)]
//! B+tree index mapping 32-bit name keys to metadata slots.
//!
//! Nodes live in an arena addressed by stable integer ids. Parent, child, and
//! next-leaf links are ids, which is also how nodes reference each other on
//! disk.
//!
//! # Shape
//!
//! | Node | Keys | Links |
//! |------|------|-------|
//! | leaf | `min_keys..=order-1` (root: `0..=order-1`) | parallel values, next-leaf id |
//! | internal | `min_keys..=order-1` (root: `1..=order-1`) | `keys + 1` children |
//!
//! `min_keys = ceil(order / 2) - 1`. A node that reaches `order` keys splits;
//! a non-root node that drops below `min_keys` borrows from a sibling or
//! merges with one.
//!
//! # On-disk records
//!
//! The tree is written breadth-first from the root, one record per node,
//! packed into blocks (a record never straddles two blocks):
//!
//! ```text
//! id: u32 | leaf: u8 | nkeys: u32 | keys: [u32; nkeys]
//!   leaf:     values: [u32; nkeys] | next_leaf: u32   (0 = none)
//!   internal: nchildren: u32 | children: [u32; nchildren]
//! ```
//!
//! Ids start at 1; a zero id ends the records of a block, and a block that
//! starts with a zero id ends the region.

use sfs_block::{BlockDevice, zero_blocks};
use sfs_error::{Result, SfsError};
use sfs_types::{BlockNumber, ParseError, read_le_u32};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, trace, warn};

pub type Key = u32;
pub type Value = u32;
pub type NodeId = u32;

const NO_NODE: NodeId = 0;
const FIRST_NODE: NodeId = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    leaf: bool,
    keys: Vec<Key>,
    /// Leaf only, parallel to `keys`.
    values: Vec<Value>,
    /// Internal only, `keys.len() + 1` entries.
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    next_leaf: Option<NodeId>,
}

impl Node {
    fn empty_leaf(parent: Option<NodeId>) -> Self {
        Self {
            leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            parent,
            next_leaf: None,
        }
    }
}

/// Summary of tree shape, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    pub keys: usize,
    pub nodes: usize,
    pub leaves: usize,
    pub height: usize,
}

#[derive(Debug, Clone)]
pub struct BPlusTree {
    order: usize,
    root: NodeId,
    nodes: BTreeMap<NodeId, Node>,
    next_id: NodeId,
    len: usize,
    /// Blocks holding records after the last save or load.
    persisted_blocks: u64,
}

impl BPlusTree {
    /// Empty tree: a single leaf root.
    #[must_use]
    pub fn new(order: usize) -> Self {
        let order = order.max(3);
        let mut nodes = BTreeMap::new();
        nodes.insert(FIRST_NODE, Node::empty_leaf(None));
        Self {
            order,
            root: FIRST_NODE,
            nodes,
            next_id: FIRST_NODE + 1,
            len: 0,
            persisted_blocks: 0,
        }
    }

    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Smallest key count a non-root node may hold.
    #[must_use]
    pub fn min_keys(&self) -> usize {
        self.order.div_ceil(2) - 1
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(&id).unwrap_or_else(|| unreachable!("dangling node id {id}"))
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn find_leaf(&self, key: Key) -> NodeId {
        let mut id = self.root;
        loop {
            let node = self.node(id);
            if node.leaf {
                return id;
            }
            let idx = node.keys.partition_point(|k| *k <= key);
            id = node.children[idx];
        }
    }

    fn child_position(&self, parent: NodeId, child: NodeId) -> usize {
        let node = self.node(parent);
        node.children
            .iter()
            .position(|c| *c == child)
            .unwrap_or_else(|| unreachable!("node {child} missing from parent {parent}"))
    }

    // ── Search ──────────────────────────────────────────────────────────────

    #[must_use]
    pub fn search(&self, key: Key) -> Option<Value> {
        let leaf = self.node(self.find_leaf(key));
        leaf.keys.binary_search(&key).ok().map(|i| leaf.values[i])
    }

    #[must_use]
    pub fn contains(&self, key: Key) -> bool {
        self.search(key).is_some()
    }

    /// All `(key, value)` pairs in key order, following the leaf chain.
    #[must_use]
    pub fn entries(&self) -> Vec<(Key, Value)> {
        let mut out = Vec::with_capacity(self.len);
        let mut id = self.root;
        while !self.node(id).leaf {
            id = self.node(id).children[0];
        }
        let mut cursor = Some(id);
        while let Some(leaf_id) = cursor {
            let leaf = self.node(leaf_id);
            out.extend(leaf.keys.iter().copied().zip(leaf.values.iter().copied()));
            cursor = leaf.next_leaf;
        }
        out
    }

    // ── Insert ──────────────────────────────────────────────────────────────

    /// Insert `key → value`. An existing key has its value replaced and the
    /// previous value is returned.
    pub fn insert(&mut self, key: Key, value: Value) -> Option<Value> {
        let leaf_id = self.find_leaf(key);
        let leaf = self.node_mut(leaf_id);
        match leaf.keys.binary_search(&key) {
            Ok(i) => {
                let old = std::mem::replace(&mut leaf.values[i], value);
                trace!(key, old, new = value, "btree_replace");
                return Some(old);
            }
            Err(i) => {
                leaf.keys.insert(i, key);
                leaf.values.insert(i, value);
            }
        }
        self.len += 1;
        trace!(key, value, leaf = leaf_id, "btree_insert");
        if self.node(leaf_id).keys.len() >= self.order {
            self.split_leaf(leaf_id);
        }
        None
    }

    fn split_leaf(&mut self, id: NodeId) {
        let new_id = self.alloc_id();
        let node = self.node_mut(id);
        let mid = node.keys.len() / 2;
        let right_keys = node.keys.split_off(mid);
        let right_values = node.values.split_off(mid);
        let next = node.next_leaf.replace(new_id);
        let parent = node.parent;
        let separator = right_keys[0];
        self.nodes.insert(
            new_id,
            Node {
                leaf: true,
                keys: right_keys,
                values: right_values,
                children: Vec::new(),
                parent,
                next_leaf: next,
            },
        );
        debug!(old_node = id, new_node = new_id, separator, "btree_leaf_split");
        self.insert_into_parent(id, separator, new_id);
    }

    fn split_internal(&mut self, id: NodeId) {
        let new_id = self.alloc_id();
        let node = self.node_mut(id);
        let mid = node.keys.len() / 2;
        let mut right_keys = node.keys.split_off(mid);
        let separator = right_keys.remove(0);
        let right_children = node.children.split_off(mid + 1);
        let parent = node.parent;
        for child in &right_children {
            self.node_mut(*child).parent = Some(new_id);
        }
        self.nodes.insert(
            new_id,
            Node {
                leaf: false,
                keys: right_keys,
                values: Vec::new(),
                children: right_children,
                parent,
                next_leaf: None,
            },
        );
        debug!(old_node = id, new_node = new_id, separator, "btree_internal_split");
        self.insert_into_parent(id, separator, new_id);
    }

    fn insert_into_parent(&mut self, left: NodeId, separator: Key, right: NodeId) {
        let Some(parent_id) = self.node(left).parent else {
            let root_id = self.alloc_id();
            self.nodes.insert(
                root_id,
                Node {
                    leaf: false,
                    keys: vec![separator],
                    values: Vec::new(),
                    children: vec![left, right],
                    parent: None,
                    next_leaf: None,
                },
            );
            self.node_mut(left).parent = Some(root_id);
            self.node_mut(right).parent = Some(root_id);
            self.root = root_id;
            debug!(root = root_id, separator, "btree_new_root");
            return;
        };

        let pos = self.child_position(parent_id, left);
        let parent = self.node_mut(parent_id);
        parent.keys.insert(pos, separator);
        parent.children.insert(pos + 1, right);
        self.node_mut(right).parent = Some(parent_id);
        if self.node(parent_id).keys.len() >= self.order {
            self.split_internal(parent_id);
        }
    }

    // ── Remove ──────────────────────────────────────────────────────────────

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&mut self, key: Key) -> Option<Value> {
        let leaf_id = self.find_leaf(key);
        let leaf = self.node_mut(leaf_id);
        let idx = leaf.keys.binary_search(&key).ok()?;
        leaf.keys.remove(idx);
        let value = leaf.values.remove(idx);
        self.len -= 1;
        trace!(key, value, leaf = leaf_id, "btree_remove");

        if leaf_id == self.root {
            return Some(value);
        }
        if idx == 0 {
            if let Some(&first) = self.node(leaf_id).keys.first() {
                self.replace_separator(leaf_id, key, first);
            }
        }
        if self.node(leaf_id).keys.len() < self.min_keys() {
            self.rebalance_leaf(leaf_id);
        }
        Some(value)
    }

    /// Patch the ancestor separator that equals a leaf's removed first key.
    fn replace_separator(&mut self, from: NodeId, old: Key, new: Key) {
        let mut cursor = self.node(from).parent;
        while let Some(id) = cursor {
            let node = self.node_mut(id);
            if let Ok(i) = node.keys.binary_search(&old) {
                node.keys[i] = new;
                return;
            }
            cursor = node.parent;
        }
    }

    fn siblings(&self, parent: NodeId, pos: usize) -> (Option<NodeId>, Option<NodeId>) {
        let children = &self.node(parent).children;
        let left = pos.checked_sub(1).map(|i| children[i]);
        let right = children.get(pos + 1).copied();
        (left, right)
    }

    fn rebalance_leaf(&mut self, id: NodeId) {
        let Some(parent_id) = self.node(id).parent else {
            return;
        };
        let min = self.min_keys();
        let pos = self.child_position(parent_id, id);
        let (left, right) = self.siblings(parent_id, pos);

        match left {
            Some(l) if self.node(l).keys.len() > min => {
                let ln = self.node_mut(l);
                let (Some(k), Some(v)) = (ln.keys.pop(), ln.values.pop()) else {
                    unreachable!("lending sibling is non-empty");
                };
                let node = self.node_mut(id);
                node.keys.insert(0, k);
                node.values.insert(0, v);
                self.node_mut(parent_id).keys[pos - 1] = k;
                debug!(node = id, from = l, key = k, "btree_leaf_borrow_left");
                return;
            }
            _ => {}
        }
        match right {
            Some(r) if self.node(r).keys.len() > min => {
                let rn = self.node_mut(r);
                let k = rn.keys.remove(0);
                let v = rn.values.remove(0);
                let new_first = rn.keys[0];
                let node = self.node_mut(id);
                node.keys.push(k);
                node.values.push(v);
                self.node_mut(parent_id).keys[pos] = new_first;
                debug!(node = id, from = r, key = k, "btree_leaf_borrow_right");
                return;
            }
            _ => {}
        }

        if let Some(l) = left {
            let Some(node) = self.nodes.remove(&id) else {
                return;
            };
            let ln = self.node_mut(l);
            ln.keys.extend(node.keys);
            ln.values.extend(node.values);
            ln.next_leaf = node.next_leaf;
            let parent = self.node_mut(parent_id);
            parent.keys.remove(pos - 1);
            parent.children.remove(pos);
            debug!(merged = id, into = l, "btree_leaf_merge");
        } else if let Some(r) = right {
            let Some(rnode) = self.nodes.remove(&r) else {
                return;
            };
            let node = self.node_mut(id);
            node.keys.extend(rnode.keys);
            node.values.extend(rnode.values);
            node.next_leaf = rnode.next_leaf;
            let parent = self.node_mut(parent_id);
            parent.keys.remove(pos);
            parent.children.remove(pos + 1);
            debug!(merged = r, into = id, "btree_leaf_merge");
        }
        self.after_child_removed(parent_id);
    }

    fn rebalance_internal(&mut self, id: NodeId) {
        let Some(parent_id) = self.node(id).parent else {
            return;
        };
        let min = self.min_keys();
        let pos = self.child_position(parent_id, id);
        let (left, right) = self.siblings(parent_id, pos);

        match left {
            Some(l) if self.node(l).keys.len() > min => {
                let separator = self.node(parent_id).keys[pos - 1];
                let ln = self.node_mut(l);
                let (Some(k), Some(child)) = (ln.keys.pop(), ln.children.pop()) else {
                    unreachable!("lending sibling is non-empty");
                };
                let node = self.node_mut(id);
                node.keys.insert(0, separator);
                node.children.insert(0, child);
                self.node_mut(child).parent = Some(id);
                self.node_mut(parent_id).keys[pos - 1] = k;
                debug!(node = id, from = l, "btree_internal_borrow_left");
                return;
            }
            _ => {}
        }
        match right {
            Some(r) if self.node(r).keys.len() > min => {
                let separator = self.node(parent_id).keys[pos];
                let rn = self.node_mut(r);
                let k = rn.keys.remove(0);
                let child = rn.children.remove(0);
                let node = self.node_mut(id);
                node.keys.push(separator);
                node.children.push(child);
                self.node_mut(child).parent = Some(id);
                self.node_mut(parent_id).keys[pos] = k;
                debug!(node = id, from = r, "btree_internal_borrow_right");
                return;
            }
            _ => {}
        }

        if let Some(l) = left {
            let parent = self.node_mut(parent_id);
            let separator = parent.keys.remove(pos - 1);
            parent.children.remove(pos);
            let Some(node) = self.nodes.remove(&id) else {
                return;
            };
            for child in &node.children {
                self.node_mut(*child).parent = Some(l);
            }
            let ln = self.node_mut(l);
            ln.keys.push(separator);
            ln.keys.extend(node.keys);
            ln.children.extend(node.children);
            debug!(merged = id, into = l, "btree_internal_merge");
        } else if let Some(r) = right {
            let parent = self.node_mut(parent_id);
            let separator = parent.keys.remove(pos);
            parent.children.remove(pos + 1);
            let Some(rnode) = self.nodes.remove(&r) else {
                return;
            };
            for child in &rnode.children {
                self.node_mut(*child).parent = Some(id);
            }
            let node = self.node_mut(id);
            node.keys.push(separator);
            node.keys.extend(rnode.keys);
            node.children.extend(rnode.children);
            debug!(merged = r, into = id, "btree_internal_merge");
        }
        self.after_child_removed(parent_id);
    }

    fn after_child_removed(&mut self, parent_id: NodeId) {
        if parent_id == self.root {
            let root = self.node(parent_id);
            if !root.leaf && root.keys.is_empty() {
                let child = root.children[0];
                self.nodes.remove(&parent_id);
                self.node_mut(child).parent = None;
                self.root = child;
                debug!(old_root = parent_id, new_root = child, "btree_root_collapse");
            }
            return;
        }
        if self.node(parent_id).keys.len() < self.min_keys() {
            self.rebalance_internal(parent_id);
        }
    }

    // ── Validation ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let mut height = 1;
        let mut id = self.root;
        while !self.node(id).leaf {
            id = self.node(id).children[0];
            height += 1;
        }
        TreeStats {
            keys: self.len,
            nodes: self.nodes.len(),
            leaves: self.nodes.values().filter(|n| n.leaf).count(),
            height,
        }
    }

    /// Check every structural invariant. Returns a description of the first
    /// violation found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut leaf_depth = None;
        let mut leaves_in_order = Vec::new();
        let mut count = 0_usize;
        let mut stack = vec![(self.root, None::<NodeId>, None::<Key>, None::<Key>, 0_usize)];

        while let Some((id, parent, lo, hi, depth)) = stack.pop() {
            let node = self
                .nodes
                .get(&id)
                .ok_or_else(|| format!("missing node {id}"))?;
            if node.parent != parent {
                return Err(format!(
                    "node {id} parent link {:?} != {parent:?}",
                    node.parent
                ));
            }
            if node.keys.windows(2).any(|w| w[0] >= w[1]) {
                return Err(format!("node {id} keys not strictly increasing"));
            }
            if node.keys.len() >= self.order {
                return Err(format!("node {id} overfull: {} keys", node.keys.len()));
            }
            if id != self.root && node.keys.len() < self.min_keys() {
                return Err(format!("node {id} underfull: {} keys", node.keys.len()));
            }
            for key in &node.keys {
                if lo.is_some_and(|lo| *key < lo) || hi.is_some_and(|hi| *key >= hi) {
                    return Err(format!("node {id} key {key} outside [{lo:?}, {hi:?})"));
                }
            }

            if node.leaf {
                if node.values.len() != node.keys.len() {
                    return Err(format!("leaf {id} value count mismatch"));
                }
                match leaf_depth {
                    None => leaf_depth = Some(depth),
                    Some(d) if d != depth => {
                        return Err(format!("leaf {id} at depth {depth}, expected {d}"));
                    }
                    Some(_) => {}
                }
                count += node.keys.len();
                leaves_in_order.push(id);
            } else {
                if node.children.len() != node.keys.len() + 1 {
                    return Err(format!("internal {id} child count mismatch"));
                }
                if id == self.root && node.keys.is_empty() {
                    return Err("internal root has no keys".to_owned());
                }
                // Push right-to-left so leaves pop in key order.
                for (i, child) in node.children.iter().enumerate().rev() {
                    let child_lo = if i == 0 { lo } else { Some(node.keys[i - 1]) };
                    let child_hi = node.keys.get(i).copied().or(hi);
                    stack.push((*child, Some(id), child_lo, child_hi, depth + 1));
                }
            }
        }

        if count != self.len {
            return Err(format!("len {} but {count} keys reachable", self.len));
        }
        for pair in leaves_in_order.windows(2) {
            if self.node(pair[0]).next_leaf != Some(pair[1]) {
                return Err(format!("leaf chain broken after {}", pair[0]));
            }
        }
        if let Some(last) = leaves_in_order.last() {
            if self.node(*last).next_leaf.is_some() {
                return Err(format!("last leaf {last} has a next link"));
            }
        }
        Ok(())
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    fn encode_node(id: NodeId, node: &Node, out: &mut Vec<u8>) {
        out.extend_from_slice(&id.to_le_bytes());
        out.push(u8::from(node.leaf));
        out.extend_from_slice(&(node.keys.len() as u32).to_le_bytes());
        for key in &node.keys {
            out.extend_from_slice(&key.to_le_bytes());
        }
        if node.leaf {
            for value in &node.values {
                out.extend_from_slice(&value.to_le_bytes());
            }
            out.extend_from_slice(&node.next_leaf.unwrap_or(NO_NODE).to_le_bytes());
        } else {
            out.extend_from_slice(&(node.children.len() as u32).to_le_bytes());
            for child in &node.children {
                out.extend_from_slice(&child.to_le_bytes());
            }
        }
    }

    /// Serialize breadth-first into block-sized buffers.
    pub fn encode_blocks(&self, block_size: usize) -> Result<Vec<Vec<u8>>> {
        let mut blocks = Vec::new();
        let mut current = Vec::with_capacity(block_size);
        let mut record = Vec::new();
        let mut queue = VecDeque::from([self.root]);

        while let Some(id) = queue.pop_front() {
            let node = self.node(id);
            record.clear();
            Self::encode_node(id, node, &mut record);
            if record.len() > block_size {
                return Err(SfsError::Format(format!(
                    "node {id} record of {} bytes exceeds block size {block_size}",
                    record.len()
                )));
            }
            if current.len() + record.len() > block_size {
                current.resize(block_size, 0);
                blocks.push(std::mem::replace(&mut current, Vec::with_capacity(block_size)));
            }
            current.extend_from_slice(&record);
            if !node.leaf {
                queue.extend(node.children.iter().copied());
            }
        }
        current.resize(block_size, 0);
        blocks.push(current);
        Ok(blocks)
    }

    /// Write the tree into `region_blocks` blocks starting at `start`.
    pub fn save(
        &mut self,
        dev: &dyn BlockDevice,
        start: BlockNumber,
        region_blocks: u64,
    ) -> Result<()> {
        let blocks = self.encode_blocks(dev.block_size() as usize)?;
        let used = blocks.len() as u64;
        if used > region_blocks {
            return Err(SfsError::Format(format!(
                "index needs {used} blocks, region holds {region_blocks}"
            )));
        }
        for (i, data) in blocks.iter().enumerate() {
            dev.write_block(BlockNumber(start.0 + i as u64), data)?;
        }
        if self.persisted_blocks > used {
            zero_blocks(
                dev,
                BlockNumber(start.0 + used),
                self.persisted_blocks - used,
            )?;
        }
        self.persisted_blocks = used;
        trace!(blocks = used, nodes = self.nodes.len(), "btree_saved");
        Ok(())
    }

    /// Rebuild a tree from its region. An empty region yields a fresh tree.
    pub fn load(
        dev: &dyn BlockDevice,
        start: BlockNumber,
        region_blocks: u64,
        order: usize,
    ) -> Result<Self> {
        let bs = dev.block_size() as usize;
        let mut nodes = BTreeMap::new();
        let mut root = None;
        let mut used_blocks = 0_u64;

        for i in 0..region_blocks {
            let block = BlockNumber(start.0 + i);
            let buf = dev.read_block(block)?;
            let data = buf.as_slice();
            let corrupt = |err: ParseError| SfsError::Corruption {
                block: block.0,
                detail: err.to_string(),
            };

            let mut off = 0_usize;
            while off + 4 <= bs {
                let id = read_le_u32(data, off).map_err(corrupt)?;
                if id == NO_NODE {
                    break;
                }
                let (node, len) = decode_node(data, off).map_err(corrupt)?;
                if nodes.insert(id, node).is_some() {
                    return Err(SfsError::Corruption {
                        block: block.0,
                        detail: format!("duplicate node id {id}"),
                    });
                }
                root.get_or_insert(id);
                off += len;
            }
            if off == 0 {
                break;
            }
            used_blocks = i + 1;
        }

        let Some(root) = root else {
            debug!(start = start.0, "btree_region_empty");
            return Ok(Self::new(order));
        };

        let mut tree = Self {
            order: order.max(3),
            root,
            nodes,
            next_id: FIRST_NODE,
            len: 0,
            persisted_blocks: used_blocks,
        };
        tree.link_and_prune(start)?;
        tree.validate().map_err(|detail| SfsError::Corruption {
            block: start.0,
            detail,
        })?;
        debug!(
            keys = tree.len,
            nodes = tree.nodes.len(),
            blocks = used_blocks,
            "btree_loaded"
        );
        Ok(tree)
    }

    /// Resolve child ids into parent links, drop unreachable records, and
    /// recompute counters.
    fn link_and_prune(&mut self, start: BlockNumber) -> Result<()> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::from([self.root]);
        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id) {
                return Err(SfsError::Corruption {
                    block: start.0,
                    detail: format!("node {id} reachable twice"),
                });
            }
            let children = self.node(id).children.clone();
            for child in children {
                let node = self.nodes.get_mut(&child).ok_or_else(|| SfsError::Corruption {
                    block: start.0,
                    detail: format!("node {id} references missing child {child}"),
                })?;
                node.parent = Some(id);
                queue.push_back(child);
            }
        }

        let stale = self.nodes.len() - reachable.len();
        if stale > 0 {
            warn!(stale, "btree_unreachable_records_dropped");
            self.nodes.retain(|id, _| reachable.contains(id));
        }
        for (id, node) in &self.nodes {
            if let Some(next) = node.next_leaf {
                if !self.nodes.contains_key(&next) {
                    return Err(SfsError::Corruption {
                        block: start.0,
                        detail: format!("leaf {id} links to missing leaf {next}"),
                    });
                }
            }
        }
        self.len = self.nodes.values().filter(|n| n.leaf).map(|n| n.keys.len()).sum();
        self.next_id = self.nodes.keys().max().map_or(FIRST_NODE, |max| max + 1);
        Ok(())
    }
}

fn decode_node(data: &[u8], start: usize) -> std::result::Result<(Node, usize), ParseError> {
    let mut off = start + 4;
    let leaf_flag = *data.get(off).ok_or(ParseError::InsufficientData {
        needed: 1,
        offset: off,
        actual: 0,
    })?;
    let leaf = match leaf_flag {
        0 => false,
        1 => true,
        _ => {
            return Err(ParseError::InvalidField {
                field: "leaf",
                reason: "flag must be 0 or 1",
            });
        }
    };
    off += 1;
    let nkeys = read_le_u32(data, off)? as usize;
    off += 4;
    let mut keys = Vec::with_capacity(nkeys.min(256));
    for _ in 0..nkeys {
        keys.push(read_le_u32(data, off)?);
        off += 4;
    }

    let mut node = Node {
        leaf,
        keys,
        values: Vec::new(),
        children: Vec::new(),
        parent: None,
        next_leaf: None,
    };
    if leaf {
        for _ in 0..nkeys {
            node.values.push(read_le_u32(data, off)?);
            off += 4;
        }
        let next = read_le_u32(data, off)?;
        off += 4;
        node.next_leaf = (next != NO_NODE).then_some(next);
    } else {
        let nchildren = read_le_u32(data, off)? as usize;
        off += 4;
        if nchildren != nkeys + 1 {
            return Err(ParseError::InvalidField {
                field: "nchildren",
                reason: "must equal nkeys + 1",
            });
        }
        for _ in 0..nchildren {
            node.children.push(read_le_u32(data, off)?);
            off += 4;
        }
    }
    Ok((node, off - start))
}
