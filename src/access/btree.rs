//! Disk-resident B+Tree.
//!
//! Every node occupies one page fetched through the buffer pool; the root always lives at
//! page 1, so a root split copies the old root's halves to fresh pages and rewrites page
//! 1, and a root collapse copies the surviving child back into page 1.
//!
//! Nodes hold no parent pointers. Each descent records the path of `(page, child index)`
//! pairs it took, and splits and rebalancing walk that path back up.
//!
//! The whole tree is guarded by a single read/write latch: lookups and scans share it,
//! inserts and deletes take it exclusively. Callers never see the latch, so a finer
//! latching scheme can replace it without API changes.

pub mod codec;
pub mod node;

pub use self::codec::NodeCodec;
pub use self::node::Node;

use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{PageId, INDEX_ROOT_PAGE_ID};
use crate::storage::{StorageError, PAGE_SIZE};
use anyhow::{bail, Result};
use log::debug;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};

/// Smallest order that still lets a split leave both halves non-empty.
pub const MIN_ORDER: usize = 3;

/// Node bytes outside its entries: tag, key count, and the next-leaf link or the extra
/// child pointer.
const NODE_OVERHEAD: usize = 9;

/// Length prefixes around an entry's key and value.
const ENTRY_OVERHEAD: usize = 8;

/// Every order must leave room for entries of at least this many key and value bytes.
const MIN_ENTRY_SIZE: usize = 16;

/// Largest order whose full nodes still fit a page with minimal entries.
pub const MAX_ORDER: usize = (PAGE_SIZE - NODE_OVERHEAD) / (ENTRY_OVERHEAD + MIN_ENTRY_SIZE) + 1;

/// Steps taken from the root to the current node: the internal page and the child index
/// followed from it.
type Path = Vec<(PageId, usize)>;

/// Shape summary produced by [`BPlusTree::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    pub height: usize,
    pub leaf_nodes: usize,
    pub internal_nodes: usize,
    pub keys: usize,
}

pub struct BPlusTree<K, V> {
    buffer_pool: BufferPoolManager,
    /// Maximum key count per node; a node reaching it splits.
    order: usize,
    latch: RwLock<()>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> BPlusTree<K, V>
where
    K: NodeCodec + Ord + Clone + Debug,
    V: NodeCodec + Clone,
{
    /// Creates an empty tree. The pool must hand out page 1 as its first new page.
    pub fn create(buffer_pool: BufferPoolManager, order: usize) -> Result<Self> {
        Self::check_order(order)?;
        let (page_id, mut guard) = buffer_pool.new_page()?;
        if page_id != INDEX_ROOT_PAGE_ID {
            bail!(
                "B+Tree root must be page {}, but page {} was allocated",
                INDEX_ROOT_PAGE_ID,
                page_id
            );
        }
        Node::<K, V>::empty_leaf().write_to(page_id, &mut guard[..])?;
        drop(guard);

        debug!("created B+Tree with order {}", order);
        Ok(Self::with_pool(buffer_pool, order))
    }

    /// Attaches to a tree whose root already lives at page 1.
    pub fn open(buffer_pool: BufferPoolManager, order: usize) -> Result<Self> {
        Self::check_order(order)?;
        let tree = Self::with_pool(buffer_pool, order);
        tree.read_node(INDEX_ROOT_PAGE_ID)?;
        Ok(tree)
    }

    fn with_pool(buffer_pool: BufferPoolManager, order: usize) -> Self {
        Self {
            buffer_pool,
            order,
            latch: RwLock::new(()),
            _marker: PhantomData,
        }
    }

    fn check_order(order: usize) -> Result<()> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            bail!(
                "B+Tree order must be between {} and {}, got {}",
                MIN_ORDER,
                MAX_ORDER,
                order
            );
        }
        Ok(())
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Largest encoded key plus value an entry may carry. Nodes split by key count, so
    /// the cap is what lets a node of `order - 1` entries always fit in its page.
    pub fn max_entry_size(&self) -> usize {
        (PAGE_SIZE - NODE_OVERHEAD) / (self.order - 1) - ENTRY_OVERHEAD
    }

    /// Fails with [`StorageError::EntryTooLarge`] if the pair exceeds
    /// [`max_entry_size`](Self::max_entry_size).
    pub fn check_entry(&self, key: &K, value: &V) -> Result<()> {
        let size = key.encode().len() + value.encode().len();
        let max = self.max_entry_size();
        if size > max {
            bail!(StorageError::EntryTooLarge { size, max });
        }
        Ok(())
    }

    /// Non-root nodes hold at least this many keys.
    pub fn min_keys(&self) -> usize {
        (self.order - 1) / 2
    }

    /// Resets the tree to an empty leaf root. Pages the old tree used are not freed; the
    /// caller decides what happens to them.
    pub fn clear(&self) -> Result<()> {
        let _latch = self.latch.write();
        self.write_node(INDEX_ROOT_PAGE_ID, &Node::empty_leaf())
    }

    pub fn search(&self, key: &K) -> Result<Option<V>> {
        let _latch = self.latch.read();
        let (_, leaf) = self.find_leaf(key, &mut Path::new())?;
        let Node::Leaf { keys, values, .. } = leaf else {
            bail!("Descent ended on an internal node");
        };
        Ok(keys.binary_search(key).ok().map(|i| values[i].clone()))
    }

    /// Inserts or overwrites `key`, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.check_entry(&key, &value)?;
        let _latch = self.latch.write();
        let mut path = Path::new();
        let (leaf_id, mut leaf) = self.find_leaf(&key, &mut path)?;
        let Node::Leaf { keys, values, .. } = &mut leaf else {
            bail!("Descent ended on an internal node");
        };

        match keys.binary_search(&key) {
            Ok(i) => {
                let old = std::mem::replace(&mut values[i], value);
                self.write_node(leaf_id, &leaf)?;
                Ok(Some(old))
            }
            Err(i) => {
                keys.insert(i, key);
                values.insert(i, value);
                if leaf.len() < self.order {
                    self.write_node(leaf_id, &leaf)?;
                } else {
                    self.split(leaf_id, leaf, path)?;
                }
                Ok(None)
            }
        }
    }

    /// Removes `key`, returning its value if it was present.
    pub fn delete(&self, key: &K) -> Result<Option<V>> {
        let _latch = self.latch.write();
        let mut path = Path::new();
        let (leaf_id, mut leaf) = self.find_leaf(key, &mut path)?;
        let Node::Leaf { keys, values, .. } = &mut leaf else {
            bail!("Descent ended on an internal node");
        };
        let Ok(i) = keys.binary_search(key) else {
            return Ok(None);
        };
        keys.remove(i);
        let old = values.remove(i);

        self.write_node(leaf_id, &leaf)?;
        if !path.is_empty() && leaf.len() < self.min_keys() {
            self.rebalance(leaf, path)?;
        }
        Ok(Some(old))
    }

    /// Entries whose keys fall within `bounds`, in ascending key order.
    pub fn range<R: RangeBounds<K>>(&self, bounds: R) -> Result<Vec<(K, V)>> {
        let _latch = self.latch.read();
        let (_, mut leaf) = match bounds.start_bound() {
            Bound::Included(start) | Bound::Excluded(start) => {
                self.find_leaf(start, &mut Path::new())?
            }
            Bound::Unbounded => self.leftmost_leaf()?,
        };

        let mut entries = Vec::new();
        loop {
            let Node::Leaf { keys, values, next } = leaf else {
                bail!("Leaf chain reached an internal node");
            };
            for (key, value) in keys.into_iter().zip(values) {
                let after_start = match bounds.start_bound() {
                    Bound::Included(start) => &key >= start,
                    Bound::Excluded(start) => &key > start,
                    Bound::Unbounded => true,
                };
                if !after_start {
                    continue;
                }
                let before_end = match bounds.end_bound() {
                    Bound::Included(end) => &key <= end,
                    Bound::Excluded(end) => &key < end,
                    Bound::Unbounded => true,
                };
                if !before_end {
                    return Ok(entries);
                }
                entries.push((key, value));
            }
            match next {
                Some(next_id) => leaf = self.read_node(next_id)?,
                None => return Ok(entries),
            }
        }
    }

    /// Entries with `low <= key <= high`.
    pub fn range_search(&self, low: &K, high: &K) -> Result<Vec<(K, V)>> {
        self.range((Bound::Included(low.clone()), Bound::Included(high.clone())))
    }

    /// Number of keys, counted by walking the leaf chain.
    pub fn len(&self) -> Result<usize> {
        let _latch = self.latch.read();
        let (_, mut leaf) = self.leftmost_leaf()?;
        let mut count = 0;
        loop {
            count += leaf.len();
            match leaf {
                Node::Leaf { next: Some(next), .. } => leaf = self.read_node(next)?,
                _ => return Ok(count),
            }
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        let _latch = self.latch.read();
        let root = self.read_node(INDEX_ROOT_PAGE_ID)?;
        Ok(root.is_leaf() && root.is_empty())
    }

    /// Number of levels; a lone leaf root has height 1.
    pub fn height(&self) -> Result<usize> {
        let _latch = self.latch.read();
        let mut height = 1;
        let mut node = self.read_node(INDEX_ROOT_PAGE_ID)?;
        while let Node::Internal { children, .. } = node {
            node = self.read_node(children[0])?;
            height += 1;
        }
        Ok(height)
    }

    /// Checks ordering, fill bounds, uniform depth and the leaf chain.
    pub fn validate(&self) -> Result<TreeStats> {
        let _latch = self.latch.read();
        let mut stats = TreeStats::default();
        let mut leaves = Vec::new();
        let depth = self.validate_node(INDEX_ROOT_PAGE_ID, None, None, true, &mut stats, &mut leaves)?;
        stats.height = depth;

        for pair in leaves.windows(2) {
            let (_, next) = pair[0];
            let (id, _) = pair[1];
            if next != Some(id) {
                bail!("Leaf chain broken: expected next {}, found {:?}", id, next);
            }
        }
        if let Some(&(id, next)) = leaves.last() {
            if next.is_some() {
                bail!("Last leaf {} points at {:?}", id, next);
            }
        }
        Ok(stats)
    }

    fn validate_node(
        &self,
        page_id: PageId,
        lower: Option<&K>,
        upper: Option<&K>,
        is_root: bool,
        stats: &mut TreeStats,
        leaves: &mut Vec<(PageId, Option<PageId>)>,
    ) -> Result<usize> {
        let node = self.read_node(page_id)?;
        let keys = node.keys();

        if keys.len() >= self.order {
            bail!("Node {} has {} keys (order {})", page_id, keys.len(), self.order);
        }
        if !is_root && keys.len() < self.min_keys() {
            bail!("Node {} underflows with {} keys", page_id, keys.len());
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            bail!("Node {} keys are not strictly ascending", page_id);
        }
        if let (Some(lower), Some(first)) = (lower, keys.first()) {
            if first < lower {
                bail!("Node {} key {:?} is below separator {:?}", page_id, first, lower);
            }
        }
        if let (Some(upper), Some(last)) = (upper, keys.last()) {
            if last >= upper {
                bail!("Node {} key {:?} is not below separator {:?}", page_id, last, upper);
            }
        }

        match &node {
            Node::Leaf { keys, next, .. } => {
                stats.leaf_nodes += 1;
                stats.keys += keys.len();
                leaves.push((page_id, *next));
                Ok(1)
            }
            Node::Internal { keys, children } => {
                stats.internal_nodes += 1;
                if children.len() != keys.len() + 1 {
                    bail!(
                        "Node {} has {} keys but {} children",
                        page_id,
                        keys.len(),
                        children.len()
                    );
                }
                if is_root && keys.is_empty() {
                    bail!("Internal root has no keys");
                }
                let mut depth = None;
                for (i, &child) in children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(&keys[i - 1]) };
                    let child_upper = keys.get(i).or(upper);
                    let d = self.validate_node(child, child_lower, child_upper, false, stats, leaves)?;
                    match depth {
                        None => depth = Some(d),
                        Some(expected) if expected != d => {
                            bail!("Subtrees of node {} have different depths", page_id)
                        }
                        Some(_) => {}
                    }
                }
                Ok(depth.unwrap_or(0) + 1)
            }
        }
    }

    fn read_node(&self, page_id: PageId) -> Result<Node<K, V>> {
        let guard = self.buffer_pool.fetch_page(page_id)?;
        Node::decode(&guard[..])
    }

    fn write_node(&self, page_id: PageId, node: &Node<K, V>) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
        node.write_to(page_id, &mut guard[..])
    }

    /// Writes `node` to a newly allocated page. The size is checked before allocating.
    fn allocate_node(&self, node: &Node<K, V>) -> Result<PageId> {
        let encoded = node.encode()?;
        if encoded.len() > PAGE_SIZE {
            bail!(StorageError::NodeTooLarge {
                page_id: PageId(0),
                required: encoded.len(),
                available: PAGE_SIZE,
            });
        }
        let (page_id, mut guard) = self.buffer_pool.new_page()?;
        guard[..encoded.len()].copy_from_slice(&encoded);
        Ok(page_id)
    }

    fn find_leaf(&self, key: &K, path: &mut Path) -> Result<(PageId, Node<K, V>)> {
        let mut page_id = INDEX_ROOT_PAGE_ID;
        loop {
            let node = self.read_node(page_id)?;
            if let Node::Internal { keys, children } = &node {
                let idx = find_child_position(keys, key);
                path.push((page_id, idx));
                page_id = children[idx];
                continue;
            }
            return Ok((page_id, node));
        }
    }

    fn leftmost_leaf(&self) -> Result<(PageId, Node<K, V>)> {
        let mut page_id = INDEX_ROOT_PAGE_ID;
        loop {
            let node = self.read_node(page_id)?;
            match &node {
                Node::Internal { children, .. } => page_id = children[0],
                Node::Leaf { .. } => return Ok((page_id, node)),
            }
        }
    }

    /// Splits an overfull node and pushes the separator up the path until a parent absorbs
    /// it or the root itself splits.
    fn split(&self, mut page_id: PageId, mut node: Node<K, V>, mut path: Path) -> Result<()> {
        loop {
            let (separator, right) = split_off_right(&mut node)?;

            let Some((parent_id, idx)) = path.pop() else {
                // The root splits: both halves move out of page 1.
                let right_id = self.allocate_node(&right)?;
                set_next(&mut node, Some(right_id));
                let left_id = self.allocate_node(&node)?;
                let root = Node::Internal {
                    keys: vec![separator],
                    children: vec![left_id, right_id],
                };
                self.write_node(INDEX_ROOT_PAGE_ID, &root)?;
                debug!("root split into pages {} and {}", left_id, right_id);
                return Ok(());
            };

            let right_id = self.allocate_node(&right)?;
            set_next(&mut node, Some(right_id));
            self.write_node(page_id, &node)?;

            let mut parent = self.read_node(parent_id)?;
            let Node::Internal { keys, children } = &mut parent else {
                bail!("Parent page {} is not an internal node", parent_id);
            };
            keys.insert(idx, separator);
            children.insert(idx + 1, right_id);

            if parent.len() < self.order {
                return self.write_node(parent_id, &parent);
            }
            page_id = parent_id;
            node = parent;
        }
    }

    /// Fixes an underflowing non-root node by borrowing from or merging with a sibling,
    /// walking up the path while parents underflow in turn.
    fn rebalance(&self, mut node: Node<K, V>, mut path: Path) -> Result<()> {
        let min = self.min_keys();
        while let Some((parent_id, idx)) = path.pop() {
            let page_id;
            let (mut parent_keys, mut children) = match self.read_node(parent_id)? {
                Node::Internal { keys, children } => {
                    page_id = children[idx];
                    (keys, children)
                }
                Node::Leaf { .. } => bail!("Parent page {} is a leaf", parent_id),
            };

            let mut left = match idx {
                0 => None,
                _ => Some((children[idx - 1], self.read_node(children[idx - 1])?)),
            };
            if let Some((left_id, left)) = left.as_mut().filter(|(_, n)| n.len() > min) {
                borrow_from_left(left, &mut node, &mut parent_keys[idx - 1])?;
                self.write_node(*left_id, left)?;
                self.write_node(page_id, &node)?;
                let parent = Node::Internal {
                    keys: parent_keys,
                    children,
                };
                return self.write_node(parent_id, &parent);
            }

            let mut right = match children.get(idx + 1) {
                Some(&right_id) => Some((right_id, self.read_node(right_id)?)),
                None => None,
            };
            if let Some((right_id, right)) = right.as_mut().filter(|(_, n)| n.len() > min) {
                borrow_from_right(&mut node, right, &mut parent_keys[idx])?;
                self.write_node(*right_id, right)?;
                self.write_node(page_id, &node)?;
                let parent = Node::Internal {
                    keys: parent_keys,
                    children,
                };
                return self.write_node(parent_id, &parent);
            }

            if let Some((left_id, mut left)) = left {
                let separator = parent_keys.remove(idx - 1);
                children.remove(idx);
                merge(&mut left, node, separator)?;
                self.write_node(left_id, &left)?;
                self.buffer_pool.delete_page(page_id)?;
                debug!("merged page {} into {}", page_id, left_id);
            } else if let Some((right_id, right)) = right {
                let separator = parent_keys.remove(idx);
                children.remove(idx + 1);
                merge(&mut node, right, separator)?;
                self.write_node(page_id, &node)?;
                self.buffer_pool.delete_page(right_id)?;
                debug!("merged page {} into {}", right_id, page_id);
            } else {
                bail!("Node {} has no siblings to rebalance with", page_id);
            }

            if parent_id == INDEX_ROOT_PAGE_ID && parent_keys.is_empty() {
                // The root is left with a single child, which takes its place.
                let child_id = children[0];
                let child = self.read_node(child_id)?;
                self.write_node(INDEX_ROOT_PAGE_ID, &child)?;
                self.buffer_pool.delete_page(child_id)?;
                debug!("root collapsed, absorbed page {}", child_id);
                return Ok(());
            }

            let parent = Node::Internal {
                keys: parent_keys,
                children,
            };
            self.write_node(parent_id, &parent)?;
            if path.is_empty() || parent.len() >= min {
                return Ok(());
            }
            node = parent;
        }
        Ok(())
    }
}

/// First child whose subtree may contain `key`: the first `i` with `key < keys[i]`, else
/// the last child.
pub fn find_child_position<K: Ord>(keys: &[K], key: &K) -> usize {
    keys.partition_point(|k| k <= key)
}

/// Moves the upper half of an overfull node into a new right sibling and returns the
/// separator for the parent. A leaf keeps a copy of the separator on the right; an
/// internal node moves its middle key up.
fn split_off_right<K: Clone, V>(node: &mut Node<K, V>) -> Result<(K, Node<K, V>)> {
    let mid = node.len() / 2;
    match node {
        Node::Leaf { keys, values, next } => {
            let right_keys = keys.split_off(mid);
            let right_values = values.split_off(mid);
            let separator = right_keys[0].clone();
            Ok((
                separator,
                Node::Leaf {
                    keys: right_keys,
                    values: right_values,
                    next: *next,
                },
            ))
        }
        Node::Internal { keys, children } => {
            let right_keys = keys.split_off(mid + 1);
            let right_children = children.split_off(mid + 1);
            let Some(separator) = keys.pop() else {
                bail!("Cannot split an internal node with {} keys", mid);
            };
            Ok((
                separator,
                Node::Internal {
                    keys: right_keys,
                    children: right_children,
                },
            ))
        }
    }
}

fn set_next<K, V>(node: &mut Node<K, V>, page_id: Option<PageId>) {
    if let Node::Leaf { next, .. } = node {
        *next = page_id;
    }
}

fn borrow_from_left<K: Clone, V>(
    left: &mut Node<K, V>,
    node: &mut Node<K, V>,
    separator: &mut K,
) -> Result<()> {
    match (left, node) {
        (
            Node::Leaf {
                keys: lk,
                values: lv,
                ..
            },
            Node::Leaf { keys, values, .. },
        ) => {
            let (Some(key), Some(value)) = (lk.pop(), lv.pop()) else {
                bail!("Left sibling is empty");
            };
            keys.insert(0, key);
            values.insert(0, value);
            *separator = keys[0].clone();
        }
        (
            Node::Internal {
                keys: lk,
                children: lc,
            },
            Node::Internal { keys, children },
        ) => {
            let (Some(key), Some(child)) = (lk.pop(), lc.pop()) else {
                bail!("Left sibling is empty");
            };
            keys.insert(0, std::mem::replace(separator, key));
            children.insert(0, child);
        }
        _ => bail!("Sibling nodes differ in kind"),
    }
    Ok(())
}

fn borrow_from_right<K: Clone, V>(
    node: &mut Node<K, V>,
    right: &mut Node<K, V>,
    separator: &mut K,
) -> Result<()> {
    match (node, right) {
        (
            Node::Leaf { keys, values, .. },
            Node::Leaf {
                keys: rk,
                values: rv,
                ..
            },
        ) => {
            if rk.len() < 2 {
                bail!("Right sibling is too small to lend");
            }
            keys.push(rk.remove(0));
            values.push(rv.remove(0));
            *separator = rk[0].clone();
        }
        (
            Node::Internal { keys, children },
            Node::Internal {
                keys: rk,
                children: rc,
            },
        ) => {
            if rk.is_empty() {
                bail!("Right sibling is empty");
            }
            keys.push(std::mem::replace(separator, rk.remove(0)));
            children.push(rc.remove(0));
        }
        _ => bail!("Sibling nodes differ in kind"),
    }
    Ok(())
}

/// Appends `right` to `left`. Internal merges pull the separator down between them.
fn merge<K, V>(left: &mut Node<K, V>, right: Node<K, V>, separator: K) -> Result<()> {
    match (left, right) {
        (
            Node::Leaf { keys, values, next },
            Node::Leaf {
                keys: rk,
                values: rv,
                next: rnext,
            },
        ) => {
            keys.extend(rk);
            values.extend(rv);
            *next = rnext;
        }
        (
            Node::Internal { keys, children },
            Node::Internal {
                keys: rk,
                children: rc,
            },
        ) => {
            keys.push(separator);
            keys.extend(rk);
            children.extend(rc);
        }
        _ => bail!("Sibling nodes differ in kind"),
    }
    Ok(())
}
