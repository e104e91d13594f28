use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::BufferPoolManager;
use crate::common::{PageId, RecordId, Result, StratumError, INVALID_PAGE_ID};
use crate::storage::page::{HeaderPage, HeaderPageRef, MAX_INDEX_NAME_LEN};

use super::btree_iterator::BPlusTreeIterator;
use super::btree_page::{
    node_is_leaf, node_set_parent_page_id, InternalNode, InternalNodeRef, LeafNode, LeafNodeRef,
    INTERNAL_PAGE_CAPACITY, LEAF_PAGE_CAPACITY,
};
use super::key_comparator::{IndexKey, KeyComparator};

/// B+tree index over fixed-width keys, with every node a buffer-pool page.
///
/// The tree itself holds only the root page id and its configuration; all
/// node access goes through the pool's pin/unpin contract. Mutating
/// operations take `&mut self`: at most one insert or remove may be in
/// flight at a time, and that exclusion is the caller's responsibility.
pub struct BPlusTree {
    index_name: String,
    /// Page holding the (index name -> root page id) record
    header_page_id: PageId,
    root_page_id: PageId,
    bpm: Arc<BufferPoolManager>,
    comparator: Arc<dyn KeyComparator>,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl BPlusTree {
    /// Creates an empty tree, allocating its header page and registering the
    /// index name with an invalid root.
    pub fn create(
        index_name: &str,
        bpm: Arc<BufferPoolManager>,
        comparator: Arc<dyn KeyComparator>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        if index_name.len() > MAX_INDEX_NAME_LEN {
            return Err(StratumError::IndexNameTooLong(index_name.to_string()));
        }
        assert!((2..=LEAF_PAGE_CAPACITY).contains(&leaf_max_size));
        // An internal page transiently holds max_size + 1 entries mid-split.
        assert!((3..INTERNAL_PAGE_CAPACITY).contains(&internal_max_size));

        let mut header_guard = bpm.new_page()?;
        let header_page_id = header_guard.page_id();
        {
            let mut header = HeaderPage::new(header_guard.data_mut());
            header.init();
            header.insert_record(index_name, INVALID_PAGE_ID);
        }
        drop(header_guard);

        Ok(Self {
            index_name: index_name.to_string(),
            header_page_id,
            root_page_id: INVALID_PAGE_ID,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        })
    }

    /// Reopens an index whose root record lives in an existing header page.
    pub fn open(
        index_name: &str,
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        comparator: Arc<dyn KeyComparator>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let root_page_id = {
            let guard = bpm.fetch_page_read(header_page_id)?;
            let header = HeaderPageRef::new(guard.data());
            header.get_record(index_name).unwrap_or(INVALID_PAGE_ID)
        };

        Ok(Self {
            index_name: index_name.to_string(),
            header_page_id,
            root_page_id,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    pub fn leaf_max_size(&self) -> usize {
        self.leaf_max_size
    }

    pub fn internal_max_size(&self) -> usize {
        self.internal_max_size
    }

    /// Fewest entries a non-root leaf may hold.
    pub fn leaf_min_size(&self) -> usize {
        self.leaf_max_size / 2
    }

    /// Fewest entries (children) a non-root internal page may hold.
    pub fn internal_min_size(&self) -> usize {
        (self.internal_max_size + 1) / 2
    }

    /// Point lookup; `None` when the key is absent.
    pub fn get_value(&self, key: &IndexKey) -> Result<Option<RecordId>> {
        if self.is_empty() {
            return Ok(None);
        }

        let leaf_id = self.find_leaf(key)?;
        let guard = self.bpm.fetch_page_read(leaf_id)?;
        let leaf = LeafNodeRef::new(guard.data());

        let pos = leaf.lower_bound(key, &*self.comparator);
        if pos < leaf.size() && self.keys_equal(&leaf.key_at(pos), key) {
            Ok(Some(leaf.record_at(pos)))
        } else {
            Ok(None)
        }
    }

    /// Inserts a key/record pair; false when the key is already present.
    pub fn insert(&mut self, key: &IndexKey, record: &RecordId) -> Result<bool> {
        if self.is_empty() {
            self.start_new_tree(key, record)?;
            return Ok(true);
        }

        let leaf_id = self.find_leaf(key)?;

        {
            let guard = self.bpm.fetch_page_read(leaf_id)?;
            let leaf = LeafNodeRef::new(guard.data());
            let pos = leaf.lower_bound(key, &*self.comparator);
            if pos < leaf.size() && self.keys_equal(&leaf.key_at(pos), key) {
                return Ok(false);
            }
        }

        let size_after = {
            let mut guard = self.bpm.fetch_page_write(leaf_id)?;
            let mut leaf = LeafNode::new(guard.data_mut());
            leaf.insert(key, record, &*self.comparator);
            leaf.size()
        };

        if size_after >= self.leaf_max_size {
            self.split_leaf(leaf_id)?;
        }

        Ok(true)
    }

    /// Removes a key; absent keys are a silent no-op.
    pub fn remove(&mut self, key: &IndexKey) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let leaf_id = self.find_leaf(key)?;

        let pos = {
            let guard = self.bpm.fetch_page_read(leaf_id)?;
            let leaf = LeafNodeRef::new(guard.data());
            let pos = leaf.lower_bound(key, &*self.comparator);
            if pos >= leaf.size() || !self.keys_equal(&leaf.key_at(pos), key) {
                return Ok(());
            }
            pos
        };

        let size_after = {
            let mut guard = self.bpm.fetch_page_write(leaf_id)?;
            let mut leaf = LeafNode::new(guard.data_mut());
            leaf.remove_at(pos);
            leaf.size()
        };

        if size_after < self.leaf_min_size() {
            self.coalesce_or_redistribute(leaf_id)?;
        }

        Ok(())
    }

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<BPlusTreeIterator> {
        if self.is_empty() {
            return Ok(BPlusTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let mut current = self.root_page_id;
        loop {
            let guard = self.bpm.fetch_page_read(current)?;
            if node_is_leaf(guard.data()) {
                return Ok(BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, 0));
            }
            let node = InternalNodeRef::new(guard.data());
            current = node.child_at(0);
        }
    }

    /// Iterator positioned at the first entry whose key is >= `key`.
    pub fn begin_at(&self, key: &IndexKey) -> Result<BPlusTreeIterator> {
        if self.is_empty() {
            return Ok(BPlusTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let leaf_id = self.find_leaf(key)?;
        let guard = self.bpm.fetch_page_read(leaf_id)?;
        let index = LeafNodeRef::new(guard.data()).lower_bound(key, &*self.comparator);

        let mut iter = BPlusTreeIterator::new(Arc::clone(&self.bpm), guard, index);
        iter.skip_exhausted_leaf()?;
        Ok(iter)
    }

    /// End sentinel.
    pub fn end(&self) -> BPlusTreeIterator {
        BPlusTreeIterator::end(Arc::clone(&self.bpm))
    }

    /// All entries with keys in `[low, high]`, in key order.
    pub fn range_scan(
        &self,
        low: &IndexKey,
        high: &IndexKey,
    ) -> Result<Vec<(IndexKey, RecordId)>> {
        let mut results = Vec::new();
        let mut iter = self.begin_at(low)?;

        while !iter.is_end() {
            let (key, record) = iter.entry();
            if self.comparator.compare(key.as_bytes(), high.as_bytes()) == Ordering::Greater {
                break;
            }
            results.push((key, record));
            iter.advance()?;
        }

        Ok(results)
    }

    fn keys_equal(&self, a: &IndexKey, b: &IndexKey) -> bool {
        self.comparator.compare(a.as_bytes(), b.as_bytes()) == Ordering::Equal
    }

    /// Descends to the leaf covering `key`, pinning one node at a time.
    fn find_leaf(&self, key: &IndexKey) -> Result<PageId> {
        let mut current = self.root_page_id;

        loop {
            let next = {
                let guard = self.bpm.fetch_page_read(current)?;
                if node_is_leaf(guard.data()) {
                    return Ok(current);
                }
                InternalNodeRef::new(guard.data()).lookup(key, &*self.comparator)
            };
            current = next;
        }
    }

    fn start_new_tree(&mut self, key: &IndexKey, record: &RecordId) -> Result<()> {
        let mut guard = self.bpm.new_page()?;
        let page_id = guard.page_id();
        {
            let mut leaf = LeafNode::init(
                guard.data_mut(),
                page_id,
                INVALID_PAGE_ID,
                self.leaf_max_size,
            );
            leaf.insert(key, record, &*self.comparator);
        }
        drop(guard);

        self.root_page_id = page_id;
        self.update_root_page_id()?;
        debug!(root = page_id.as_u32(), "started new tree");
        Ok(())
    }

    /// Splits a full leaf, splicing the new leaf into the chain and pushing
    /// the split key to the parent. The new page is allocated before the
    /// donor is touched, so an exhausted pool aborts with the tree intact.
    fn split_leaf(&mut self, leaf_id: PageId) -> Result<()> {
        let mut new_guard = self.bpm.new_page()?;
        let new_leaf_id = new_guard.page_id();

        let (split_key, moved, old_next, parent_id) = {
            let mut guard = self.bpm.fetch_page_write(leaf_id)?;
            let mut leaf = LeafNode::new(guard.data_mut());
            let (split_key, moved) = leaf.split_off_upper_half();
            let old_next = leaf.next_page_id();
            leaf.set_next_page_id(new_leaf_id);
            (split_key, moved, old_next, leaf.parent_page_id())
        };

        {
            let mut new_leaf = LeafNode::init(
                new_guard.data_mut(),
                new_leaf_id,
                parent_id,
                self.leaf_max_size,
            );
            new_leaf.append_entries(&moved);
            new_leaf.set_next_page_id(old_next);
        }
        drop(new_guard);

        debug!(
            left = leaf_id.as_u32(),
            right = new_leaf_id.as_u32(),
            "split leaf"
        );
        self.insert_into_parent(leaf_id, &split_key, new_leaf_id, parent_id)
    }

    /// Splits a full internal node, re-parenting the moved children.
    fn split_internal(&mut self, internal_id: PageId) -> Result<()> {
        let mut new_guard = self.bpm.new_page()?;
        let new_internal_id = new_guard.page_id();

        let (split_key, moved, parent_id) = {
            let mut guard = self.bpm.fetch_page_write(internal_id)?;
            let mut node = InternalNode::new(guard.data_mut());
            let (split_key, moved) = node.split_off_upper_half();
            (split_key, moved, node.parent_page_id())
        };

        {
            let mut new_node = InternalNode::init(
                new_guard.data_mut(),
                new_internal_id,
                parent_id,
                self.internal_max_size,
            );
            new_node.append_entries(&moved);
        }
        drop(new_guard);

        for (_, child_id) in &moved {
            let mut guard = self.bpm.fetch_page_write(*child_id)?;
            node_set_parent_page_id(guard.data_mut(), new_internal_id);
        }

        debug!(
            left = internal_id.as_u32(),
            right = new_internal_id.as_u32(),
            "split internal node"
        );
        self.insert_into_parent(internal_id, &split_key, new_internal_id, parent_id)
    }

    /// Links a freshly split-off node into the tree above `old_id`.
    fn insert_into_parent(
        &mut self,
        old_id: PageId,
        split_key: &IndexKey,
        new_id: PageId,
        parent_id: PageId,
    ) -> Result<()> {
        if parent_id == INVALID_PAGE_ID {
            // The old node was the root: grow the tree by one level.
            let mut root_guard = self.bpm.new_page()?;
            let new_root_id = root_guard.page_id();
            {
                let mut root = InternalNode::init(
                    root_guard.data_mut(),
                    new_root_id,
                    INVALID_PAGE_ID,
                    self.internal_max_size,
                );
                root.populate_new_root(old_id, split_key, new_id);
            }
            drop(root_guard);

            for child in [old_id, new_id] {
                let mut guard = self.bpm.fetch_page_write(child)?;
                node_set_parent_page_id(guard.data_mut(), new_root_id);
            }

            self.root_page_id = new_root_id;
            self.update_root_page_id()?;
            debug!(root = new_root_id.as_u32(), "grew tree root");
            return Ok(());
        }

        let size_after = {
            let mut guard = self.bpm.fetch_page_write(parent_id)?;
            let mut parent = InternalNode::new(guard.data_mut());
            parent.insert_node_after(old_id, split_key, new_id);
            parent.size()
        };

        {
            let mut guard = self.bpm.fetch_page_write(new_id)?;
            node_set_parent_page_id(guard.data_mut(), parent_id);
        }

        // An internal page may sit at max_size; it splits only when an
        // insert pushes it past, so both halves keep at least two children.
        if size_after > self.internal_max_size {
            self.split_internal(parent_id)?;
        }

        Ok(())
    }

    /// Handles an underfull non-root node by merging with or borrowing from
    /// a sibling; an underfull root goes through `adjust_root` instead.
    fn coalesce_or_redistribute(&mut self, node_id: PageId) -> Result<()> {
        let (node_size, parent_id, is_leaf) = {
            let guard = self.bpm.fetch_page_read(node_id)?;
            let data = guard.data();
            (
                super::btree_page::node_size(data),
                super::btree_page::node_parent_page_id(data),
                node_is_leaf(data),
            )
        };

        if parent_id == INVALID_PAGE_ID {
            return self.adjust_root(node_id);
        }

        // Prefer the left sibling; fall back to the right one.
        let (node_index, sibling_id, is_prev) = {
            let guard = self.bpm.fetch_page_read(parent_id)?;
            let parent = InternalNodeRef::new(guard.data());
            let node_index = match parent.child_index(node_id) {
                Some(index) => index,
                None => return Ok(()),
            };
            if node_index > 0 {
                (node_index, parent.child_at(node_index - 1), true)
            } else {
                (node_index, parent.child_at(node_index + 1), false)
            }
        };

        let sibling_size = {
            let guard = self.bpm.fetch_page_read(sibling_id)?;
            super::btree_page::node_size(guard.data())
        };

        // Merge only when the result fits a node's steady-state maximum:
        // a leaf holds at most leaf_max_size - 1 entries between splits,
        // an internal page up to internal_max_size.
        let can_coalesce = if is_leaf {
            node_size + sibling_size < self.leaf_max_size
        } else {
            node_size + sibling_size <= self.internal_max_size
        };

        if can_coalesce {
            let (left_id, right_id, right_index) = if is_prev {
                (sibling_id, node_id, node_index)
            } else {
                (node_id, sibling_id, node_index + 1)
            };
            self.coalesce(left_id, right_id, parent_id, right_index, is_leaf)
        } else {
            self.redistribute(node_id, sibling_id, parent_id, node_index, is_prev, is_leaf)
        }
    }

    /// Merges the right node of a sibling pair into the left one, removes
    /// the separator from the parent, and deletes the right page.
    fn coalesce(
        &mut self,
        left_id: PageId,
        right_id: PageId,
        parent_id: PageId,
        right_index: usize,
        is_leaf: bool,
    ) -> Result<()> {
        if is_leaf {
            let (entries, right_next) = {
                let guard = self.bpm.fetch_page_read(right_id)?;
                let right = LeafNodeRef::new(guard.data());
                (right.entries(), right.next_page_id())
            };
            let mut guard = self.bpm.fetch_page_write(left_id)?;
            let mut left = LeafNode::new(guard.data_mut());
            left.append_entries(&entries);
            left.set_next_page_id(right_next);
        } else {
            // The parent separator comes down as the first key of the
            // merged-in right half.
            let separator = {
                let guard = self.bpm.fetch_page_read(parent_id)?;
                InternalNodeRef::new(guard.data()).key_at(right_index)
            };
            let entries = {
                let guard = self.bpm.fetch_page_read(right_id)?;
                let mut entries = InternalNodeRef::new(guard.data()).entries();
                entries[0].0 = separator;
                entries
            };
            {
                let mut guard = self.bpm.fetch_page_write(left_id)?;
                let mut left = InternalNode::new(guard.data_mut());
                left.append_entries(&entries);
            }
            for (_, child_id) in &entries {
                let mut guard = self.bpm.fetch_page_write(*child_id)?;
                node_set_parent_page_id(guard.data_mut(), left_id);
            }
        }

        let (parent_size, parent_parent_id) = {
            let mut guard = self.bpm.fetch_page_write(parent_id)?;
            let mut parent = InternalNode::new(guard.data_mut());
            parent.remove_at(right_index);
            (parent.size(), parent.parent_page_id())
        };

        self.bpm.delete_page(right_id)?;
        debug!(
            left = left_id.as_u32(),
            right = right_id.as_u32(),
            "coalesced siblings"
        );

        if parent_parent_id == INVALID_PAGE_ID {
            self.adjust_root(parent_id)
        } else if parent_size < self.internal_min_size() {
            self.coalesce_or_redistribute(parent_id)
        } else {
            Ok(())
        }
    }

    /// Borrows one entry across the sibling boundary and refreshes the
    /// parent separator to the new boundary key.
    fn redistribute(
        &mut self,
        node_id: PageId,
        sibling_id: PageId,
        parent_id: PageId,
        node_index: usize,
        is_prev: bool,
        is_leaf: bool,
    ) -> Result<()> {
        if is_leaf {
            if is_prev {
                // Borrow the left sibling's last entry.
                let (key, record) = {
                    let mut guard = self.bpm.fetch_page_write(sibling_id)?;
                    let mut sibling = LeafNode::new(guard.data_mut());
                    let last = sibling.size() - 1;
                    let entry = (sibling.key_at(last), sibling.record_at(last));
                    sibling.remove_at(last);
                    entry
                };
                {
                    let mut guard = self.bpm.fetch_page_write(node_id)?;
                    let mut node = LeafNode::new(guard.data_mut());
                    node.insert(&key, &record, &*self.comparator);
                }
                let mut guard = self.bpm.fetch_page_write(parent_id)?;
                let mut parent = InternalNode::new(guard.data_mut());
                parent.set_key_at(node_index, &key);
            } else {
                // Borrow the right sibling's first entry.
                let (key, record, new_separator) = {
                    let mut guard = self.bpm.fetch_page_write(sibling_id)?;
                    let mut sibling = LeafNode::new(guard.data_mut());
                    let entry = (sibling.key_at(0), sibling.record_at(0));
                    sibling.remove_at(0);
                    (entry.0, entry.1, sibling.key_at(0))
                };
                {
                    let mut guard = self.bpm.fetch_page_write(node_id)?;
                    let mut node = LeafNode::new(guard.data_mut());
                    node.insert(&key, &record, &*self.comparator);
                }
                let mut guard = self.bpm.fetch_page_write(parent_id)?;
                let mut parent = InternalNode::new(guard.data_mut());
                parent.set_key_at(node_index + 1, &new_separator);
            }
        } else if is_prev {
            // Rotate the left sibling's last child through the parent.
            let separator = {
                let guard = self.bpm.fetch_page_read(parent_id)?;
                InternalNodeRef::new(guard.data()).key_at(node_index)
            };
            let (borrowed_key, borrowed_child) = {
                let mut guard = self.bpm.fetch_page_write(sibling_id)?;
                let mut sibling = InternalNode::new(guard.data_mut());
                let last = sibling.size() - 1;
                let entry = (sibling.key_at(last), sibling.child_at(last));
                sibling.remove_at(last);
                entry
            };
            {
                let mut guard = self.bpm.fetch_page_write(node_id)?;
                let mut node = InternalNode::new(guard.data_mut());
                node.insert_at(0, &IndexKey::ZERO, borrowed_child);
                node.set_key_at(1, &separator);
            }
            {
                let mut guard = self.bpm.fetch_page_write(parent_id)?;
                let mut parent = InternalNode::new(guard.data_mut());
                parent.set_key_at(node_index, &borrowed_key);
            }
            let mut guard = self.bpm.fetch_page_write(borrowed_child)?;
            node_set_parent_page_id(guard.data_mut(), node_id);
        } else {
            // Rotate the right sibling's leftmost child through the parent.
            let separator = {
                let guard = self.bpm.fetch_page_read(parent_id)?;
                InternalNodeRef::new(guard.data()).key_at(node_index + 1)
            };
            let (borrowed_child, new_separator) = {
                let mut guard = self.bpm.fetch_page_write(sibling_id)?;
                let mut sibling = InternalNode::new(guard.data_mut());
                let child = sibling.child_at(0);
                let new_separator = sibling.key_at(1);
                sibling.remove_at(0);
                sibling.set_key_at(0, &IndexKey::ZERO);
                (child, new_separator)
            };
            {
                let mut guard = self.bpm.fetch_page_write(node_id)?;
                let mut node = InternalNode::new(guard.data_mut());
                let size = node.size();
                node.insert_at(size, &separator, borrowed_child);
            }
            {
                let mut guard = self.bpm.fetch_page_write(parent_id)?;
                let mut parent = InternalNode::new(guard.data_mut());
                parent.set_key_at(node_index + 1, &new_separator);
            }
            let mut guard = self.bpm.fetch_page_write(borrowed_child)?;
            node_set_parent_page_id(guard.data_mut(), node_id);
        }

        Ok(())
    }

    /// Shrinks the tree at the top: an empty leaf root empties the tree, an
    /// internal root with a single child promotes that child.
    fn adjust_root(&mut self, root_id: PageId) -> Result<()> {
        let (is_leaf, size, first_child) = {
            let guard = self.bpm.fetch_page_read(root_id)?;
            let data = guard.data();
            let first_child = if node_is_leaf(data) {
                INVALID_PAGE_ID
            } else {
                InternalNodeRef::new(data).child_at(0)
            };
            (node_is_leaf(data), super::btree_page::node_size(data), first_child)
        };

        if is_leaf && size == 0 {
            self.root_page_id = INVALID_PAGE_ID;
            self.update_root_page_id()?;
            self.bpm.delete_page(root_id)?;
            debug!("tree emptied");
        } else if !is_leaf && size == 1 {
            {
                let mut guard = self.bpm.fetch_page_write(first_child)?;
                node_set_parent_page_id(guard.data_mut(), INVALID_PAGE_ID);
            }
            self.root_page_id = first_child;
            self.update_root_page_id()?;
            self.bpm.delete_page(root_id)?;
            debug!(root = first_child.as_u32(), "collapsed tree root");
        }

        Ok(())
    }

    /// Writes the current root page id into this index's header record.
    fn update_root_page_id(&self) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let mut header = HeaderPage::new(guard.data_mut());
        if !header.update_record(&self.index_name, self.root_page_id) {
            header.insert_record(&self.index_name, self.root_page_id);
        }
        Ok(())
    }
}
