use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{RecordId, Result, INVALID_PAGE_ID};

use super::btree_page::LeafNodeRef;
use super::key_comparator::IndexKey;

/// Forward iterator over the leaf chain. Holds a read pin on exactly one
/// leaf page at a time; the end sentinel holds none.
pub struct BPlusTreeIterator {
    bpm: Arc<BufferPoolManager>,
    leaf_guard: Option<ReadPageGuard>,
    index: usize,
}

impl BPlusTreeIterator {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, leaf_guard: ReadPageGuard, index: usize) -> Self {
        Self {
            bpm,
            leaf_guard: Some(leaf_guard),
            index,
        }
    }

    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            leaf_guard: None,
            index: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.leaf_guard.is_none()
    }

    /// The entry at the current position.
    ///
    /// # Panics
    /// Panics when the iterator is at its end.
    pub fn entry(&self) -> (IndexKey, RecordId) {
        let guard = self
            .leaf_guard
            .as_ref()
            .expect("dereferenced an exhausted iterator");
        let leaf = LeafNodeRef::new(guard.data());
        assert!(
            self.index < leaf.size(),
            "dereferenced an exhausted iterator"
        );
        (leaf.key_at(self.index), leaf.record_at(self.index))
    }

    /// Steps to the next entry, crossing to the next leaf (and releasing the
    /// current pin) when the current one is used up.
    pub fn advance(&mut self) -> Result<()> {
        if self.leaf_guard.is_none() {
            return Ok(());
        }
        self.index += 1;
        self.skip_exhausted_leaf()
    }

    /// Moves past any leaf whose entries are exhausted, landing either on a
    /// valid position or the end sentinel.
    pub(crate) fn skip_exhausted_leaf(&mut self) -> Result<()> {
        while let Some(guard) = self.leaf_guard.as_ref() {
            let leaf = LeafNodeRef::new(guard.data());
            if self.index < leaf.size() {
                return Ok(());
            }

            let next = leaf.next_page_id();
            self.leaf_guard = None;
            self.index = 0;

            if next == INVALID_PAGE_ID {
                return Ok(());
            }
            self.leaf_guard = Some(self.bpm.fetch_page_read(next)?);
        }
        Ok(())
    }
}

impl PartialEq for BPlusTreeIterator {
    fn eq(&self, other: &Self) -> bool {
        match (&self.leaf_guard, &other.leaf_guard) {
            (None, None) => true,
            (Some(a), Some(b)) => a.page_id() == b.page_id() && self.index == other.index,
            _ => false,
        }
    }
}

impl Iterator for BPlusTreeIterator {
    type Item = Result<(IndexKey, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_end() {
            return None;
        }
        let item = self.entry();
        match self.advance() {
            Ok(()) => Some(Ok(item)),
            Err(e) => Some(Err(e)),
        }
    }
}
