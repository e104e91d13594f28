pub mod btree;
pub mod btree_iterator;
pub mod btree_page;
pub mod key_comparator;

pub use btree::BPlusTree;
pub use btree_iterator::BPlusTreeIterator;
pub use btree_page::{
    InternalNode, InternalNodeRef, LeafNode, LeafNodeRef, INTERNAL_PAGE_CAPACITY,
    LEAF_PAGE_CAPACITY,
};
pub use key_comparator::{BytewiseComparator, IndexKey, IntegerComparator, KeyComparator};
