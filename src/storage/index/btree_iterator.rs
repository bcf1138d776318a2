use std::sync::Arc;

use crate::buffer::{PageReadGuard, PageRef, INVALID_PAGE_ID};
use crate::error::PlumeDBResult;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::index::BPlusTreeIndex;
use crate::storage::page::{BPlusTreeLeafPage, RecordId};

/// Forward iterator over the leaf chain. Holds one pinned, read-latched
/// leaf at a time; advancing past the last entry hops to `next_page_id`
/// and releases the previous leaf. Reaching the end releases everything.
pub struct TreeIndexIterator {
    index: Arc<BPlusTreeIndex>,
    current: Option<(PageRef, PageReadGuard, BPlusTreeLeafPage)>,
    cursor: usize,
}

impl TreeIndexIterator {
    /// Iterator positioned at the smallest key.
    pub fn begin(index: Arc<BPlusTreeIndex>) -> PlumeDBResult<Self> {
        let current = index.first_leaf()?;
        Ok(Self {
            index,
            current,
            cursor: 0,
        })
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn begin_at(index: Arc<BPlusTreeIndex>, key: &[u8]) -> PlumeDBResult<Self> {
        let current = index.leaf_for_key(key)?;
        let cursor = match &current {
            Some((_, _, leaf)) => leaf.lower_bound(key),
            None => 0,
        };
        Ok(Self {
            index,
            current,
            cursor,
        })
    }

    /// Exhausted: past the last entry of the last leaf.
    pub fn is_end(&self) -> bool {
        match &self.current {
            None => true,
            Some((_, _, leaf)) => {
                self.cursor >= leaf.header.current_size as usize
                    && leaf.header.next_page_id == INVALID_PAGE_ID
            }
        }
    }

    pub fn next(&mut self) -> PlumeDBResult<Option<(Vec<u8>, RecordId)>> {
        loop {
            let Some((_, _, leaf)) = &self.current else {
                return Ok(None);
            };
            if self.cursor < leaf.header.current_size as usize {
                let entry = leaf.kv_at(self.cursor).clone();
                self.cursor += 1;
                return Ok(Some(entry));
            }
            let next_page_id = leaf.header.next_page_id;
            if next_page_id == INVALID_PAGE_ID {
                // unpin the final leaf
                self.current = None;
                return Ok(None);
            }
            let next_ref = self.index.buffer_pool.fetch_page(next_page_id)?;
            let next_guard = next_ref.read();
            let (next_leaf, _) =
                BPlusTreeLeafPageCodec::decode(next_guard.data(), self.index.comparator)?;
            // the previous leaf's latch and pin drop here
            self.current = Some((next_ref, next_guard, next_leaf));
            self.cursor = 0;
        }
    }
}
