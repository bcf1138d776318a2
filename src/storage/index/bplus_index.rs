use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::buffer::{
    AtomicPageId, BufferPoolManager, PageId, PageReadGuard, PageRef, PageWriteGuard,
    INVALID_PAGE_ID,
};
use crate::error::{PlumeDBError, PlumeDBResult};
use crate::storage::codec::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec,
    BPlusTreePageCodec,
};
use crate::storage::index::comparator::KeyComparator;
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, RecordId,
};
use crate::utils::util::page_bytes_to_array;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Insert,
    Delete,
}

/// One write-latched page on the descent path. The guard is declared first
/// so it is released before the pin.
struct LatchedPage {
    guard: PageWriteGuard,
    page: PageRef,
}

impl LatchedPage {
    fn page_id(&self) -> PageId {
        self.page.page_id()
    }
}

/// Per-operation page set: the chain of write latches still held, root
/// first, plus pages to free once every latch is gone. Dropping the
/// context is the single release point.
struct Context {
    write_set: VecDeque<LatchedPage>,
    deleted_pages: Vec<PageId>,
}

impl Context {
    fn new() -> Self {
        Self {
            write_set: VecDeque::new(),
            deleted_pages: Vec::new(),
        }
    }
}

/// B+ tree index over byte-string keys and RID values. Keys are unique.
/// Node pages live in the buffer pool; the tree itself owns only the root
/// page id. Concurrent operations use latch crabbing: readers hold at most
/// one page latch, writers keep the ancestor chain latched until a child
/// is safe for the pending operation.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    pub index_name: String,
    pub buffer_pool: Arc<BufferPoolManager>,
    pub comparator: KeyComparator,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
    pub root_page_id: AtomicPageId,
    header_page_id: Option<PageId>,
    // serializes root transitions and header page updates
    tree_latch: Mutex<()>,
}

impl BPlusTreeIndex {
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Self {
        assert!(leaf_max_size >= 3, "leaf max size must be at least 3");
        assert!(
            internal_max_size >= 3,
            "internal max size must be at least 3"
        );
        Self {
            index_name: index_name.into(),
            buffer_pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            root_page_id: AtomicPageId::new(INVALID_PAGE_ID),
            header_page_id: None,
            tree_latch: Mutex::new(()),
        }
    }

    /// Allocate an empty header page.
    pub fn create_header_page(buffer_pool: &Arc<BufferPoolManager>) -> PlumeDBResult<PageId> {
        let page = buffer_pool.new_page()?;
        let header = BPlusTreeHeaderPage::new();
        page.write()
            .set_data(page_bytes_to_array(&BPlusTreeHeaderPageCodec::encode(
                &header,
            )));
        Ok(page.page_id())
    }

    /// Attach this index to a header page: re-open an existing record or
    /// register a fresh one.
    pub fn with_header(mut self, header_page_id: PageId) -> PlumeDBResult<Self> {
        let header_ref = self.buffer_pool.fetch_page(header_page_id)?;
        let mut guard = header_ref.write();
        let (mut header, _) = BPlusTreeHeaderPageCodec::decode(guard.data())?;
        match header.get_root_page_id(&self.index_name) {
            Some(root_page_id) => {
                self.root_page_id.store(root_page_id, Ordering::SeqCst);
            }
            None => {
                header.insert_record(&self.index_name, INVALID_PAGE_ID);
                guard.set_data(page_bytes_to_array(&BPlusTreeHeaderPageCodec::encode(
                    &header,
                )));
            }
        }
        drop(guard);
        self.header_page_id = Some(header_page_id);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(Ordering::SeqCst) == INVALID_PAGE_ID
    }

    /// Point lookup.
    pub fn get_value(&self, key: &[u8]) -> PlumeDBResult<Option<RecordId>> {
        let Some((_page, _guard, leaf)) = self.find_leaf_read(key)? else {
            return Ok(None);
        };
        Ok(leaf.look_up(key))
    }

    /// Insert a unique key. Returns false (and changes nothing) when the
    /// key is already present.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> PlumeDBResult<bool> {
        loop {
            let mut context = Context::new();
            if self.find_leaf_write(key, Operation::Insert, &mut context)? {
                return self.insert_into_leaf(key, rid, &mut context);
            }
            drop(context);
            self.start_new_tree()?;
        }
    }

    /// Remove a key; removing an absent key is a no-op.
    pub fn remove(&self, key: &[u8]) -> PlumeDBResult<()> {
        let mut context = Context::new();
        if !self.find_leaf_write(key, Operation::Delete, &mut context)? {
            return Ok(());
        }
        self.delete_entry(key, &mut context)?;
        // latches and pins go first, then the emptied pages
        let deleted_pages = std::mem::take(&mut context.deleted_pages);
        drop(context);
        for page_id in deleted_pages {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // descent
    // ---------------------------------------------------------------

    /// Latch the root for reading, revalidating `root_page_id` after the
    /// latch is held in case the root moved underneath us.
    fn latch_root_read(&self) -> PlumeDBResult<Option<(PageRef, PageReadGuard)>> {
        loop {
            let root_page_id = self.root_page_id.load(Ordering::SeqCst);
            if root_page_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let page = self.buffer_pool.fetch_page(root_page_id)?;
            let guard = page.read();
            if self.root_page_id.load(Ordering::SeqCst) == root_page_id {
                return Ok(Some((page, guard)));
            }
        }
    }

    /// Read-crab down to the leaf covering `key`: latch the child, then
    /// release the parent.
    fn find_leaf_read(
        &self,
        key: &[u8],
    ) -> PlumeDBResult<Option<(PageRef, PageReadGuard, BPlusTreeLeafPage)>> {
        let Some((mut page, mut guard)) = self.latch_root_read()? else {
            return Ok(None);
        };
        loop {
            let (tree_page, _) = BPlusTreePageCodec::decode(guard.data(), self.comparator)?;
            match tree_page {
                BPlusTreePage::Leaf(leaf) => return Ok(Some((page, guard, leaf))),
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.look_up(key);
                    let child = self.buffer_pool.fetch_page(child_id)?;
                    let child_guard = child.read();
                    page = child;
                    guard = child_guard;
                }
            }
        }
    }

    /// Leftmost leaf, read-latched. Used by the iterator.
    pub(crate) fn first_leaf(
        &self,
    ) -> PlumeDBResult<Option<(PageRef, PageReadGuard, BPlusTreeLeafPage)>> {
        let Some((mut page, mut guard)) = self.latch_root_read()? else {
            return Ok(None);
        };
        loop {
            let (tree_page, _) = BPlusTreePageCodec::decode(guard.data(), self.comparator)?;
            match tree_page {
                BPlusTreePage::Leaf(leaf) => return Ok(Some((page, guard, leaf))),
                BPlusTreePage::Internal(internal) => {
                    let child = self.buffer_pool.fetch_page(internal.value_at(0))?;
                    let child_guard = child.read();
                    page = child;
                    guard = child_guard;
                }
            }
        }
    }

    pub(crate) fn leaf_for_key(
        &self,
        key: &[u8],
    ) -> PlumeDBResult<Option<(PageRef, PageReadGuard, BPlusTreeLeafPage)>> {
        self.find_leaf_read(key)
    }

    /// Write-crab down to the target leaf. Ancestor latches are released as
    /// soon as a child is safe for `op`; an unsafe child keeps the whole
    /// chain latched. Returns false when the tree is empty.
    fn find_leaf_write(
        &self,
        key: &[u8],
        op: Operation,
        context: &mut Context,
    ) -> PlumeDBResult<bool> {
        loop {
            let root_page_id = self.root_page_id.load(Ordering::SeqCst);
            if root_page_id == INVALID_PAGE_ID {
                return Ok(false);
            }
            let page = self.buffer_pool.fetch_page(root_page_id)?;
            let guard = page.write();
            if self.root_page_id.load(Ordering::SeqCst) == root_page_id {
                context.write_set.push_back(LatchedPage { guard, page });
                break;
            }
        }
        loop {
            let child_id = {
                let current = context.write_set.back().unwrap();
                let (tree_page, _) =
                    BPlusTreePageCodec::decode(current.guard.data(), self.comparator)?;
                match tree_page {
                    BPlusTreePage::Leaf(_) => return Ok(true),
                    BPlusTreePage::Internal(internal) => internal.look_up(key),
                }
            };
            let child = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child.write();
            let (child_page, _) = BPlusTreePageCodec::decode(child_guard.data(), self.comparator)?;
            if self.is_safe(&child_page, op) {
                context.write_set.clear();
            }
            context.write_set.push_back(LatchedPage {
                guard: child_guard,
                page: child,
            });
        }
    }

    /// A safe node absorbs the pending operation without touching its
    /// parent: room for one more entry on insert, one above minimum on
    /// delete.
    fn is_safe(&self, page: &BPlusTreePage, op: Operation) -> bool {
        match op {
            Operation::Insert => match page {
                BPlusTreePage::Leaf(leaf) => leaf.header.current_size < self.leaf_max_size - 1,
                BPlusTreePage::Internal(internal) => {
                    internal.header.current_size < self.internal_max_size
                }
            },
            Operation::Delete => page.current_size() > page.min_size(),
        }
    }

    // ---------------------------------------------------------------
    // insertion
    // ---------------------------------------------------------------

    /// Plant an empty root leaf; loses gracefully if another thread got
    /// there first.
    fn start_new_tree(&self) -> PlumeDBResult<()> {
        let _tree_guard = self.tree_latch.lock();
        if self.root_page_id.load(Ordering::SeqCst) != INVALID_PAGE_ID {
            return Ok(());
        }
        let page = self.buffer_pool.new_page()?;
        let leaf = BPlusTreeLeafPage::new_with_comparator(self.leaf_max_size, self.comparator);
        page.write()
            .set_data(page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(&leaf)));
        self.root_page_id.store(page.page_id(), Ordering::SeqCst);
        self.update_root_page_id()?;
        debug!(
            "index {}: started new tree at page {}",
            self.index_name,
            page.page_id()
        );
        Ok(())
    }

    fn insert_into_leaf(
        &self,
        key: &[u8],
        rid: RecordId,
        context: &mut Context,
    ) -> PlumeDBResult<bool> {
        let mut leaf = {
            let current = context.write_set.back().unwrap();
            BPlusTreeLeafPageCodec::decode(current.guard.data(), self.comparator)?.0
        };
        if leaf.look_up(key).is_some() {
            return Ok(false);
        }
        leaf.insert(key.to_vec(), rid);

        if leaf.header.current_size < self.leaf_max_size {
            let current = context.write_set.back_mut().unwrap();
            current
                .guard
                .set_data(page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(&leaf)));
            return Ok(true);
        }

        // the leaf reached max_size: split at the midpoint and link the
        // new right sibling into the chain
        let right_page = self.buffer_pool.new_page()?;
        let right_page_id = right_page.page_id();
        let mut right =
            BPlusTreeLeafPage::new_with_comparator(self.leaf_max_size, self.comparator);
        right.append_batch(leaf.split_off(self.leaf_max_size as usize / 2));
        right.header.next_page_id = leaf.header.next_page_id;
        leaf.header.next_page_id = right_page_id;
        let separator = right.key_at(0).clone();

        right_page
            .write()
            .set_data(page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(&right)));
        {
            let current = context.write_set.back_mut().unwrap();
            current
                .guard
                .set_data(page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(&leaf)));
        }
        debug!(
            "index {}: split leaf {} into {}",
            self.index_name,
            context.write_set.back().unwrap().page_id(),
            right_page_id
        );
        drop(right_page);
        context.write_set.pop_back();
        self.insert_into_parent(separator, right_page_id, context)?;
        Ok(true)
    }

    /// Walk the latched ancestor chain upward inserting the separator for a
    /// freshly split child, splitting internals as needed.
    fn insert_into_parent(
        &self,
        key: Vec<u8>,
        right_page_id: PageId,
        context: &mut Context,
    ) -> PlumeDBResult<()> {
        if context.write_set.is_empty() {
            // the split page was the root: grow the tree by one level
            let _tree_guard = self.tree_latch.lock();
            let old_root_id = self.root_page_id.load(Ordering::SeqCst);
            let root_page = self.buffer_pool.new_page()?;
            let mut root = BPlusTreeInternalPage::new_with_comparator(
                self.internal_max_size,
                self.comparator,
            );
            root.insert(Vec::new(), old_root_id);
            root.insert(key, right_page_id);
            root_page
                .write()
                .set_data(page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(
                    &root,
                )));
            self.root_page_id.store(root_page.page_id(), Ordering::SeqCst);
            self.update_root_page_id()?;
            debug!(
                "index {}: new root {} over {} and {}",
                self.index_name,
                root_page.page_id(),
                old_root_id,
                right_page_id
            );
            return Ok(());
        }

        let mut parent = {
            let current = context.write_set.back().unwrap();
            BPlusTreeInternalPageCodec::decode(current.guard.data(), self.comparator)?.0
        };
        parent.insert(key, right_page_id);

        if parent.header.current_size <= self.internal_max_size {
            let current = context.write_set.back_mut().unwrap();
            current
                .guard
                .set_data(page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(
                    &parent,
                )));
            return Ok(());
        }

        // over-full internal node: the array briefly holds max_size + 1
        // children, then splits; the right half's first key moves up
        let new_page = self.buffer_pool.new_page()?;
        let new_page_id = new_page.page_id();
        let mut right =
            BPlusTreeInternalPage::new_with_comparator(self.internal_max_size, self.comparator);
        let mut moved = parent.split_off((self.internal_max_size as usize + 1) / 2);
        let push_up_key = std::mem::take(&mut moved[0].0);
        right.append_batch(moved);

        new_page
            .write()
            .set_data(page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(
                &right,
            )));
        {
            let current = context.write_set.back_mut().unwrap();
            current
                .guard
                .set_data(page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(
                    &parent,
                )));
        }
        drop(new_page);
        context.write_set.pop_back();
        self.insert_into_parent(push_up_key, new_page_id, context)
    }

    // ---------------------------------------------------------------
    // deletion
    // ---------------------------------------------------------------

    fn delete_entry(&self, key: &[u8], context: &mut Context) -> PlumeDBResult<()> {
        {
            let current = context.write_set.back_mut().unwrap();
            let (mut leaf, _) =
                BPlusTreeLeafPageCodec::decode(current.guard.data(), self.comparator)?;
            if !leaf.delete(key) {
                return Ok(());
            }
            current
                .guard
                .set_data(page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(&leaf)));
        }

        loop {
            let (page_id, tree_page) = {
                let current = context.write_set.back().unwrap();
                let (tree_page, _) =
                    BPlusTreePageCodec::decode(current.guard.data(), self.comparator)?;
                (current.page_id(), tree_page)
            };

            if self.root_page_id.load(Ordering::SeqCst) == page_id {
                return self.adjust_root(&tree_page, context);
            }
            if tree_page.current_size() >= tree_page.min_size() {
                return Ok(());
            }

            // underflow: the parent is directly below on the stack
            let parent_index = context.write_set.len() - 2;
            let mut parent = {
                let entry = &context.write_set[parent_index];
                BPlusTreeInternalPageCodec::decode(entry.guard.data(), self.comparator)?.0
            };
            let pos = parent.child_index_of(page_id).ok_or_else(|| {
                PlumeDBError::Internal(format!("page {} not found in its parent", page_id))
            })?;
            // prefer the left sibling; the separator sits at the right
            // node's slot in the parent
            let (sibling_pos, sep_index, sibling_is_left) = if pos >= 1 {
                (pos - 1, pos, true)
            } else {
                (pos + 1, pos + 1, false)
            };
            let sibling_page_id = parent.value_at(sibling_pos);
            let sibling_ref = self.buffer_pool.fetch_page(sibling_page_id)?;
            let mut sibling_guard = sibling_ref.write();
            let sep_key = parent.key_at(sep_index).clone();

            let merged = match tree_page {
                BPlusTreePage::Leaf(node) => self.rebalance_leaf(
                    node,
                    page_id,
                    sibling_page_id,
                    &mut sibling_guard,
                    sibling_is_left,
                    &mut parent,
                    sep_index,
                    context,
                )?,
                BPlusTreePage::Internal(node) => self.rebalance_internal(
                    node,
                    page_id,
                    sibling_page_id,
                    &mut sibling_guard,
                    sibling_is_left,
                    &mut parent,
                    sep_index,
                    sep_key,
                    context,
                )?,
            };

            {
                let entry = context.write_set.get_mut(parent_index).unwrap();
                entry
                    .guard
                    .set_data(page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(
                        &parent,
                    )));
            }
            drop(sibling_guard);
            drop(sibling_ref);

            if !merged {
                return Ok(());
            }
            // a coalesce removed a separator from the parent; re-examine it
            context.write_set.pop_back();
        }
    }

    /// Returns true when the pair was coalesced (the parent lost an entry).
    #[allow(clippy::too_many_arguments)]
    fn rebalance_leaf(
        &self,
        node: BPlusTreeLeafPage,
        node_page_id: PageId,
        sibling_page_id: PageId,
        sibling_guard: &mut PageWriteGuard,
        sibling_is_left: bool,
        parent: &mut BPlusTreeInternalPage,
        sep_index: usize,
        context: &mut Context,
    ) -> PlumeDBResult<bool> {
        let (mut sibling, _) = BPlusTreeLeafPageCodec::decode(sibling_guard.data(), self.comparator)?;

        if sibling.header.current_size + node.header.current_size <= self.leaf_max_size - 1 {
            // everything fits in one leaf: merge into the left of the pair
            // and inherit the right one's sibling pointer
            let (mut left, right, right_page_id) = if sibling_is_left {
                (sibling, node, node_page_id)
            } else {
                (node, sibling, sibling_page_id)
            };
            left.header.next_page_id = right.header.next_page_id;
            left.append_batch(right.array);
            let encoded = page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(&left));
            if sibling_is_left {
                sibling_guard.set_data(encoded);
            } else {
                context.write_set.back_mut().unwrap().guard.set_data(encoded);
            }
            context.deleted_pages.push(right_page_id);
            parent.remove_at(sep_index);
            debug!(
                "index {}: coalesced leaf {} into {}",
                self.index_name,
                right_page_id,
                if sibling_is_left { sibling_page_id } else { node_page_id }
            );
            return Ok(true);
        }

        // rotate one entry through the parent separator
        let mut node = node;
        if sibling_is_left {
            let (key, rid) = sibling.pop_last();
            parent.set_key_at(sep_index, key.clone());
            node.insert_first(key, rid);
        } else {
            let (key, rid) = sibling.pop_first();
            node.push_last(key, rid);
            parent.set_key_at(sep_index, sibling.key_at(0).clone());
        }
        sibling_guard.set_data(page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(
            &sibling,
        )));
        context
            .write_set
            .back_mut()
            .unwrap()
            .guard
            .set_data(page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(&node)));
        Ok(false)
    }

    /// Returns true when the pair was coalesced (the parent lost an entry).
    #[allow(clippy::too_many_arguments)]
    fn rebalance_internal(
        &self,
        node: BPlusTreeInternalPage,
        node_page_id: PageId,
        sibling_page_id: PageId,
        sibling_guard: &mut PageWriteGuard,
        sibling_is_left: bool,
        parent: &mut BPlusTreeInternalPage,
        sep_index: usize,
        sep_key: Vec<u8>,
        context: &mut Context,
    ) -> PlumeDBResult<bool> {
        let (mut sibling, _) =
            BPlusTreeInternalPageCodec::decode(sibling_guard.data(), self.comparator)?;

        if sibling.header.current_size + node.header.current_size <= self.internal_max_size {
            // the separator comes down to sit between the merged halves
            let (mut left, right, right_page_id) = if sibling_is_left {
                (sibling, node, node_page_id)
            } else {
                (node, sibling, sibling_page_id)
            };
            let mut right_array = right.array;
            right_array[0].0 = sep_key;
            left.append_batch(right_array);
            let encoded = page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(&left));
            if sibling_is_left {
                sibling_guard.set_data(encoded);
            } else {
                context.write_set.back_mut().unwrap().guard.set_data(encoded);
            }
            context.deleted_pages.push(right_page_id);
            parent.remove_at(sep_index);
            return Ok(true);
        }

        // rotate one child through the parent separator
        let mut node = node;
        if sibling_is_left {
            let (last_key, last_child) = sibling.pop_last();
            node.insert_first(sep_key, last_child);
            parent.set_key_at(sep_index, last_key);
        } else {
            let first_child = sibling.value_at(0);
            let new_separator = sibling.key_at(1).clone();
            sibling.delete_first();
            node.push_last(sep_key, first_child);
            parent.set_key_at(sep_index, new_separator);
        }
        sibling_guard.set_data(page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(
            &sibling,
        )));
        context
            .write_set
            .back_mut()
            .unwrap()
            .guard
            .set_data(page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(
                &node,
            )));
        Ok(false)
    }

    /// Shrink at the top: an empty leaf root empties the tree, an internal
    /// root left with one child promotes it.
    fn adjust_root(&self, root: &BPlusTreePage, context: &mut Context) -> PlumeDBResult<()> {
        match root {
            BPlusTreePage::Leaf(leaf) if leaf.header.current_size == 0 => {
                let _tree_guard = self.tree_latch.lock();
                let old_root = self.root_page_id.swap(INVALID_PAGE_ID, Ordering::SeqCst);
                self.update_root_page_id()?;
                context.deleted_pages.push(old_root);
                debug!("index {}: tree is now empty", self.index_name);
            }
            BPlusTreePage::Internal(internal) if internal.header.current_size == 1 => {
                let _tree_guard = self.tree_latch.lock();
                let child = internal.value_at(0);
                let old_root = self.root_page_id.swap(child, Ordering::SeqCst);
                self.update_root_page_id()?;
                context.deleted_pages.push(old_root);
                debug!(
                    "index {}: promoted page {} to root",
                    self.index_name, child
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Rewrite this index's header record. Callers hold the tree latch.
    fn update_root_page_id(&self) -> PlumeDBResult<()> {
        let Some(header_page_id) = self.header_page_id else {
            return Ok(());
        };
        let header_ref = self.buffer_pool.fetch_page(header_page_id)?;
        let mut guard = header_ref.write();
        let (mut header, _) = BPlusTreeHeaderPageCodec::decode(guard.data())?;
        header.update_record(&self.index_name, self.root_page_id.load(Ordering::SeqCst));
        guard.set_data(page_bytes_to_array(&BPlusTreeHeaderPageCodec::encode(
            &header,
        )));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use crate::storage::index::comparator::{default_comparator, reverse_comparator};
    use crate::storage::index::TreeIndexIterator;
    use rand::seq::SliceRandom;
    use std::thread;
    use tempfile::TempDir;

    fn setup(pool_size: usize) -> (TempDir, Arc<BufferPoolManager>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, disk_scheduler));
        (temp_dir, buffer_pool)
    }

    fn key(i: u32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    fn rid(i: u32) -> RecordId {
        RecordId::new(i, i)
    }

    /// Number of levels from root to leaf, counting both ends.
    fn tree_levels(index: &BPlusTreeIndex) -> usize {
        let mut levels = 0;
        let mut page_id = index.root_page_id.load(Ordering::SeqCst);
        loop {
            levels += 1;
            let page = index.buffer_pool.fetch_page(page_id).unwrap();
            let guard = page.read();
            let (tree_page, _) = BPlusTreePageCodec::decode(guard.data(), index.comparator).unwrap();
            match tree_page {
                BPlusTreePage::Leaf(_) => return levels,
                BPlusTreePage::Internal(internal) => page_id = internal.value_at(0),
            }
        }
    }

    fn collect_keys(index: &Arc<BPlusTreeIndex>) -> Vec<u32> {
        let mut iterator = TreeIndexIterator::begin(index.clone()).unwrap();
        let mut keys = Vec::new();
        while let Some((key, _)) = iterator.next().unwrap() {
            keys.push(u32::from_be_bytes(key.try_into().unwrap()));
        }
        keys
    }

    /// Walk the whole tree checking balance (every leaf at the same
    /// depth), occupancy bounds for non-root nodes, and separator order.
    fn check_structure(index: &BPlusTreeIndex) {
        fn walk(
            index: &BPlusTreeIndex,
            page_id: PageId,
            depth: usize,
            is_root: bool,
            leaf_depth: &mut Option<usize>,
        ) {
            let page = index.buffer_pool.fetch_page(page_id).unwrap();
            let guard = page.read();
            let (tree_page, _) =
                BPlusTreePageCodec::decode(guard.data(), index.comparator).unwrap();
            match tree_page {
                BPlusTreePage::Leaf(leaf) => {
                    match *leaf_depth {
                        Some(expected) => assert_eq!(depth, expected, "leaves at unequal depth"),
                        None => *leaf_depth = Some(depth),
                    }
                    if !is_root {
                        assert!(leaf.header.current_size >= leaf.min_size());
                    }
                    assert!(leaf.header.current_size < index.leaf_max_size);
                    for window in leaf.array.windows(2) {
                        assert_eq!(
                            (index.comparator)(&window[0].0, &window[1].0),
                            std::cmp::Ordering::Less,
                            "leaf keys out of order"
                        );
                    }
                }
                BPlusTreePage::Internal(internal) => {
                    if !is_root {
                        assert!(internal.header.current_size >= internal.min_size());
                    }
                    assert!(internal.header.current_size <= index.internal_max_size);
                    for window in internal.array[1..].windows(2) {
                        assert_eq!(
                            (index.comparator)(&window[0].0, &window[1].0),
                            std::cmp::Ordering::Less,
                            "separators out of order"
                        );
                    }
                    let children: Vec<PageId> =
                        internal.array.iter().map(|kv| kv.1).collect();
                    drop(guard);
                    drop(page);
                    for child in children {
                        walk(index, child, depth + 1, false, leaf_depth);
                    }
                }
            }
        }
        let root = index.root_page_id.load(Ordering::SeqCst);
        if root != INVALID_PAGE_ID {
            walk(index, root, 0, true, &mut None);
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let (_temp_dir, buffer_pool) = setup(50);
        let index = BPlusTreeIndex::new("lookup", buffer_pool, default_comparator, 4, 4);
        for i in 1u32..=10 {
            assert!(index.insert(&key(i), rid(i)).unwrap());
        }
        for i in 1u32..=10 {
            assert_eq!(index.get_value(&key(i)).unwrap(), Some(rid(i)));
        }
        assert_eq!(index.get_value(&key(0)).unwrap(), None);
        assert_eq!(index.get_value(&key(11)).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (_temp_dir, buffer_pool) = setup(50);
        let index = BPlusTreeIndex::new("dup", buffer_pool, default_comparator, 4, 4);
        assert!(index.insert(&key(1), rid(1)).unwrap());
        assert!(!index.insert(&key(1), rid(2)).unwrap());
        // the original mapping is untouched
        assert_eq!(index.get_value(&key(1)).unwrap(), Some(rid(1)));
    }

    #[test]
    fn remove_absent_key_is_a_noop() {
        let (_temp_dir, buffer_pool) = setup(50);
        let index = BPlusTreeIndex::new("noop", buffer_pool, default_comparator, 4, 4);
        // empty tree
        index.remove(&key(1)).unwrap();
        assert!(index.is_empty());

        index.insert(&key(1), rid(1)).unwrap();
        index.remove(&key(2)).unwrap();
        assert_eq!(index.get_value(&key(1)).unwrap(), Some(rid(1)));
    }

    #[test]
    fn sequential_split_then_merge_shape() {
        let (_temp_dir, buffer_pool) = setup(50);
        let index = Arc::new(BPlusTreeIndex::new(
            "shape",
            buffer_pool,
            default_comparator,
            4,
            4,
        ));
        for i in 1u32..=10 {
            assert!(index.insert(&key(i), rid(i)).unwrap());
        }
        // ten sequential inserts split the root internal node once
        assert_eq!(tree_levels(&index), 3);
        assert_eq!(collect_keys(&index), (1..=10).collect::<Vec<_>>());
        check_structure(&index);

        for i in [10u32, 9, 8, 7] {
            index.remove(&key(i)).unwrap();
        }
        // the merges collapse the extra level
        assert_eq!(tree_levels(&index), 2);
        assert_eq!(collect_keys(&index), (1..=6).collect::<Vec<_>>());
        check_structure(&index);
        for i in 1u32..=6 {
            assert_eq!(index.get_value(&key(i)).unwrap(), Some(rid(i)));
        }
    }

    #[test]
    fn delete_everything_empties_the_tree() {
        let (_temp_dir, buffer_pool) = setup(50);
        let index = Arc::new(BPlusTreeIndex::new(
            "drain",
            buffer_pool,
            default_comparator,
            4,
            4,
        ));
        for i in 1u32..=10 {
            index.insert(&key(i), rid(i)).unwrap();
        }
        for i in 1u32..=10 {
            index.remove(&key(i)).unwrap();
        }
        assert!(index.is_empty());
        assert_eq!(index.get_value(&key(5)).unwrap(), None);
        let mut iterator = TreeIndexIterator::begin(index.clone()).unwrap();
        assert!(iterator.is_end());
        assert_eq!(iterator.next().unwrap(), None);

        // the tree grows again after being emptied
        index.insert(&key(42), rid(42)).unwrap();
        assert_eq!(index.get_value(&key(42)).unwrap(), Some(rid(42)));
    }

    #[test]
    fn iterator_begin_at_positions_on_lower_bound() {
        let (_temp_dir, buffer_pool) = setup(50);
        let index = Arc::new(BPlusTreeIndex::new(
            "seek",
            buffer_pool,
            default_comparator,
            4,
            4,
        ));
        for i in (1u32..=20).filter(|i| i % 2 == 0) {
            index.insert(&key(i), rid(i)).unwrap();
        }
        // exact hit
        let mut iterator = TreeIndexIterator::begin_at(index.clone(), &key(8)).unwrap();
        assert_eq!(
            iterator.next().unwrap().map(|(k, _)| k),
            Some(key(8))
        );
        // between keys: lands on the next larger one
        let mut iterator = TreeIndexIterator::begin_at(index.clone(), &key(9)).unwrap();
        let mut rest = Vec::new();
        while let Some((k, _)) = iterator.next().unwrap() {
            rest.push(u32::from_be_bytes(k.try_into().unwrap()));
        }
        assert_eq!(rest, vec![10, 12, 14, 16, 18, 20]);
    }

    #[test]
    fn header_page_tracks_root_changes() {
        let (_temp_dir, buffer_pool) = setup(50);
        let header_page_id = BPlusTreeIndex::create_header_page(&buffer_pool).unwrap();
        let index = BPlusTreeIndex::new(
            "tracked",
            buffer_pool.clone(),
            default_comparator,
            4,
            4,
        )
        .with_header(header_page_id)
        .unwrap();

        let read_recorded_root = |pool: &Arc<BufferPoolManager>| {
            let page = pool.fetch_page(header_page_id).unwrap();
            let guard = page.read();
            let (header, _) = BPlusTreeHeaderPageCodec::decode(guard.data()).unwrap();
            header.get_root_page_id("tracked").unwrap()
        };

        assert_eq!(read_recorded_root(&buffer_pool), INVALID_PAGE_ID);
        for i in 1u32..=10 {
            index.insert(&key(i), rid(i)).unwrap();
            assert_eq!(
                read_recorded_root(&buffer_pool),
                index.root_page_id.load(Ordering::SeqCst)
            );
        }
        for i in 1u32..=10 {
            index.remove(&key(i)).unwrap();
        }
        assert_eq!(read_recorded_root(&buffer_pool), INVALID_PAGE_ID);

        // a second index on the same header re-opens its recorded root
        let reopened = BPlusTreeIndex::new(
            "tracked",
            buffer_pool.clone(),
            default_comparator,
            4,
            4,
        )
        .with_header(header_page_id)
        .unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn injected_comparator_reverses_iteration_order() {
        let (_temp_dir, buffer_pool) = setup(50);
        let index = Arc::new(BPlusTreeIndex::new(
            "rev",
            buffer_pool,
            reverse_comparator,
            4,
            4,
        ));
        for i in 1u32..=9 {
            index.insert(&key(i), rid(i)).unwrap();
        }
        let mut iterator = TreeIndexIterator::begin(index.clone()).unwrap();
        let mut keys = Vec::new();
        while let Some((k, _)) = iterator.next().unwrap() {
            keys.push(u32::from_be_bytes(k.try_into().unwrap()));
        }
        assert_eq!(keys, (1..=9).rev().collect::<Vec<_>>());
    }

    #[test]
    fn randomized_workload_keeps_order_and_balance() {
        let (_temp_dir, buffer_pool) = setup(400);
        let index = Arc::new(BPlusTreeIndex::new(
            "rand",
            buffer_pool,
            default_comparator,
            5,
            5,
        ));
        let mut keys: Vec<u32> = (1..=300).collect();
        keys.shuffle(&mut rand::thread_rng());
        for &i in &keys {
            assert!(index.insert(&key(i), rid(i)).unwrap());
        }
        // leaf chain is strictly ascending regardless of insert order
        assert_eq!(collect_keys(&index), (1..=300).collect::<Vec<_>>());
        check_structure(&index);

        keys.shuffle(&mut rand::thread_rng());
        for &i in keys.iter().filter(|i| *i % 2 == 0) {
            index.remove(&key(i)).unwrap();
        }
        assert_eq!(
            collect_keys(&index),
            (1..=300).filter(|i| i % 2 == 1).collect::<Vec<_>>()
        );
        check_structure(&index);
        for i in 1u32..=300 {
            let expected = (i % 2 == 1).then(|| rid(i));
            assert_eq!(index.get_value(&key(i)).unwrap(), expected);
        }
    }

    #[test]
    fn concurrent_inserts_from_disjoint_ranges() {
        const THREADS: u32 = 4;
        const PER_THREAD: u32 = 60;
        let (_temp_dir, buffer_pool) = setup(400);
        let index = Arc::new(BPlusTreeIndex::new(
            "conc",
            buffer_pool,
            default_comparator,
            4,
            4,
        ));

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let k = t * PER_THREAD + i + 1;
                    assert!(index.insert(&key(k), rid(k)).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            collect_keys(&index),
            (1..=THREADS * PER_THREAD).collect::<Vec<_>>()
        );
        check_structure(&index);
        for k in 1..=THREADS * PER_THREAD {
            assert_eq!(index.get_value(&key(k)).unwrap(), Some(rid(k)));
        }
    }
}
