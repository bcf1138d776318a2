use crate::buffer::buffer_pool::FrameId;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

/// In-memory image of one disk page. The surrounding `RwLock` is the page
/// latch; pin accounting lives outside it so unpinning never blocks on the
/// latch.
#[derive(Debug)]
pub struct Page {
    pub page_id: PageId,
    data: [u8; PAGE_SIZE],
    pub is_dirty: bool,
}

impl Page {
    pub fn empty() -> Self {
        Self::new(INVALID_PAGE_ID)
    }

    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: [0; PAGE_SIZE],
            is_dirty: false,
        }
    }

    /// A page freshly loaded from disk is clean.
    pub fn from_data(page_id: PageId, data: [u8; PAGE_SIZE]) -> Self {
        Self {
            page_id,
            data,
            is_dirty: false,
        }
    }

    pub fn destroy(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.data = [0; PAGE_SIZE];
        self.is_dirty = false;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: [u8; PAGE_SIZE]) {
        self.data = data;
        self.is_dirty = true;
    }

    pub fn replace(&mut self, other: Page) {
        self.page_id = other.page_id;
        self.data = other.data;
        self.is_dirty = other.is_dirty;
    }
}

pub type PageLock = Arc<RwLock<Page>>;

/// Owned latch guards: they keep no borrow of the pool, so a descent can
/// hold a whole chain of them in its page set.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Pin handle for a resident page. Dropping the last `PageRef` of a frame
/// hands the frame back to the replacer.
#[derive(Debug)]
pub struct PageRef {
    page: PageLock,
    page_id: PageId,
    frame_id: FrameId,
    pin_count: Arc<AtomicU32>,
    replacer: Arc<Mutex<LRUKReplacer>>,
}

impl PageRef {
    pub(crate) fn new(
        page: PageLock,
        page_id: PageId,
        frame_id: FrameId,
        pin_count: Arc<AtomicU32>,
        replacer: Arc<Mutex<LRUKReplacer>>,
    ) -> Self {
        Self {
            page,
            page_id,
            frame_id,
            pin_count,
            replacer,
        }
    }

    /// The pinned page's id. Stable for the lifetime of the pin: a pinned
    /// frame is never recycled.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    /// Take the page's read latch.
    pub fn read(&self) -> PageReadGuard {
        self.page.read_arc()
    }

    /// Take the page's write latch.
    pub fn write(&self) -> PageWriteGuard {
        self.page.write_arc()
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        if self.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.replacer.lock().set_evictable(self.frame_id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_unpin_marks_frame_evictable() {
        let replacer = Arc::new(Mutex::new(LRUKReplacer::new(4, 2)));
        replacer.lock().record_access(0);
        let page = Arc::new(RwLock::new(Page::new(1)));
        let pin_count = Arc::new(AtomicU32::new(2));

        let first = PageRef::new(page.clone(), 1, 0, pin_count.clone(), replacer.clone());
        let second = PageRef::new(page, 1, 0, pin_count.clone(), replacer.clone());

        drop(first);
        assert_eq!(pin_count.load(Ordering::SeqCst), 1);
        assert_eq!(replacer.lock().size(), 0);

        drop(second);
        assert_eq!(pin_count.load(Ordering::SeqCst), 0);
        assert_eq!(replacer.lock().size(), 1);
    }

    #[test]
    fn guards_latch_the_page() {
        let replacer = Arc::new(Mutex::new(LRUKReplacer::new(4, 2)));
        let page = Arc::new(RwLock::new(Page::new(7)));
        let pin_count = Arc::new(AtomicU32::new(1));
        let page_ref = PageRef::new(page.clone(), 7, 0, pin_count, replacer);

        {
            let mut guard = page_ref.write();
            guard.set_data([42u8; PAGE_SIZE]);
            assert!(guard.is_dirty);
        }
        let guard = page_ref.read();
        assert_eq!(guard.data()[0], 42);
        assert_eq!(guard.page_id, 7);
    }
}
