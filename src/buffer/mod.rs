mod buffer_pool;
mod page;
mod page_table;

pub use buffer_pool::{BufferPoolManager, FrameId};
pub use page::{
    AtomicPageId, Page, PageId, PageLock, PageReadGuard, PageRef, PageWriteGuard,
    INVALID_PAGE_ID, PAGE_SIZE,
};
pub use page_table::ExtendibleHashTable;
