use bytes::Bytes;
use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::page::{Page, PageId, PageLock, PageRef, INVALID_PAGE_ID, PAGE_SIZE};
use crate::buffer::page_table::ExtendibleHashTable;
use crate::config::BufferPoolConfig;
use crate::error::{PlumeDBError, PlumeDBResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

pub type FrameId = usize;

const PAGE_TABLE_BUCKET_SIZE: usize = 32;

#[derive(Debug)]
struct Frame {
    page: PageLock,
    pin_count: Arc<AtomicU32>,
}

/// Fixed set of frames caching disk pages. Resident pages are located
/// through an extendible hash table and victims are picked by an LRU-K
/// replacer; both live behind their own latch. Unpinning is RAII: dropping
/// the last `PageRef` of a frame makes it evictable.
#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Vec<Frame>,
    pub replacer: Arc<Mutex<LRUKReplacer>>,
    pub disk_scheduler: Arc<DiskScheduler>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    // dedups concurrent cold misses on the same page
    inflight_loads: DashMap<PageId, Arc<Mutex<()>>>,
}

impl BufferPoolManager {
    pub fn new(num_pages: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_scheduler,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let num_pages = config.buffer_pool_size;
        let mut free_list = VecDeque::with_capacity(num_pages);
        let mut pool = Vec::with_capacity(num_pages);
        for frame_id in 0..num_pages {
            free_list.push_back(frame_id);
            pool.push(Frame {
                page: Arc::new(RwLock::new(Page::empty())),
                pin_count: Arc::new(AtomicU32::new(0)),
            });
        }
        Self {
            pool,
            replacer: Arc::new(Mutex::new(LRUKReplacer::new(num_pages, config.lru_k_k))),
            disk_scheduler,
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            free_list: Mutex::new(free_list),
            inflight_loads: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    /// Allocate a fresh zeroed page, pinned once.
    pub fn new_page(&self) -> PlumeDBResult<PageRef> {
        if self.free_list.lock().is_empty() && self.replacer.lock().size() == 0 {
            return Err(PlumeDBError::Storage(
                "Cannot new page because buffer pool is full and no page to evict".to_string(),
            ));
        }

        let frame_id = self.allocate_frame()?;
        let page_id = self
            .disk_scheduler
            .schedule_allocate()?
            .recv()
            .map_err(|e| PlumeDBError::Internal(format!("Channel disconnected: {}", e)))??;

        self.page_table.insert(page_id, frame_id);
        self.pool[frame_id].page.write().replace(Page::new(page_id));
        self.pool[frame_id].pin_count.store(1, Ordering::SeqCst);
        {
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
        }
        Ok(self.page_ref(page_id, frame_id))
    }

    /// Pin the page, loading it from disk on a miss.
    pub fn fetch_page(&self, page_id: PageId) -> PlumeDBResult<PageRef> {
        if page_id == INVALID_PAGE_ID {
            return Err(PlumeDBError::Storage(
                "fetch_page: invalid page id".to_string(),
            ));
        }
        if let Some(page_ref) = self.fetch_resident(page_id) {
            return Ok(page_ref);
        }

        // cold miss: only one thread performs the load
        let (load_guard, created_here) = match self.inflight_loads.get(&page_id) {
            Some(existing) => (existing.value().clone(), false),
            None => {
                let guard = Arc::new(Mutex::new(()));
                self.inflight_loads.insert(page_id, guard.clone());
                (guard, true)
            }
        };
        let lock = load_guard.lock();
        let result = self.load_page(page_id);
        drop(lock);
        if created_here {
            self.inflight_loads.remove(&page_id);
        }
        result
    }

    fn fetch_resident(&self, page_id: PageId) -> Option<PageRef> {
        let frame_id = self.page_table.find(&page_id)?;
        self.pool[frame_id].pin_count.fetch_add(1, Ordering::SeqCst);
        let mut replacer = self.replacer.lock();
        replacer.record_access(frame_id);
        replacer.set_evictable(frame_id, false);
        Some(self.page_ref(page_id, frame_id))
    }

    fn load_page(&self, page_id: PageId) -> PlumeDBResult<PageRef> {
        // another thread may have finished the same load while we waited
        if let Some(page_ref) = self.fetch_resident(page_id) {
            return Ok(page_ref);
        }

        let frame_id = self.allocate_frame()?;
        let data = self
            .disk_scheduler
            .schedule_read(page_id)?
            .recv()
            .map_err(|e| PlumeDBError::Internal(format!("Channel disconnected: {}", e)))??;

        let mut page_data = [0u8; PAGE_SIZE];
        let copy_len = data.len().min(PAGE_SIZE);
        page_data[..copy_len].copy_from_slice(&data[..copy_len]);

        self.page_table.insert(page_id, frame_id);
        self.pool[frame_id]
            .page
            .write()
            .replace(Page::from_data(page_id, page_data));
        self.pool[frame_id].pin_count.store(1, Ordering::SeqCst);
        {
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
        }
        Ok(self.page_ref(page_id, frame_id))
    }

    fn page_ref(&self, page_id: PageId, frame_id: FrameId) -> PageRef {
        PageRef::new(
            self.pool[frame_id].page.clone(),
            page_id,
            frame_id,
            self.pool[frame_id].pin_count.clone(),
            self.replacer.clone(),
        )
    }

    /// Write a resident page back to disk and clear its dirty bit.
    pub fn flush_page(&self, page_id: PageId) -> PlumeDBResult<bool> {
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(false);
        };
        let data = {
            let page = self.pool[frame_id].page.read();
            Bytes::copy_from_slice(page.data())
        };
        self.disk_scheduler
            .schedule_write(page_id, data)?
            .recv()
            .map_err(|e| PlumeDBError::Internal(format!("Channel disconnected: {}", e)))??;
        self.pool[frame_id].page.write().is_dirty = false;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> PlumeDBResult<()> {
        for (page_id, frame_id) in self.page_table.entries() {
            if self.pool[frame_id].page.read().is_dirty {
                self.flush_page(page_id)?;
            }
        }
        Ok(())
    }

    /// Drop a page from the pool and hand its id back to the disk manager.
    /// Refuses pinned pages.
    pub fn delete_page(&self, page_id: PageId) -> PlumeDBResult<bool> {
        if let Some(frame_id) = self.page_table.find(&page_id) {
            if self.pool[frame_id].pin_count.load(Ordering::SeqCst) > 0 {
                return Ok(false);
            }
            self.pool[frame_id].page.write().destroy();
            self.page_table.remove(&page_id);
            self.replacer.lock().remove(frame_id);
            self.free_list.lock().push_back(frame_id);
        }
        self.disk_scheduler
            .schedule_deallocate(page_id)?
            .recv()
            .map_err(|e| PlumeDBError::Internal(format!("Channel disconnected: {}", e)))??;
        Ok(true)
    }

    fn allocate_frame(&self) -> PlumeDBResult<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }
        loop {
            let Some(frame_id) = self.replacer.lock().evict() else {
                return Err(PlumeDBError::Storage(
                    "Cannot allocate frame: buffer pool is full".to_string(),
                ));
            };
            // an evictable frame has no pins, but re-check before recycling
            if self.pool[frame_id].pin_count.load(Ordering::SeqCst) > 0 {
                debug!("frame {} was re-pinned before recycling, retrying", frame_id);
                let mut replacer = self.replacer.lock();
                replacer.record_access(frame_id);
                replacer.set_evictable(frame_id, false);
                continue;
            }
            let (page_id, dirty_payload) = {
                let page = self.pool[frame_id].page.read();
                let payload = page
                    .is_dirty
                    .then(|| Bytes::copy_from_slice(page.data()));
                (page.page_id, payload)
            };
            if page_id != INVALID_PAGE_ID {
                if let Some(data) = dirty_payload {
                    self.disk_scheduler
                        .schedule_write(page_id, data)?
                        .recv()
                        .map_err(|e| {
                            PlumeDBError::Internal(format!("Channel disconnected: {}", e))
                        })??;
                }
                self.page_table.remove(&page_id);
            }
            return Ok(frame_id);
        }
    }
}
