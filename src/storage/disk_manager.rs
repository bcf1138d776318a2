use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{PlumeDBError, PlumeDBResult};
use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

/// File-backed page store. Page `i` lives at byte offset `i * PAGE_SIZE`;
/// page id 0 is reserved as the invalid id, so the first real page is 1.
/// Freed ids are recycled from memory only; there is no persistent free
/// list and no write-ahead logging here.
#[derive(Debug)]
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicU32,
    freed_page_ids: Mutex<Vec<PageId>>,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> PlumeDBResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;
        let len = db_file.metadata()?.len() as usize;
        let next_page_id = (len.div_ceil(PAGE_SIZE)).max(1) as PageId;
        debug!(
            "opened db file {:?}, next page id {}",
            db_path.as_ref(),
            next_page_id
        );
        Ok(Self {
            db_file: Mutex::new(db_file),
            next_page_id: AtomicU32::new(next_page_id),
            freed_page_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn allocate_page(&self) -> PlumeDBResult<PageId> {
        if let Some(page_id) = self.freed_page_ids.lock().pop() {
            return Ok(page_id);
        }
        Ok(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn deallocate_page(&self, page_id: PageId) -> PlumeDBResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(PlumeDBError::Internal(
                "cannot deallocate the invalid page id".to_string(),
            ));
        }
        let mut freed = self.freed_page_ids.lock();
        if !freed.contains(&page_id) {
            freed.push(page_id);
        }
        Ok(())
    }

    /// Reads past the end of the file come back zeroed, which is what a
    /// freshly allocated and never flushed page looks like.
    pub fn read_page(&self, page_id: PageId) -> PlumeDBResult<[u8; PAGE_SIZE]> {
        let mut buf = [0u8; PAGE_SIZE];
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> PlumeDBResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(PlumeDBError::Internal(format!(
                "page write of {} bytes, expected {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }
}
