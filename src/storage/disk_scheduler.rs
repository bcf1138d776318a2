use crate::buffer::{PageId, PAGE_SIZE};
use crate::error::{PlumeDBError, PlumeDBResult};
use crate::storage::disk_manager::DiskManager;
use bytes::{Bytes, BytesMut};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

pub type DiskCommandResultSender<T> = Sender<PlumeDBResult<T>>;
pub type DiskCommandResultReceiver<T> = Receiver<PlumeDBResult<T>>;

/// Commands sent from the buffer pool to the background I/O worker.
#[derive(Debug)]
pub enum DiskRequest {
    ReadPage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<BytesMut>,
    },
    WritePage {
        page_id: PageId,
        data: Bytes,
        result_sender: DiskCommandResultSender<()>,
    },
    AllocatePage {
        result_sender: DiskCommandResultSender<PageId>,
    },
    DeallocatePage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<()>,
    },
    Shutdown,
}

/// Owns the background thread that performs all disk I/O. Callers get a
/// receiver per request and block on it only when they need the result.
#[derive(Debug)]
pub struct DiskScheduler {
    request_sender: Sender<DiskRequest>,
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (request_sender, request_receiver) = mpsc::channel::<DiskRequest>();
        let worker_thread = thread::Builder::new()
            .name("disk-scheduler-worker".to_string())
            .spawn(move || Self::worker_loop(request_receiver, disk_manager))
            .expect("failed to spawn disk scheduler worker");
        Self {
            request_sender,
            worker_thread: Some(worker_thread),
        }
    }

    fn worker_loop(receiver: Receiver<DiskRequest>, disk_manager: Arc<DiskManager>) {
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::ReadPage {
                    page_id,
                    result_sender,
                } => {
                    let result = disk_manager
                        .read_page(page_id)
                        .map(|data| BytesMut::from(&data[..]));
                    let _ = result_sender.send(result);
                }
                DiskRequest::WritePage {
                    page_id,
                    data,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.write_page(page_id, &data));
                }
                DiskRequest::AllocatePage { result_sender } => {
                    let _ = result_sender.send(disk_manager.allocate_page());
                }
                DiskRequest::DeallocatePage {
                    page_id,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.deallocate_page(page_id));
                }
                DiskRequest::Shutdown => break,
            }
        }
    }

    fn send(&self, request: DiskRequest) -> PlumeDBResult<()> {
        self.request_sender
            .send(request)
            .map_err(|e| PlumeDBError::Internal(format!("disk scheduler is down: {}", e)))
    }

    pub fn schedule_read(
        &self,
        page_id: PageId,
    ) -> PlumeDBResult<DiskCommandResultReceiver<BytesMut>> {
        let (result_sender, receiver) = mpsc::channel();
        self.send(DiskRequest::ReadPage {
            page_id,
            result_sender,
        })?;
        Ok(receiver)
    }

    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Bytes,
    ) -> PlumeDBResult<DiskCommandResultReceiver<()>> {
        let (result_sender, receiver) = mpsc::channel();
        self.send(DiskRequest::WritePage {
            page_id,
            data,
            result_sender,
        })?;
        Ok(receiver)
    }

    pub fn schedule_allocate(&self) -> PlumeDBResult<DiskCommandResultReceiver<PageId>> {
        let (result_sender, receiver) = mpsc::channel();
        self.send(DiskRequest::AllocatePage { result_sender })?;
        Ok(receiver)
    }

    pub fn schedule_deallocate(
        &self,
        page_id: PageId,
    ) -> PlumeDBResult<DiskCommandResultReceiver<()>> {
        let (result_sender, receiver) = mpsc::channel();
        self.send(DiskRequest::DeallocatePage {
            page_id,
            result_sender,
        })?;
        Ok(receiver)
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let _ = self.request_sender.send(DiskRequest::Shutdown);
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }
}
