use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};
use log::error;

use super::disk_manager::DiskManager;
use crate::buffer::PageId;
use crate::error::{PlumeError, PlumeResult};

pub type DiskCommandResultSender<T> = Sender<PlumeResult<T>>;
pub type DiskCommandResultReceiver<T> = Receiver<PlumeResult<T>>;

/// Commands sent from the buffer pool to the I/O workers. Every request
/// carries its own result channel.
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

/// Fans I/O requests out to a small pool of worker threads through a
/// dispatcher, so callers never touch the database file directly.
#[derive(Debug)]
pub struct DiskScheduler {
    request_sender: Sender<DiskRequest>,
    dispatcher_thread: Option<thread::JoinHandle<()>>,
    worker_threads: Vec<thread::JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        Self::new_with_workers(disk_manager, 2)
    }

    pub fn new_with_workers(disk_manager: Arc<DiskManager>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (request_sender, request_receiver) = mpsc::channel::<DiskRequest>();

        let mut worker_senders = Vec::with_capacity(worker_count);
        let mut worker_threads = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let (tx, rx) = mpsc::channel::<DiskRequest>();
            worker_senders.push(tx);
            let dm = disk_manager.clone();
            let handle = thread::Builder::new()
                .name(format!("disk-scheduler-worker-{}", i))
                .spawn(move || {
                    Self::io_worker_loop(rx, dm);
                })
                .expect("Failed to spawn DiskScheduler worker thread");
            worker_threads.push(handle);
        }

        let dispatcher_thread = thread::Builder::new()
            .name("disk-scheduler-dispatcher".to_string())
            .spawn(move || {
                Self::dispatcher_loop(request_receiver, worker_senders);
            })
            .expect("Failed to spawn DiskScheduler dispatcher thread");

        DiskScheduler {
            request_sender,
            dispatcher_thread: Some(dispatcher_thread),
            worker_threads,
        }
    }

    pub fn schedule_read(&self, page_id: PageId) -> PlumeResult<DiskCommandResultReceiver<BytesMut>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::ReadPage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Bytes,
    ) -> PlumeResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::WritePage {
            page_id,
            data,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_allocate(&self) -> PlumeResult<DiskCommandResultReceiver<PageId>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::AllocatePage { result_sender: tx })?;
        Ok(rx)
    }

    pub fn schedule_deallocate(&self, page_id: PageId) -> PlumeResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::DeallocatePage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    fn send(&self, request: DiskRequest) -> PlumeResult<()> {
        self.request_sender
            .send(request)
            .map_err(|e| PlumeError::Internal(format!("disk scheduler is down: {}", e)))
    }

    fn dispatcher_loop(receiver: Receiver<DiskRequest>, worker_senders: Vec<Sender<DiskRequest>>) {
        let mut next_worker = 0;
        while let Ok(request) = receiver.recv() {
            if matches!(request, DiskRequest::Shutdown) {
                for sender in &worker_senders {
                    let _ = sender.send(DiskRequest::Shutdown);
                }
                break;
            }
            if worker_senders[next_worker].send(request).is_err() {
                error!("disk scheduler worker {} is gone", next_worker);
                break;
            }
            next_worker = (next_worker + 1) % worker_senders.len();
        }
    }

    fn io_worker_loop(receiver: Receiver<DiskRequest>, disk_manager: Arc<DiskManager>) {
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::ReadPage {
                    page_id,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.read_page(page_id));
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
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let _ = self.request_sender.send(DiskRequest::Shutdown);
        if let Some(handle) = self.dispatcher_thread.take() {
            let _ = handle.join();
        }
        for handle in self.worker_threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PAGE_SIZE;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_disk_scheduler_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let scheduler = DiskScheduler::new(disk_manager);

        let page_id = scheduler
            .schedule_allocate()
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();

        let mut data = vec![0u8; PAGE_SIZE];
        data[17] = 0x5A;
        scheduler
            .schedule_write(page_id, Bytes::from(data))
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();

        let read = scheduler
            .schedule_read(page_id)
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(read[17], 0x5A);
    }

    #[test]
    fn test_disk_scheduler_concurrent_requests() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let scheduler = Arc::new(DiskScheduler::new(disk_manager));

        let mut handles = vec![];
        for i in 0..8u8 {
            let scheduler = scheduler.clone();
            handles.push(std::thread::spawn(move || {
                let page_id = scheduler
                    .schedule_allocate()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5))
                    .unwrap()
                    .unwrap();
                let data = vec![i; PAGE_SIZE];
                scheduler
                    .schedule_write(page_id, Bytes::from(data))
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5))
                    .unwrap()
                    .unwrap();
                let read = scheduler
                    .schedule_read(page_id)
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5))
                    .unwrap()
                    .unwrap();
                assert!(read.iter().all(|byte| *byte == i));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
