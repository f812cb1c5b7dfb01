use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::buffer::page::{Page, PinGuard, ReadPageGuard, WritePageGuard};
use crate::buffer::{FrameId, PageId, INVALID_PAGE_ID};
use crate::config::BufferPoolConfig;
use crate::error::{PlumeError, PlumeResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed-size cache of disk pages. Callers borrow pages through pinned,
/// latched guards; unpinned frames are reclaimed by the LRU-K replacer.
///
/// Invariant: every pin count transition happens while holding the
/// replacer lock, and the page table entry of an eviction victim is
/// removed under that same lock. A frame the replacer hands out therefore
/// has pin count zero and no live references.
#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Vec<Arc<RwLock<Page>>>,
    pin_counts: Vec<Arc<AtomicU32>>,
    replacer: Arc<Mutex<LRUKReplacer>>,
    disk_scheduler: Arc<DiskScheduler>,
    page_table: Arc<DashMap<PageId, FrameId>>,
    free_list: Mutex<VecDeque<FrameId>>,
    // Serializes concurrent loads of the same page into one frame.
    inflight_loads: DashMap<PageId, Arc<Mutex<()>>>,
    pool_size: usize,
}

impl BufferPoolManager {
    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new(config.buffer_pool_size, config.lru_k_k, disk_scheduler)
    }

    pub fn new(pool_size: usize, k: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let mut free_list = VecDeque::with_capacity(pool_size);
        let mut pool = Vec::with_capacity(pool_size);
        let mut pin_counts = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            free_list.push_back(i);
            pool.push(Arc::new(RwLock::new(Page::empty())));
            pin_counts.push(Arc::new(AtomicU32::new(0)));
        }

        Self {
            pool,
            pin_counts,
            replacer: Arc::new(Mutex::new(LRUKReplacer::with_k(pool_size, k))),
            disk_scheduler,
            page_table: Arc::new(DashMap::new()),
            free_list: Mutex::new(free_list),
            inflight_loads: DashMap::new(),
            pool_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocates a fresh zeroed page and returns it pinned and
    /// write-latched.
    pub fn new_page(&self) -> PlumeResult<WritePageGuard> {
        let frame_id = self.allocate_frame()?;

        let new_page_id = match self.recv_io(self.disk_scheduler.schedule_allocate()?) {
            Ok(page_id) => page_id,
            Err(e) => {
                self.free_list.lock().push_back(frame_id);
                return Err(e);
            }
        };

        let page_arc = self.pool[frame_id].clone();
        {
            let mut page_guard = page_arc.write();
            page_guard.destroy();
            page_guard.page_id = new_page_id;
            page_guard.is_dirty = true;
        }
        let pin = self.publish_frame(frame_id, new_page_id)?;

        debug!("created page {} in frame {}", new_page_id, frame_id);
        Ok(WritePageGuard::new(pin))
    }

    pub fn fetch_page_read(&self, page_id: PageId) -> PlumeResult<ReadPageGuard> {
        Ok(ReadPageGuard::new(self.fetch_page(page_id)?))
    }

    /// Non-blocking latch variant for the iterator's leaf hops. `None`
    /// means the page is currently write-latched by someone else.
    pub fn try_fetch_page_read(&self, page_id: PageId) -> PlumeResult<Option<ReadPageGuard>> {
        let pin = self.fetch_page(page_id)?;
        Ok(ReadPageGuard::try_new(pin))
    }

    pub fn fetch_page_write(&self, page_id: PageId) -> PlumeResult<WritePageGuard> {
        Ok(WritePageGuard::new(self.fetch_page(page_id)?))
    }

    /// Pins the page, loading it from disk on a miss.
    pub(crate) fn fetch_page(&self, page_id: PageId) -> PlumeResult<PinGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(PlumeError::Storage("fetch of invalid page id".to_string()));
        }

        loop {
            {
                // Holding the replacer lock keeps the table entry stable:
                // eviction removes entries under the same lock.
                let mut replacer = self.replacer.lock();
                if let Some(frame_id) = self.page_table.get(&page_id).map(|entry| *entry) {
                    self.pin_counts[frame_id].fetch_add(1, Ordering::SeqCst);
                    replacer.record_access(frame_id)?;
                    replacer.set_evictable(frame_id, false)?;
                    return Ok(self.pin_guard(frame_id, page_id));
                }
            }

            // Miss: make sure only one thread loads this page.
            let load_lock = self
                .inflight_loads
                .entry(page_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let _loading = load_lock.lock();
            if self.page_table.contains_key(&page_id) {
                continue;
            }

            let frame_id = self.allocate_frame()?;
            let data = match self.recv_io(self.disk_scheduler.schedule_read(page_id)?) {
                Ok(data) => data,
                Err(e) => {
                    self.free_list.lock().push_back(frame_id);
                    self.inflight_loads.remove(&page_id);
                    return Err(e);
                }
            };

            let page_arc = self.pool[frame_id].clone();
            {
                let mut page_guard = page_arc.write();
                page_guard.destroy();
                page_guard.page_id = page_id;
                page_guard.load_data(&data);
            }
            let pin = self.publish_frame(frame_id, page_id)?;
            self.inflight_loads.remove(&page_id);

            debug!("fetched page {} into frame {}", page_id, frame_id);
            return Ok(pin);
        }
    }

    /// Drops the page from the pool and the disk. Returns false while the
    /// page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> PlumeResult<bool> {
        let frame_id = {
            let mut replacer = self.replacer.lock();
            let Some(frame_id) = self.page_table.get(&page_id).map(|entry| *entry) else {
                // Not resident; still release the disk side.
                drop(replacer);
                self.recv_io(self.disk_scheduler.schedule_deallocate(page_id)?)?;
                return Ok(true);
            };
            if self.pin_counts[frame_id].load(Ordering::SeqCst) > 0 {
                debug!("cannot delete pinned page {}", page_id);
                return Ok(false);
            }
            self.page_table.remove(&page_id);
            replacer.remove(frame_id);
            frame_id
        };

        self.pool[frame_id].write().destroy();
        self.free_list.lock().push_back(frame_id);

        self.recv_io(self.disk_scheduler.schedule_deallocate(page_id)?)?;
        debug!("deleted page {} (frame {})", page_id, frame_id);
        Ok(true)
    }

    pub fn flush_page(&self, page_id: PageId) -> PlumeResult<bool> {
        let Some(frame_id) = self.page_table.get(&page_id).map(|entry| *entry) else {
            return Ok(false);
        };
        let page_arc = self.pool[frame_id].clone();
        let data = {
            let mut page_guard = page_arc.write();
            if page_guard.page_id != page_id || !page_guard.is_dirty {
                return Ok(true);
            }
            page_guard.is_dirty = false;
            page_guard.data_as_bytes()
        };
        self.recv_io(self.disk_scheduler.schedule_write(page_id, data)?)?;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> PlumeResult<()> {
        let page_ids: Vec<PageId> = self.page_table.iter().map(|entry| *entry.key()).collect();
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Debug helper: true when no resident page is pinned.
    pub fn check_all_unpinned(&self) -> bool {
        for entry in self.page_table.iter() {
            let pin_count = self.pin_counts[*entry.value()].load(Ordering::SeqCst);
            if pin_count > 0 {
                log::error!("page {} still pinned (pin_count={})", entry.key(), pin_count);
                return false;
            }
        }
        true
    }

    /// Registers a privately initialized frame: pin it, enter it into the
    /// replacer (non-evictable) and the page table.
    fn publish_frame(&self, frame_id: FrameId, page_id: PageId) -> PlumeResult<PinGuard> {
        let mut replacer = self.replacer.lock();
        self.pin_counts[frame_id].store(1, Ordering::SeqCst);
        replacer.record_access(frame_id)?;
        replacer.set_evictable(frame_id, false)?;
        self.page_table.insert(page_id, frame_id);
        Ok(self.pin_guard(frame_id, page_id))
    }

    fn pin_guard(&self, frame_id: FrameId, page_id: PageId) -> PinGuard {
        PinGuard {
            page: self.pool[frame_id].clone(),
            pin_count: self.pin_counts[frame_id].clone(),
            frame_id,
            page_id,
            replacer: self.replacer.clone(),
        }
    }

    fn recv_io<T>(&self, receiver: std::sync::mpsc::Receiver<PlumeResult<T>>) -> PlumeResult<T> {
        match receiver.recv_timeout(IO_TIMEOUT) {
            Ok(result) => result,
            Err(e) => Err(PlumeError::Internal(format!("disk I/O timed out: {}", e))),
        }
    }

    /// Grabs a free frame, evicting (and flushing) a victim if necessary.
    fn allocate_frame(&self) -> PlumeResult<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let (frame_id, victim_page_id, victim_dirty, page_arc) = {
            let mut replacer = self.replacer.lock();
            let Some(frame_id) = replacer.evict() else {
                return Err(PlumeError::OutOfMemory(
                    "buffer pool is full and no page is evictable".to_string(),
                ));
            };
            debug_assert_eq!(self.pin_counts[frame_id].load(Ordering::SeqCst), 0);
            let page_arc = self.pool[frame_id].clone();
            // Unpinned frames are never latched, so this cannot block.
            let (victim_page_id, victim_dirty) = {
                let page_guard = page_arc.read();
                (page_guard.page_id, page_guard.is_dirty)
            };
            if victim_page_id != INVALID_PAGE_ID {
                self.page_table.remove(&victim_page_id);
            }
            (frame_id, victim_page_id, victim_dirty, page_arc)
        };

        if victim_dirty {
            let data = {
                let mut page_guard = page_arc.write();
                page_guard.is_dirty = false;
                page_guard.data_as_bytes()
            };
            debug!("flushing dirty victim page {}", victim_page_id);
            self.recv_io(self.disk_scheduler.schedule_write(victim_page_id, data)?)?;
        }

        Ok(frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PAGE_SIZE;
    use crate::storage::disk_manager::DiskManager;
    use tempfile::TempDir;

    fn build_pool(pool_size: usize) -> (TempDir, BufferPoolManager) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        (temp_dir, BufferPoolManager::new(pool_size, 2, disk_scheduler))
    }

    #[test]
    fn test_buffer_pool_new_page_and_exhaustion() {
        let (_temp_dir, buffer_pool) = build_pool(3);

        let page1 = buffer_pool.new_page().unwrap();
        let page2 = buffer_pool.new_page().unwrap();
        let page3 = buffer_pool.new_page().unwrap();

        // All frames pinned: no fourth page.
        let exhausted = buffer_pool.new_page();
        assert!(matches!(exhausted, Err(PlumeError::OutOfMemory(_))));

        let page1_id = page1.page_id();
        drop(page1);
        let page4 = buffer_pool.new_page().unwrap();
        assert_ne!(page4.page_id(), page1_id);
        drop(page2);
        drop(page3);
        drop(page4);
        assert!(buffer_pool.check_all_unpinned());
    }

    #[test]
    fn test_buffer_pool_fetch_round_trip_through_eviction() {
        let (_temp_dir, buffer_pool) = build_pool(2);

        let mut page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.page_id();
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xEE;
        page1.set_data_from_slice(&data);
        drop(page1);

        // Force page1 out of the pool.
        let page2 = buffer_pool.new_page().unwrap();
        let page3 = buffer_pool.new_page().unwrap();
        drop(page2);
        drop(page3);

        let guard = buffer_pool.fetch_page_read(page1_id).unwrap();
        assert_eq!(guard.data()[0], 0xEE);
    }

    #[test]
    fn test_buffer_pool_delete_page() {
        let (_temp_dir, buffer_pool) = build_pool(3);

        let page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.page_id();

        // Pinned: refuses.
        assert!(!buffer_pool.delete_page(page1_id).unwrap());
        drop(page1);

        assert!(buffer_pool.delete_page(page1_id).unwrap());
        // The frame is free again: three more pages fit.
        let _page2 = buffer_pool.new_page().unwrap();
        let _page3 = buffer_pool.new_page().unwrap();
        let _page4 = buffer_pool.new_page().unwrap();
    }

    #[test]
    fn test_buffer_pool_try_fetch_read_respects_write_latch() {
        let (_temp_dir, buffer_pool) = build_pool(3);

        let page = buffer_pool.new_page().unwrap();
        let page_id = page.page_id();

        // Exclusive latch held: try-read must not block, just fail.
        assert!(buffer_pool.try_fetch_page_read(page_id).unwrap().is_none());
        drop(page);
        assert!(buffer_pool.try_fetch_page_read(page_id).unwrap().is_some());
    }

    #[test]
    fn test_buffer_pool_concurrent_fetch_single_page() {
        let (_temp_dir, buffer_pool) = build_pool(10);
        let buffer_pool = Arc::new(buffer_pool);

        let mut page = buffer_pool.new_page().unwrap();
        let page_id = page.page_id();
        page.set_data_from_slice(&[0x42; PAGE_SIZE]);
        drop(page);
        buffer_pool.flush_all_pages().unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let pool = buffer_pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let guard = pool.fetch_page_read(page_id).unwrap();
                    assert_eq!(guard.data()[0], 0x42);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(buffer_pool.check_all_unpinned());
    }

    #[test]
    fn test_buffer_pool_eviction_under_concurrency() {
        let (_temp_dir, buffer_pool) = build_pool(4);
        let buffer_pool = Arc::new(buffer_pool);

        // More pages than frames; every page carries its id in byte 0.
        let mut page_ids = vec![];
        for i in 0..16u8 {
            let mut page = buffer_pool.new_page().unwrap();
            page.set_data_from_slice(&[i; PAGE_SIZE]);
            page_ids.push((page.page_id(), i));
            drop(page);
        }

        let mut handles = vec![];
        for chunk in page_ids.chunks(4) {
            let pool = buffer_pool.clone();
            let chunk = chunk.to_vec();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    for (page_id, marker) in &chunk {
                        let guard = pool.fetch_page_read(*page_id).unwrap();
                        assert_eq!(guard.data()[0], *marker);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(buffer_pool.check_all_unpinned());
    }
}
