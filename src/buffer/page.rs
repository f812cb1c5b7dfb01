use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::error;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::buffer::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

/// A buffer frame's contents. The surrounding `RwLock` is the page latch;
/// the pin count lives outside the latch so pin bookkeeping never has to
/// take it.
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

    pub fn destroy(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.data = [0; PAGE_SIZE];
        self.is_dirty = false;
    }

    pub fn set_data_from_slice(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.data.copy_from_slice(data);
        self.is_dirty = true;
    }

    /// Overwrite without marking dirty; used when loading from disk.
    pub fn load_data(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.data.copy_from_slice(data);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_as_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

/// Handle to a pinned frame. While it lives, the frame cannot be evicted
/// and its page identity cannot change. Dropping it decrements the pin
/// count under the replacer lock and, on the last unpin, marks the frame
/// evictable.
pub struct PinGuard {
    pub(crate) page: Arc<RwLock<Page>>,
    pub(crate) pin_count: Arc<AtomicU32>,
    pub(crate) frame_id: FrameId,
    pub(crate) page_id: PageId,
    pub(crate) replacer: Arc<Mutex<LRUKReplacer>>,
}

impl PinGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        // Pin transitions are serialized on the replacer lock so eviction
        // can never observe a half-pinned frame.
        let mut replacer = self.replacer.lock();
        let old_pin_count = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        if old_pin_count == 0 {
            error!("page {} unpinned with pin count already 0", self.page_id);
            return;
        }
        if old_pin_count == 1 {
            if let Err(e) = replacer.set_evictable(self.frame_id, true) {
                error!("failed to mark frame {} evictable: {}", self.frame_id, e);
            }
        }
    }
}

/// Pin plus shared page latch. The latch guard is declared first so it is
/// released before the pin on every exit path.
pub struct ReadPageGuard {
    guard: ArcRwLockReadGuard<RawRwLock, Page>,
    pin: PinGuard,
}

impl ReadPageGuard {
    pub(crate) fn new(pin: PinGuard) -> Self {
        let guard = pin.page.read_arc();
        Self { guard, pin }
    }

    pub(crate) fn try_new(pin: PinGuard) -> Option<Self> {
        let guard = pin.page.try_read_arc()?;
        Some(Self { guard, pin })
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn data(&self) -> &[u8] {
        self.guard.data()
    }
}

/// Pin plus exclusive page latch. Writing through the guard marks the
/// frame dirty.
pub struct WritePageGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
    pin: PinGuard,
}

impl WritePageGuard {
    pub(crate) fn new(pin: PinGuard) -> Self {
        let guard = pin.page.write_arc();
        Self { guard, pin }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn data(&self) -> &[u8] {
        self.guard.data()
    }

    pub fn set_data_from_slice(&mut self, data: &[u8]) {
        self.guard.set_data_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin_fixture(page_id: PageId) -> (Arc<RwLock<Page>>, Arc<AtomicU32>, Arc<Mutex<LRUKReplacer>>) {
        let page = Arc::new(RwLock::new(Page::new(page_id)));
        let pin_count = Arc::new(AtomicU32::new(1));
        let replacer = Arc::new(Mutex::new(LRUKReplacer::with_k(10, 2)));
        replacer.lock().record_access(0).unwrap();
        (page, pin_count, replacer)
    }

    #[test]
    fn test_pin_guard_unpins_on_drop() {
        let (page, pin_count, replacer) = pin_fixture(1);
        let pin = PinGuard {
            page: page.clone(),
            pin_count: pin_count.clone(),
            frame_id: 0,
            page_id: 1,
            replacer: replacer.clone(),
        };
        assert_eq!(Arc::strong_count(&page), 2);
        drop(pin);
        assert_eq!(Arc::strong_count(&page), 1);
        assert_eq!(pin_count.load(Ordering::SeqCst), 0);
        // Last unpin handed the frame to the replacer.
        assert_eq!(replacer.lock().size(), 1);
    }

    #[test]
    fn test_write_guard_marks_dirty() {
        let (page, pin_count, replacer) = pin_fixture(1);
        let pin = PinGuard {
            page,
            pin_count,
            frame_id: 0,
            page_id: 1,
            replacer,
        };

        let mut guard = WritePageGuard::new(pin);
        assert!(!guard.guard.is_dirty);
        guard.set_data_from_slice(&[1u8; PAGE_SIZE]);
        assert!(guard.guard.is_dirty);
        assert_eq!(guard.data()[0], 1);
    }

    #[test]
    fn test_read_guard_released_before_unpin() {
        let (page, pin_count, replacer) = pin_fixture(1);
        let pin = PinGuard {
            page: page.clone(),
            pin_count,
            frame_id: 0,
            page_id: 1,
            replacer,
        };

        let guard = ReadPageGuard::new(pin);
        assert!(page.try_write().is_none());
        drop(guard);
        assert!(page.try_write().is_some());
    }
}
