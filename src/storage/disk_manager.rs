use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use log::debug;
use parking_lot::Mutex;

use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{PlumeError, PlumeResult};

static EMPTY_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

/// Block-level page store over a single database file. Page ids start at 1
/// (`INVALID_PAGE_ID` is 0); page `n` lives at offset `(n - 1) * PAGE_SIZE`.
///
/// A freshly created file eagerly materializes page 1, which the index
/// layer uses as its well-known roots directory page.
#[derive(Debug)]
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicU32,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> PlumeResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(db_path.as_ref())?;

        let file_len = db_file.metadata()?.len();
        let page_count = (file_len as usize) / PAGE_SIZE;

        let disk_manager = Self {
            db_file: Mutex::new(db_file),
            next_page_id: AtomicU32::new(page_count as u32 + 1),
        };

        if page_count == 0 {
            // Reserve the well-known directory page so page id 1 is always
            // present on disk.
            let reserved = disk_manager.allocate_page()?;
            disk_manager.write_page(reserved, &EMPTY_PAGE)?;
            debug!("created database file, reserved page {}", reserved);
        }

        Ok(disk_manager)
    }

    pub fn read_page(&self, page_id: PageId) -> PlumeResult<BytesMut> {
        if page_id == INVALID_PAGE_ID || page_id >= self.next_page_id.load(Ordering::SeqCst) {
            return Err(PlumeError::Storage(format!(
                "read of unallocated page {}",
                page_id
            )));
        }
        let mut buf = BytesMut::zeroed(PAGE_SIZE);
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        // An allocated page that was never written reads back as zeroes.
        let mut total = 0;
        while total < PAGE_SIZE {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> PlumeResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(PlumeError::Storage(format!(
                "page write of {} bytes, expected {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        if page_id == INVALID_PAGE_ID || page_id >= self.next_page_id.load(Ordering::SeqCst) {
            return Err(PlumeError::Storage(format!(
                "write of unallocated page {}",
                page_id
            )));
        }
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn allocate_page(&self) -> PlumeResult<PageId> {
        let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        debug!("allocated page {}", page_id);
        Ok(page_id)
    }

    /// There is no on-disk free list; deallocation zeroes the page so a
    /// stale image cannot be read back.
    pub fn deallocate_page(&self, page_id: PageId) -> PlumeResult<()> {
        self.write_page(page_id, &EMPTY_PAGE)?;
        debug!("deallocated page {}", page_id);
        Ok(())
    }

    pub fn allocated_page_count(&self) -> u32 {
        self.next_page_id.load(Ordering::SeqCst) - 1
    }

    fn page_offset(page_id: PageId) -> u64 {
        (page_id as u64 - 1) * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disk_manager_write_read_page() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        // Page 1 is reserved at creation.
        assert_eq!(disk_manager.allocated_page_count(), 1);

        let page_id = disk_manager.allocate_page().unwrap();
        assert_eq!(page_id, 2);

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        disk_manager.write_page(page_id, &data).unwrap();

        let read = disk_manager.read_page(page_id).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_disk_manager_unwritten_page_reads_zeroed() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let a = disk_manager.allocate_page().unwrap();
        let b = disk_manager.allocate_page().unwrap();
        let mut data = [7u8; PAGE_SIZE];
        data[3] = 9;
        disk_manager.write_page(b, &data).unwrap();

        let read = disk_manager.read_page(a).unwrap();
        assert!(read.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn test_disk_manager_rejects_unallocated_access() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        assert!(disk_manager.read_page(0).is_err());
        assert!(disk_manager.read_page(42).is_err());
        assert!(disk_manager.write_page(42, &EMPTY_PAGE).is_err());
    }

    #[test]
    fn test_disk_manager_reopen_preserves_allocation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");
        {
            let disk_manager = DiskManager::try_new(&path).unwrap();
            let page_id = disk_manager.allocate_page().unwrap();
            disk_manager.write_page(page_id, &[1u8; PAGE_SIZE]).unwrap();
        }
        let reopened = DiskManager::try_new(&path).unwrap();
        assert_eq!(reopened.allocated_page_count(), 2);
        let read = reopened.read_page(2).unwrap();
        assert!(read.iter().all(|byte| *byte == 1));
    }
}
