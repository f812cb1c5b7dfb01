pub mod buffer_pool;
pub mod page;

pub use buffer_pool::BufferPoolManager;
pub use page::{Page, PinGuard, ReadPageGuard, WritePageGuard};

use std::sync::atomic::AtomicU32;

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;
pub type FrameId = usize;

pub const INVALID_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;
