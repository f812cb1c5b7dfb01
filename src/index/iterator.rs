use std::sync::Arc;

use log::trace;

use crate::buffer::{ReadPageGuard, INVALID_PAGE_ID};
use crate::error::PlumeResult;
use crate::index::b_plus_tree::LeafSearch;
use crate::index::BPlusTree;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::page::{BPlusTreeLeafPage, RecordId};

struct Position {
    guard: ReadPageGuard,
    leaf: BPlusTreeLeafPage,
    slot: usize,
}

/// Forward cursor over the leaf chain. Holds at most one leaf pinned and
/// read-latched at a time; the next leaf is latched before the current one
/// is released.
///
/// A writer rebalancing leaves can hold the next leaf's latch while it
/// waits for ours, so the hop uses a bounded try-latch: when it fails, the
/// cursor drops its position entirely and re-descends from the root to the
/// first key after the last one yielded.
pub struct TreeIndexIterator {
    index: Arc<BPlusTree>,
    position: Option<Position>,
    last_key: Option<Vec<u8>>,
}

impl TreeIndexIterator {
    /// Cursor positioned at the smallest key.
    pub fn begin(index: Arc<BPlusTree>) -> PlumeResult<Self> {
        let position = match index.find_leaf_read(LeafSearch::Leftmost)? {
            Some(guard) => {
                let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data())?;
                Some(Position {
                    guard,
                    leaf,
                    slot: 0,
                })
            }
            None => None,
        };
        Ok(Self {
            index,
            position,
            last_key: None,
        })
    }

    /// Cursor positioned at the first entry with key >= `key`.
    pub fn begin_at(index: Arc<BPlusTree>, key: &[u8]) -> PlumeResult<Self> {
        let position = match index.find_leaf_read(LeafSearch::Key(key))? {
            Some(guard) => {
                let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data())?;
                let slot = leaf.lower_bound(key);
                Some(Position { guard, leaf, slot })
            }
            None => None,
        };
        Ok(Self {
            index,
            position,
            last_key: None,
        })
    }

    /// Cursor positioned past the last entry of the rightmost leaf.
    pub fn end(index: Arc<BPlusTree>) -> PlumeResult<Self> {
        let position = match index.find_leaf_read(LeafSearch::Rightmost)? {
            Some(guard) => {
                let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data())?;
                let slot = leaf.header.current_size as usize;
                Some(Position { guard, leaf, slot })
            }
            None => None,
        };
        Ok(Self {
            index,
            position,
            last_key: None,
        })
    }

    /// True once no further entry will be yielded.
    pub fn is_end(&self) -> bool {
        match &self.position {
            None => true,
            Some(position) => {
                position.slot >= position.leaf.header.current_size as usize
                    && position.leaf.header.next_page_id == INVALID_PAGE_ID
            }
        }
    }

    /// Yields the next entry in ascending key order, or `None` at the end.
    pub fn next(&mut self) -> PlumeResult<Option<(Vec<u8>, RecordId)>> {
        loop {
            let Some(position) = &mut self.position else {
                return Ok(None);
            };

            if position.slot < position.leaf.header.current_size as usize {
                let (key, rid) = position.leaf.kv_at(position.slot).clone();
                position.slot += 1;
                self.last_key = Some(key.clone());
                return Ok(Some((key, rid)));
            }

            let next_page_id = position.leaf.header.next_page_id;
            if next_page_id == INVALID_PAGE_ID {
                self.position = None;
                return Ok(None);
            }

            if !self.advance_to(next_page_id)? {
                self.restart()?;
            }
        }
    }

    /// Latches the next leaf while still holding the current one. Bounded
    /// try-latch so the cursor can never participate in a latch cycle.
    fn advance_to(&mut self, next_page_id: u32) -> PlumeResult<bool> {
        for _ in 0..self.index.config.iterator_latch_retries {
            if let Some(guard) = self.index.buffer_pool.try_fetch_page_read(next_page_id)? {
                let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data())?;
                self.position = Some(Position {
                    guard,
                    leaf,
                    slot: 0,
                });
                return Ok(true);
            }
            std::thread::yield_now();
        }
        Ok(false)
    }

    /// Drops the current position and re-descends from the root to the
    /// first key strictly greater than the last one yielded. Must release
    /// the held leaf before descending, or a rebalancing writer could be
    /// waiting on it forever.
    fn restart(&mut self) -> PlumeResult<()> {
        trace!("iterator restarting past {:?}", self.last_key);
        self.position = None;

        let Some(last_key) = self.last_key.clone() else {
            *self = Self::begin(self.index.clone())?;
            return Ok(());
        };

        let Some(guard) = self.index.find_leaf_read(LeafSearch::Key(&last_key))? else {
            return Ok(());
        };
        let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data())?;
        let mut slot = leaf.lower_bound(&last_key);
        if slot < leaf.header.current_size as usize && leaf.key_at(slot) == last_key.as_slice() {
            slot += 1;
        }
        self.position = Some(Position { guard, leaf, slot });
        Ok(())
    }
}
