use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock};

use crate::buffer::{AtomicPageId, BufferPoolManager, PageId, WritePageGuard, INVALID_PAGE_ID};
use crate::config::BTreeConfig;
use crate::error::{PlumeError, PlumeResult};
use crate::storage::codec::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec, IndexRootsPageCodec,
};
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, RecordId, INDEX_ROOTS_PAGE_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeOp {
    Insert,
    Delete,
}

impl TreeOp {
    fn is_insert(self) -> bool {
        matches!(self, TreeOp::Insert)
    }
}

/// Per-operation crabbing state: the tree-level latch plus the write
/// latches of every ancestor that is still unsafe to release, ordered
/// root-first. Pages queued for deletion are freed by the caller only
/// after every latch is gone.
pub(crate) struct Context {
    root_latch: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
    write_set: VecDeque<WritePageGuard>,
    deleted_pages: Vec<PageId>,
}

impl Context {
    fn new(root_latch: ArcRwLockWriteGuard<RawRwLock, ()>) -> Self {
        Self {
            root_latch: Some(root_latch),
            write_set: VecDeque::new(),
            deleted_pages: Vec::new(),
        }
    }

    /// Release every ancestor latch, including the tree-level latch. The
    /// current node's own guard lives outside the context.
    fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.root_latch = None;
    }
}

/// Disk-paged B+Tree mapping binary keys to record ids. Readers crab
/// downward with shared latches; writers crab with exclusive latches and
/// release ancestors as soon as a child is safe. The root pointer is
/// guarded by a tree-level latch and mirrored into the roots directory
/// page on every change.
#[derive(Debug)]
pub struct BPlusTree {
    pub index_name: String,
    pub buffer_pool: Arc<BufferPoolManager>,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
    pub config: BTreeConfig,
    root_page_id: AtomicPageId,
    root_latch: Arc<RwLock<()>>,
}

impl BPlusTree {
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> PlumeResult<Self> {
        Self::new_with_config(
            index_name,
            buffer_pool,
            leaf_max_size,
            internal_max_size,
            BTreeConfig::default(),
        )
    }

    pub fn new_with_config(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: u32,
        internal_max_size: u32,
        config: BTreeConfig,
    ) -> PlumeResult<Self> {
        if leaf_max_size < 2 || internal_max_size < 3 {
            return Err(PlumeError::Internal(format!(
                "node capacity too small: leaf_max_size={} internal_max_size={}",
                leaf_max_size, internal_max_size
            )));
        }
        let index_name = index_name.into();

        // Adopt the persisted root if the directory already knows us.
        let guard = buffer_pool.fetch_page_read(INDEX_ROOTS_PAGE_ID)?;
        let (roots, _) = IndexRootsPageCodec::decode(guard.data())?;
        let root_page_id = roots.get_record(&index_name).unwrap_or(INVALID_PAGE_ID);
        drop(guard);

        Ok(Self {
            index_name,
            buffer_pool,
            leaf_max_size,
            internal_max_size,
            config,
            root_page_id: AtomicPageId::new(root_page_id),
            root_latch: Arc::new(RwLock::new(())),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.get_root_page_id() == INVALID_PAGE_ID
    }

    pub fn get_root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    /// Point lookup. Crabs downward with shared latches: the child is
    /// latched before the parent is released, so the path stays consistent
    /// under concurrent splits and merges.
    pub fn get_value(&self, key: &[u8]) -> PlumeResult<Option<RecordId>> {
        let root_latch = self.root_latch.read();
        let root_page_id = self.get_root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(root_page_id)?;
        drop(root_latch);

        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_page_id = internal.look_up(key);
                    // Assignment latches the child before the old guard
                    // drops.
                    guard = self.buffer_pool.fetch_page_read(child_page_id)?;
                }
                BPlusTreePage::Leaf(leaf) => {
                    return Ok(leaf.look_up(key));
                }
            }
        }
    }

    /// Inserts a unique key. Returns false when the key is already
    /// present.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> PlumeResult<bool> {
        let mut context = Context::new(self.root_latch.write_arc());

        if self.get_root_page_id() == INVALID_PAGE_ID {
            self.start_new_tree(key, rid)?;
            return Ok(true);
        }

        let (mut leaf_guard, mut leaf) = self.find_leaf_write(key, TreeOp::Insert, &mut context)?;
        if leaf.look_up(key).is_some() {
            return Ok(false);
        }

        if leaf.header.current_size < self.leaf_max_size - 1 {
            leaf.insert(key, rid);
            leaf_guard.set_data_from_slice(&BPlusTreeLeafPageCodec::encode(&leaf));
            return Ok(true);
        }

        // The leaf is one short of overflowing: insert, then split.
        leaf.insert(key, rid);

        let mut new_leaf_guard = self.buffer_pool.new_page()?;
        let new_leaf_page_id = new_leaf_guard.page_id();
        let mut new_leaf = BPlusTreeLeafPage::new(
            new_leaf_page_id,
            leaf.header.parent_page_id,
            self.leaf_max_size,
        );
        leaf.move_last_half_to(&mut new_leaf);
        let separator = new_leaf.key_at(0).to_vec();

        leaf_guard.set_data_from_slice(&BPlusTreeLeafPageCodec::encode(&leaf));
        new_leaf_guard.set_data_from_slice(&BPlusTreeLeafPageCodec::encode(&new_leaf));
        debug!(
            "split leaf {} -> new sibling {}",
            leaf_guard.page_id(),
            new_leaf_page_id
        );
        // The sibling is fully formed and only reachable through latched
        // pages; release it so parent propagation can re-latch it freely.
        drop(new_leaf_guard);

        self.insert_into_parent(&mut context, &mut leaf_guard, separator, new_leaf_page_id)?;
        Ok(true)
    }

    /// Removes a key if present; absent keys are a quiet no-op. Underflow
    /// is repaired by borrowing from or merging with a sibling, recursing
    /// up the retained ancestor chain.
    pub fn remove(&self, key: &[u8]) -> PlumeResult<()> {
        let mut context = Context::new(self.root_latch.write_arc());

        if self.get_root_page_id() == INVALID_PAGE_ID {
            return Ok(());
        }

        let (leaf_guard, _) = self.find_leaf_write(key, TreeOp::Delete, &mut context)?;
        self.delete_entry(&mut context, leaf_guard, key.to_vec())?;

        // Free emptied pages only after the whole path is unlatched, so a
        // concurrent descender that released latches higher up can never
        // land on a recycled frame.
        context.release_ancestors();
        let deleted_pages = std::mem::take(&mut context.deleted_pages);
        drop(context);
        for page_id in deleted_pages {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }

    fn start_new_tree(&self, key: &[u8], rid: RecordId) -> PlumeResult<()> {
        let mut root_guard = self.buffer_pool.new_page()?;
        let root_page_id = root_guard.page_id();
        let mut root = BPlusTreeLeafPage::new(root_page_id, INVALID_PAGE_ID, self.leaf_max_size);
        root.insert(key, rid);
        root_guard.set_data_from_slice(&BPlusTreeLeafPageCodec::encode(&root));
        drop(root_guard);

        self.set_root_page_id(root_page_id)?;
        debug!("started new tree with root {}", root_page_id);
        Ok(())
    }

    /// Publishes a root change to the in-memory pointer and the roots
    /// directory page. Callers hold the tree-level latch.
    fn set_root_page_id(&self, page_id: PageId) -> PlumeResult<()> {
        self.root_page_id.store(page_id, Ordering::SeqCst);

        let mut guard = self.buffer_pool.fetch_page_write(INDEX_ROOTS_PAGE_ID)?;
        let (mut roots, _) = IndexRootsPageCodec::decode(guard.data())?;
        if roots.get_record(&self.index_name).is_some() {
            roots.update_record(&self.index_name, page_id)?;
        } else {
            roots.insert_record(&self.index_name, page_id)?;
        }
        guard.set_data_from_slice(&IndexRootsPageCodec::encode(&roots));
        Ok(())
    }

    /// Write-latch descent. Each child is latched before its safety is
    /// judged; a safe child lets every ancestor latch (tree-level latch
    /// included) go. Unsafe ancestors stay latched on the context.
    fn find_leaf_write(
        &self,
        key: &[u8],
        op: TreeOp,
        context: &mut Context,
    ) -> PlumeResult<(WritePageGuard, BPlusTreeLeafPage)> {
        let root_page_id = self.get_root_page_id();
        let mut guard = self.buffer_pool.fetch_page_write(root_page_id)?;
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data())?;
        if page.is_root_safe(op.is_insert()) {
            context.release_ancestors();
        }

        loop {
            match page {
                BPlusTreePage::Leaf(leaf) => return Ok((guard, leaf)),
                BPlusTreePage::Internal(internal) => {
                    let child_page_id = internal.look_up(key);
                    let child_guard = self.buffer_pool.fetch_page_write(child_page_id)?;
                    let (child_page, _) = BPlusTreePageCodec::decode(child_guard.data())?;
                    context.write_set.push_back(guard);
                    if child_page.is_safe(op.is_insert()) {
                        context.release_ancestors();
                    }
                    guard = child_guard;
                    page = child_page;
                }
            }
        }
    }

    /// Propagates a split: installs `separator`/`right_page_id` into the
    /// parent of the node behind `left_guard`, growing a new root or
    /// splitting the parent recursively as needed.
    fn insert_into_parent(
        &self,
        context: &mut Context,
        left_guard: &mut WritePageGuard,
        separator: Vec<u8>,
        right_page_id: PageId,
    ) -> PlumeResult<()> {
        let left_page_id = left_guard.page_id();
        let (left_page, _) = BPlusTreePageCodec::decode(left_guard.data())?;

        if left_page.is_root() {
            // The split node was the root; grow the tree by one level.
            let mut root_guard = self.buffer_pool.new_page()?;
            let new_root_page_id = root_guard.page_id();
            let mut new_root = BPlusTreeInternalPage::new(
                new_root_page_id,
                INVALID_PAGE_ID,
                self.internal_max_size,
            );
            new_root.populate_new_root(left_page_id, separator, right_page_id);
            root_guard.set_data_from_slice(&BPlusTreeInternalPageCodec::encode(&new_root));
            drop(root_guard);

            self.set_parent_via_guard(left_guard, new_root_page_id)?;
            self.set_parent(right_page_id, new_root_page_id)?;
            self.set_root_page_id(new_root_page_id)?;
            debug!("grew new root {}", new_root_page_id);
            return Ok(());
        }

        let mut parent_guard = context.write_set.pop_back().ok_or_else(|| {
            PlumeError::Internal("split propagation lost its parent latch".to_string())
        })?;
        let (mut parent, _) = BPlusTreeInternalPageCodec::decode(parent_guard.data())?;

        if parent.header.current_size < parent.header.max_size {
            parent.insert_after_value(left_page_id, separator, right_page_id);
            parent_guard.set_data_from_slice(&BPlusTreeInternalPageCodec::encode(&parent));
            // The new sibling was created with the parent's id, so no
            // re-parenting is needed here.
            return Ok(());
        }

        // Parent overflows: insert, split it, and recurse.
        parent.insert_after_value(left_page_id, separator, right_page_id);

        let mut new_internal_guard = self.buffer_pool.new_page()?;
        let new_internal_page_id = new_internal_guard.page_id();
        let mut new_internal = BPlusTreeInternalPage::new(
            new_internal_page_id,
            parent.header.parent_page_id,
            self.internal_max_size,
        );
        let moved_children = parent.move_last_half_to(&mut new_internal);
        let push_up = new_internal.key_at(0).to_vec();

        parent_guard.set_data_from_slice(&BPlusTreeInternalPageCodec::encode(&parent));
        new_internal_guard.set_data_from_slice(&BPlusTreeInternalPageCodec::encode(&new_internal));
        debug!(
            "split internal {} -> new sibling {}",
            parent_guard.page_id(),
            new_internal_page_id
        );
        drop(new_internal_guard);

        for child_page_id in moved_children {
            if child_page_id == left_page_id {
                // That child's latch is held right here in the call
                // stack; re-latching it would self-deadlock.
                self.set_parent_via_guard(left_guard, new_internal_page_id)?;
            } else {
                self.set_parent(child_page_id, new_internal_page_id)?;
            }
        }

        self.insert_into_parent(context, &mut parent_guard, push_up, new_internal_page_id)
    }

    /// Removes `key` from the node behind `guard`, rebalancing on
    /// underflow. Recursion walks the retained ancestor chain upward.
    fn delete_entry(
        &self,
        context: &mut Context,
        mut guard: WritePageGuard,
        key: Vec<u8>,
    ) -> PlumeResult<()> {
        let page_id = guard.page_id();
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data())?;

        let removed = match &mut page {
            BPlusTreePage::Leaf(leaf) => leaf.remove_at_key(&key),
            BPlusTreePage::Internal(internal) => internal.remove_at_key(&key),
        };
        if !removed {
            if page.is_leaf() {
                return Ok(());
            }
            return Err(PlumeError::Internal(format!(
                "separator vanished from internal page {}",
                page_id
            )));
        }
        guard.set_data_from_slice(&BPlusTreePageCodec::encode(&page));

        if page.is_root() {
            return self.adjust_root(context, guard, page);
        }

        if page.size() >= page.min_size() {
            return Ok(());
        }

        // Underflow: the parent latch is still on the context (the node
        // was judged unsafe on the way down).
        let mut parent_guard = context.write_set.pop_back().ok_or_else(|| {
            PlumeError::Internal("rebalance lost its parent latch".to_string())
        })?;
        let (mut parent, _) = BPlusTreeInternalPageCodec::decode(parent_guard.data())?;

        let index = parent.value_index(page_id).ok_or_else(|| {
            PlumeError::Internal(format!("page {} missing from its parent", page_id))
        })?;
        // Prefer the left sibling; the leftmost child pairs with its right
        // neighbour. The separator between the pair sits at the greater of
        // the two positions.
        let (sibling_index, separator_index) = if index > 0 {
            (index - 1, index)
        } else {
            (index + 1, index + 1)
        };
        let separator = parent.key_at(separator_index).to_vec();
        let sibling_page_id = parent.value_at(sibling_index);
        let mut sibling_guard = self.buffer_pool.fetch_page_write(sibling_page_id)?;
        let (mut sibling_page, _) = BPlusTreePageCodec::decode(sibling_guard.data())?;

        let merge_limit = if page.is_leaf() {
            self.leaf_max_size - 1
        } else {
            self.internal_max_size
        };

        if page.size() + sibling_page.size() <= merge_limit {
            // Coalesce: move the right participant into the left one.
            let (left_guard_ref, right_page_id) = if index == 0 {
                self.merge_into_left(&mut page, &mut sibling_page, &separator, page_id)?;
                guard.set_data_from_slice(&BPlusTreePageCodec::encode(&page));
                (&guard, sibling_page_id)
            } else {
                self.merge_into_left(&mut sibling_page, &mut page, &separator, sibling_page_id)?;
                sibling_guard.set_data_from_slice(&BPlusTreePageCodec::encode(&sibling_page));
                (&sibling_guard, page_id)
            };
            debug!(
                "merged page {} into {}",
                right_page_id,
                left_guard_ref.page_id()
            );
            context.deleted_pages.push(right_page_id);

            // Both children must unlatch before the recursion touches the
            // parent: the parent may collapse into the root and promote
            // the merged node, which would re-latch it.
            drop(guard);
            drop(sibling_guard);
            return self.delete_entry(context, parent_guard, separator);
        }

        // Redistribute one entry across the separator.
        if index > 0 {
            // Sibling on the left: its last entry becomes our first.
            match (&mut sibling_page, &mut page) {
                (BPlusTreePage::Leaf(left), BPlusTreePage::Leaf(right)) => {
                    left.move_last_to_front_of(right);
                    parent.set_key_at(separator_index, right.key_at(0).to_vec());
                }
                (BPlusTreePage::Internal(left), BPlusTreePage::Internal(right)) => {
                    let moved_child = left.move_last_to_front_of(right, separator);
                    parent.set_key_at(separator_index, right.key_at(0).to_vec());
                    self.set_parent(moved_child, page_id)?;
                }
                _ => {
                    return Err(PlumeError::Internal(
                        "siblings disagree on node kind".to_string(),
                    ))
                }
            }
        } else {
            // Sibling on the right: its first entry becomes our last.
            match (&mut page, &mut sibling_page) {
                (BPlusTreePage::Leaf(left), BPlusTreePage::Leaf(right)) => {
                    right.move_first_to_end_of(left);
                    parent.set_key_at(separator_index, right.key_at(0).to_vec());
                }
                (BPlusTreePage::Internal(left), BPlusTreePage::Internal(right)) => {
                    let moved_child = right.move_first_to_end_of(left, separator);
                    parent.set_key_at(separator_index, right.key_at(0).to_vec());
                    self.set_parent(moved_child, page_id)?;
                }
                _ => {
                    return Err(PlumeError::Internal(
                        "siblings disagree on node kind".to_string(),
                    ))
                }
            }
        }
        debug!(
            "redistributed between page {} and sibling {}",
            page_id, sibling_page_id
        );

        guard.set_data_from_slice(&BPlusTreePageCodec::encode(&page));
        sibling_guard.set_data_from_slice(&BPlusTreePageCodec::encode(&sibling_page));
        parent_guard.set_data_from_slice(&BPlusTreeInternalPageCodec::encode(&parent));
        Ok(())
    }

    /// Moves everything from `right` into `left`. For internal nodes the
    /// parent separator drops down to key the migrated block and the moved
    /// children are re-parented; for leaves the sibling chain is spliced.
    fn merge_into_left(
        &self,
        left: &mut BPlusTreePage,
        right: &mut BPlusTreePage,
        separator: &[u8],
        left_page_id: PageId,
    ) -> PlumeResult<()> {
        match (left, right) {
            (BPlusTreePage::Leaf(left), BPlusTreePage::Leaf(right)) => {
                right.move_all_to(left);
                Ok(())
            }
            (BPlusTreePage::Internal(left), BPlusTreePage::Internal(right)) => {
                let moved_children = right.move_all_to(left, separator.to_vec());
                for child_page_id in moved_children {
                    self.set_parent(child_page_id, left_page_id)?;
                }
                Ok(())
            }
            _ => Err(PlumeError::Internal(
                "siblings disagree on node kind".to_string(),
            )),
        }
    }

    /// Root shape changes after deletion: an internal root left with a
    /// single child hands the tree to that child; an emptied leaf root
    /// leaves the tree empty.
    fn adjust_root(
        &self,
        context: &mut Context,
        guard: WritePageGuard,
        page: BPlusTreePage,
    ) -> PlumeResult<()> {
        let root_page_id = guard.page_id();
        match &page {
            BPlusTreePage::Internal(internal) if internal.header.current_size == 1 => {
                let new_root_page_id = internal.value_at(0);
                self.set_parent(new_root_page_id, INVALID_PAGE_ID)?;
                self.set_root_page_id(new_root_page_id)?;
                context.deleted_pages.push(root_page_id);
                debug!(
                    "promoted page {} to root, retiring {}",
                    new_root_page_id, root_page_id
                );
            }
            BPlusTreePage::Leaf(leaf) if leaf.header.current_size == 0 => {
                self.set_root_page_id(INVALID_PAGE_ID)?;
                context.deleted_pages.push(root_page_id);
                debug!("tree emptied, retiring root {}", root_page_id);
            }
            _ => {}
        }
        Ok(())
    }

    fn set_parent(&self, page_id: PageId, parent_page_id: PageId) -> PlumeResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data())?;
        page.set_parent_page_id(parent_page_id);
        guard.set_data_from_slice(&BPlusTreePageCodec::encode(&page));
        Ok(())
    }

    fn set_parent_via_guard(
        &self,
        guard: &mut WritePageGuard,
        parent_page_id: PageId,
    ) -> PlumeResult<()> {
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data())?;
        page.set_parent_page_id(parent_page_id);
        guard.set_data_from_slice(&BPlusTreePageCodec::encode(&page));
        Ok(())
    }
}

/// Read-descent targets shared by lookups and the iterator.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LeafSearch<'a> {
    Key(&'a [u8]),
    Leftmost,
    Rightmost,
}

impl BPlusTree {
    /// Shared-latch descent to a leaf. Returns `None` on an empty tree.
    pub(crate) fn find_leaf_read(
        &self,
        target: LeafSearch<'_>,
    ) -> PlumeResult<Option<crate::buffer::ReadPageGuard>> {
        let root_latch = self.root_latch.read();
        let root_page_id = self.get_root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(root_page_id)?;
        drop(root_latch);

        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_page_id = match target {
                        LeafSearch::Key(key) => internal.look_up(key),
                        LeafSearch::Leftmost => internal.value_at(0),
                        LeafSearch::Rightmost => {
                            internal.value_at(internal.header.current_size as usize - 1)
                        }
                    };
                    guard = self.buffer_pool.fetch_page_read(child_page_id)?;
                }
                BPlusTreePage::Leaf(_) => return Ok(Some(guard)),
            }
        }
    }
}

/// Structural self-checks used by tests after every mutation.
#[derive(Debug, Default)]
struct SubtreeSummary {
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    depth: usize,
    key_count: usize,
    leaves: Vec<PageId>,
}

impl BPlusTree {
    /// Validates the structural invariants of the whole tree: sorted
    /// nodes, size bounds, separator bounds, uniform leaf depth, and a
    /// sibling chain that enumerates every key exactly once in ascending
    /// order. Intended for quiesced trees (tests, debug assertions).
    pub fn check_integrity(&self) -> PlumeResult<()> {
        let root_page_id = self.get_root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let summary = self.check_subtree(root_page_id, INVALID_PAGE_ID)?;

        // The sibling chain must visit exactly the leaves the recursion
        // saw, in the same order, with globally ascending keys.
        let mut chained_leaves = Vec::new();
        let mut chained_keys = 0usize;
        let mut previous_key: Option<Vec<u8>> = None;
        let Some(leftmost) = self.find_leaf_read(LeafSearch::Leftmost)? else {
            return Err(PlumeError::Internal(
                "non-empty tree has no leftmost leaf".to_string(),
            ));
        };
        let mut guard = leftmost;
        loop {
            let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data())?;
            chained_leaves.push(leaf.header.page_id);
            for (key, _) in leaf.array.iter() {
                if let Some(previous) = &previous_key {
                    if previous >= key {
                        return Err(PlumeError::Internal(format!(
                            "sibling chain keys not ascending at leaf {}",
                            leaf.header.page_id
                        )));
                    }
                }
                previous_key = Some(key.clone());
                chained_keys += 1;
            }
            if leaf.header.next_page_id == INVALID_PAGE_ID {
                break;
            }
            guard = self.buffer_pool.fetch_page_read(leaf.header.next_page_id)?;
        }

        if chained_leaves != summary.leaves {
            return Err(PlumeError::Internal(
                "sibling chain disagrees with tree structure".to_string(),
            ));
        }
        if chained_keys != summary.key_count {
            return Err(PlumeError::Internal(format!(
                "sibling chain saw {} keys, tree holds {}",
                chained_keys, summary.key_count
            )));
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
    ) -> PlumeResult<SubtreeSummary> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
        drop(guard);

        if page.page_id() != page_id {
            return Err(PlumeError::Internal(format!(
                "page {} stores id {}",
                page_id,
                page.page_id()
            )));
        }
        if page.parent_page_id() != expected_parent {
            return Err(PlumeError::Internal(format!(
                "page {} stores parent {}, expected {}",
                page_id,
                page.parent_page_id(),
                expected_parent
            )));
        }

        match page {
            BPlusTreePage::Leaf(leaf) => {
                let size = leaf.header.current_size;
                if leaf.is_root() {
                    if size == 0 || size > leaf.header.max_size - 1 {
                        return Err(PlumeError::Internal(format!(
                            "root leaf {} has size {}",
                            page_id, size
                        )));
                    }
                } else if size < leaf.min_size() || size > leaf.header.max_size - 1 {
                    return Err(PlumeError::Internal(format!(
                        "leaf {} violates size bounds: {} not in [{}, {}]",
                        page_id,
                        size,
                        leaf.min_size(),
                        leaf.header.max_size - 1
                    )));
                }
                for window in leaf.array.windows(2) {
                    if window[0].0 >= window[1].0 {
                        return Err(PlumeError::Internal(format!(
                            "leaf {} keys not strictly increasing",
                            page_id
                        )));
                    }
                }
                Ok(SubtreeSummary {
                    min_key: leaf.array.first().map(|kv| kv.0.clone()).unwrap_or_default(),
                    max_key: leaf.array.last().map(|kv| kv.0.clone()).unwrap_or_default(),
                    depth: 0,
                    key_count: leaf.array.len(),
                    leaves: vec![page_id],
                })
            }
            BPlusTreePage::Internal(internal) => {
                let size = internal.header.current_size;
                if internal.is_root() {
                    if size < 2 || size > internal.header.max_size {
                        return Err(PlumeError::Internal(format!(
                            "root internal {} has size {}",
                            page_id, size
                        )));
                    }
                } else if size < internal.min_size() || size > internal.header.max_size {
                    return Err(PlumeError::Internal(format!(
                        "internal {} violates size bounds: {} not in [{}, {}]",
                        page_id,
                        size,
                        internal.min_size(),
                        internal.header.max_size
                    )));
                }
                for index in 2..internal.array.len() {
                    if internal.array[index - 1].0 >= internal.array[index].0 {
                        return Err(PlumeError::Internal(format!(
                            "internal {} keys not strictly increasing",
                            page_id
                        )));
                    }
                }

                let mut summary = SubtreeSummary::default();
                let mut previous: Option<SubtreeSummary> = None;
                for (index, (key, child_page_id)) in internal.array.iter().enumerate() {
                    let child = self.check_subtree(*child_page_id, page_id)?;
                    if let Some(previous) = &previous {
                        if previous.depth != child.depth {
                            return Err(PlumeError::Internal(format!(
                                "internal {} has children at different depths",
                                page_id
                            )));
                        }
                        // max(L) < K[i] <= min(R)
                        if previous.max_key.as_slice() >= key.as_slice() {
                            return Err(PlumeError::Internal(format!(
                                "internal {} separator {:?} not above left subtree",
                                page_id, key
                            )));
                        }
                        if key.as_slice() > child.min_key.as_slice() {
                            return Err(PlumeError::Internal(format!(
                                "internal {} separator {:?} not below right subtree",
                                page_id, key
                            )));
                        }
                    } else if index != 0 {
                        unreachable!();
                    }
                    summary.key_count += child.key_count;
                    summary.leaves.extend(child.leaves.iter().copied());
                    if index == 0 {
                        summary.min_key = child.min_key.clone();
                    }
                    summary.max_key = child.max_key.clone();
                    summary.depth = child.depth + 1;
                    previous = Some(child);
                }
                Ok(summary)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TreeIndexIterator;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn key(i: i64) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    fn rid(i: i64) -> RecordId {
        RecordId::new(i as u32, i as u32)
    }

    fn build_tree(
        pool_size: usize,
        leaf_max: u32,
        internal_max: u32,
    ) -> (TempDir, Arc<BPlusTree>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, 2, disk_scheduler));
        let tree =
            Arc::new(BPlusTree::new("test_idx", buffer_pool, leaf_max, internal_max).unwrap());
        (temp_dir, tree)
    }

    #[test]
    fn test_insert_then_lookup() {
        let (_temp_dir, tree) = build_tree(64, 4, 4);
        assert!(tree.is_empty());

        assert!(tree.insert(&key(42), rid(42)).unwrap());
        assert!(!tree.is_empty());
        assert_eq!(tree.get_value(&key(42)).unwrap(), Some(rid(42)));
        assert_eq!(tree.get_value(&key(41)).unwrap(), None);

        // A second insert of the same key is rejected and leaves the old
        // value behind.
        assert!(!tree.insert(&key(42), rid(7)).unwrap());
        assert_eq!(tree.get_value(&key(42)).unwrap(), Some(rid(42)));

        tree.check_integrity().unwrap();
        assert!(tree.buffer_pool.check_all_unpinned());
    }

    #[test]
    fn test_remove_is_quiet_on_absent_keys() {
        let (_temp_dir, tree) = build_tree(64, 4, 4);
        // Removing from an empty tree is a no-op.
        tree.remove(&key(1)).unwrap();

        assert!(tree.insert(&key(1), rid(1)).unwrap());
        tree.remove(&key(1)).unwrap();
        assert_eq!(tree.get_value(&key(1)).unwrap(), None);
        // A second remove is a no-op too.
        tree.remove(&key(1)).unwrap();

        assert!(tree.is_empty());
        assert_eq!(tree.get_root_page_id(), INVALID_PAGE_ID);
        assert!(tree.buffer_pool.check_all_unpinned());
    }

    #[test]
    fn test_scenario_small_split_and_shrink() {
        // leaf_max_size = 4, internal_max_size = 4: inserting 1..=5 splits
        // the root; removing the extremes collapses it again.
        let (_temp_dir, tree) = build_tree(64, 4, 4);
        for i in 1..=5 {
            assert!(tree.insert(&key(i), rid(i)).unwrap());
            tree.check_integrity().unwrap();
        }

        tree.remove(&key(1)).unwrap();
        tree.check_integrity().unwrap();
        tree.remove(&key(5)).unwrap();
        tree.check_integrity().unwrap();

        for present in [2, 3, 4] {
            assert_eq!(
                tree.get_value(&key(present)).unwrap(),
                Some(rid(present)),
                "key {} must survive",
                present
            );
        }
        for absent in [1, 5] {
            assert_eq!(tree.get_value(&key(absent)).unwrap(), None);
        }

        // Iteration from key 2 yields exactly the three survivors.
        let mut iterator = TreeIndexIterator::begin_at(tree.clone(), &key(2)).unwrap();
        assert_eq!(iterator.next().unwrap(), Some((key(2), rid(2))));
        assert_eq!(iterator.next().unwrap(), Some((key(3), rid(3))));
        assert_eq!(iterator.next().unwrap(), Some((key(4), rid(4))));
        assert_eq!(iterator.next().unwrap(), None);
        drop(iterator);
        assert!(tree.buffer_pool.check_all_unpinned());
    }

    #[test]
    fn test_scenario_mixed_workload_drains_to_empty() {
        let (_temp_dir, tree) = build_tree(64, 4, 4);
        let check = |tree: &Arc<BPlusTree>| {
            tree.check_integrity().unwrap();
            assert!(tree.buffer_pool.check_all_unpinned());
        };

        for i in [2, 4, 15, 3, 7, 16, 18, 22, 20, 25, 11, 13] {
            assert!(tree.insert(&key(i), rid(i)).unwrap());
            check(&tree);
        }
        for i in [15, 16] {
            tree.remove(&key(i)).unwrap();
            check(&tree);
        }
        for i in [8, 26] {
            assert!(tree.insert(&key(i), rid(i)).unwrap());
            check(&tree);
        }
        for i in [4, 20, 7] {
            tree.remove(&key(i)).unwrap();
            check(&tree);
        }
        for i in [2, 8, 3, 26, 18, 22, 25, 11, 13] {
            tree.remove(&key(i)).unwrap();
            check(&tree);
        }

        assert!(tree.is_empty());
        assert_eq!(tree.get_root_page_id(), INVALID_PAGE_ID);
    }

    #[test]
    fn test_random_churn_10k_keys() {
        let (_temp_dir, tree) = build_tree(4000, 10, 10);
        let mut rng = rand::rng();

        let mut keys: Vec<i64> = (0..10_000).collect();
        keys.shuffle(&mut rng);
        for (step, i) in keys.iter().enumerate() {
            assert!(tree.insert(&key(*i), rid(*i)).unwrap());
            if step % 1000 == 999 {
                tree.check_integrity().unwrap();
            }
        }
        tree.check_integrity().unwrap();

        // Spot-check lookups before draining.
        for _ in 0..100 {
            let probe = rng.random_range(0..10_000);
            assert_eq!(tree.get_value(&key(probe)).unwrap(), Some(rid(probe)));
        }

        keys.shuffle(&mut rng);
        for (step, i) in keys.iter().enumerate() {
            tree.remove(&key(*i)).unwrap();
            if step % 1000 == 999 {
                tree.check_integrity().unwrap();
            }
        }

        assert!(tree.is_empty());
        assert_eq!(tree.get_root_page_id(), INVALID_PAGE_ID);
        assert!(tree.buffer_pool.check_all_unpinned());
    }

    #[test]
    fn test_iteration_from_key_is_sorted() {
        let (_temp_dir, tree) = build_tree(256, 5, 5);
        for i in (0..500).rev() {
            assert!(tree.insert(&key(i * 3), rid(i * 3)).unwrap());
        }

        let mut iterator = TreeIndexIterator::begin_at(tree.clone(), &key(100)).unwrap();
        let mut previous = None::<Vec<u8>>;
        let mut count = 0;
        while let Some((k, _)) = iterator.next().unwrap() {
            assert!(k.as_slice() >= key(100).as_slice());
            if let Some(previous) = &previous {
                assert!(previous.as_slice() < k.as_slice());
            }
            previous = Some(k);
            count += 1;
        }
        // Keys 102, 105, ..., 1497.
        assert_eq!(count, 466);
    }

    #[test]
    fn test_root_survives_reopen_through_directory() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferPoolManager::new(64, 2, disk_scheduler));

        let root_page_id = {
            let tree =
                Arc::new(BPlusTree::new("persisted_idx", buffer_pool.clone(), 4, 4).unwrap());
            for i in 0..20 {
                assert!(tree.insert(&key(i), rid(i)).unwrap());
            }
            tree.get_root_page_id()
        };

        // A second handle finds the same root through the roots directory.
        let reopened = BPlusTree::new("persisted_idx", buffer_pool, 4, 4).unwrap();
        assert_eq!(reopened.get_root_page_id(), root_page_id);
        for i in 0..20 {
            assert_eq!(reopened.get_value(&key(i)).unwrap(), Some(rid(i)));
        }
    }

    #[test]
    fn test_concurrent_reads_during_inserts() {
        let (_temp_dir, tree) = build_tree(512, 10, 10);
        for i in 0..1000 {
            assert!(tree.insert(&key(i), rid(i)).unwrap());
        }

        let mut handles = vec![];
        for _ in 0..8 {
            let tree = tree.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..1000 {
                    let probe = rng.random_range(0..1000);
                    assert_eq!(tree.get_value(&key(probe)).unwrap(), Some(rid(probe)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(tree.buffer_pool.check_all_unpinned());
    }

    #[test]
    fn test_concurrent_insert_delete_high_contention() {
        const NUM_THREADS: usize = 8;
        const KEYS_PER_THREAD: i64 = 500;
        const TOTAL_KEYS: i64 = NUM_THREADS as i64 * KEYS_PER_THREAD;

        let (_temp_dir, tree) = build_tree(4000, 10, 10);

        // Phase 1: concurrent inserts of disjoint ranges.
        let barrier = Arc::new(Barrier::new(NUM_THREADS));
        let mut handles = vec![];
        for thread_index in 0..NUM_THREADS {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                let start = thread_index as i64 * KEYS_PER_THREAD;
                barrier.wait();
                for i in start..start + KEYS_PER_THREAD {
                    assert!(tree.insert(&key(i), rid(i)).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..TOTAL_KEYS {
            assert_eq!(tree.get_value(&key(i)).unwrap(), Some(rid(i)), "key {}", i);
        }
        tree.check_integrity().unwrap();

        // Phase 2: concurrent deletes of a shuffled partition.
        let mut all_keys: Vec<i64> = (0..TOTAL_KEYS).collect();
        all_keys.shuffle(&mut rand::rng());
        let all_keys = Arc::new(all_keys);
        let barrier = Arc::new(Barrier::new(NUM_THREADS));
        let mut handles = vec![];
        for thread_index in 0..NUM_THREADS {
            let tree = tree.clone();
            let barrier = barrier.clone();
            let all_keys = all_keys.clone();
            handles.push(std::thread::spawn(move || {
                let chunk = TOTAL_KEYS as usize / NUM_THREADS;
                let start = thread_index * chunk;
                barrier.wait();
                for i in &all_keys[start..start + chunk] {
                    tree.remove(&key(*i)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..TOTAL_KEYS {
            assert_eq!(tree.get_value(&key(i)).unwrap(), None, "key {}", i);
        }
        assert!(tree.is_empty(), "tree must be empty after deleting all keys");
        assert!(tree.buffer_pool.check_all_unpinned());
    }

    #[test]
    fn test_pretty_formatter_smoke() {
        let (_temp_dir, tree) = build_tree(64, 4, 4);
        for i in 1..=11 {
            assert!(tree.insert(&key(i), rid(i)).unwrap());
        }
        let rendered = crate::utils::util::pretty_format_index_tree(&tree).unwrap();
        assert!(rendered.contains("B+ Tree Level No.1"));
        assert!(rendered.contains("leaf"));
    }
}
