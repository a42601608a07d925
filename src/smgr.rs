use std::fmt;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;

use crate::hooks::FileEvent;
use crate::relation::RelationState;
use crate::unlink::PendingDelete;
use crate::{
    BlockNumber, Config, Error, ForkNumber, ForkStorage, Oid, OwnerSlot,
    ProcessingMode, RelFileNode, RelFileNodeBackend, Result, SegmentStorage,
    SmgrRelation, StorageBackend, StorageKind,
};

/// Selects cached handles for `Smgr::close_matching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationPrefix {
    /// Every handle in a tablespace.
    Tablespace(Oid),
    /// Every handle of a database, in any tablespace.
    Database(Oid),
    /// Every backend scope of one relation.
    Relation(RelFileNode),
    Exact(RelFileNodeBackend),
}

impl RelationPrefix {
    pub fn matches(&self, rnode: &RelFileNodeBackend) -> bool {
        match self {
            RelationPrefix::Tablespace(spc) => rnode.node.spc_node == *spc,
            RelationPrefix::Database(db) => rnode.node.db_node == *db,
            RelationPrefix::Relation(node) => rnode.node == *node,
            RelationPrefix::Exact(exact) => rnode == exact,
        }
    }
}

/// A snapshot of the handle cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub cached_relations: usize,
    pub unowned_relations: usize,
    pub owner_slots: usize,
    pub open_files: usize,
    pub pending_deletes: usize,
}

#[derive(Default)]
pub(crate) struct Cache {
    relations: FnvHashMap<RelFileNodeBackend, Arc<SmgrRelation>>,
    unowned: FnvHashSet<RelFileNodeBackend>,
    owner_slots: FnvHashMap<OwnerSlot, Option<RelFileNodeBackend>>,
    next_slot: u64,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) fork_storage: Arc<dyn ForkStorage>,
    pub(crate) segment_storage: Arc<dyn SegmentStorage>,
    cache: Mutex<Cache>,
    mode: AtomicU8,
    pub(crate) checkpoint_mu: Mutex<()>,
    pub(crate) pending_deletes: Mutex<Vec<PendingDelete>>,
    _directory_lock: fs::File,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let cache = self.cache.get_mut();
        for rel in cache.relations.values() {
            let mut state = rel.state.lock();
            state.closed = true;
            state.owner = None;
            state.files.close_all();
        }
        cache.relations.clear();
        cache.unowned.clear();
        cache.owner_slots.clear();

        if let Err(e) = self.fork_storage.shutdown() {
            log::warn!("fork storage shutdown failed: {}", e);
        }

        log::info!("storage manager at {:?} shut down", self.config.path);
    }
}

/// The storage manager of one connection process: a cache of storage
/// handles plus the block-level operations that are dispatched to the
/// backend each handle was bound to.
///
/// Cloning is cheap and yields another reference to the same cache.
#[derive(Clone)]
pub struct Smgr {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Smgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Smgr")
            .field("path", &self.inner.config.path)
            .field("processing_mode", &self.processing_mode())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Smgr {
    pub(crate) fn new(
        config: Config,
        fork_storage: Arc<dyn ForkStorage>,
        segment_storage: Arc<dyn SegmentStorage>,
        directory_lock: fs::File,
    ) -> Smgr {
        let mode = AtomicU8::new(config.processing_mode.as_u8());
        Smgr {
            inner: Arc::new(Inner {
                config,
                fork_storage,
                segment_storage,
                cache: Mutex::default(),
                mode,
                checkpoint_mu: Mutex::new(()),
                pending_deletes: Mutex::default(),
                _directory_lock: directory_lock,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        ProcessingMode::from_u8(self.inner.mode.load(Ordering::Acquire))
    }

    pub fn set_processing_mode(&self, mode: ProcessingMode) {
        let old = ProcessingMode::from_u8(
            self.inner.mode.swap(mode.as_u8(), Ordering::AcqRel),
        );
        if old != mode {
            log::info!("processing mode changed from {:?} to {:?}", old, mode);
        }
    }

    pub(crate) fn notify(&self, event: FileEvent, rnode: RelFileNodeBackend) {
        self.inner.config.hooks.notify(event, rnode);
    }

    pub fn stats(&self) -> Stats {
        let cache = self.inner.cache.lock();
        Stats {
            cached_relations: cache.relations.len(),
            unowned_relations: cache.unowned.len(),
            owner_slots: cache.owner_slots.len(),
            open_files: cache
                .relations
                .values()
                .map(|rel| rel.open_file_count())
                .sum(),
            pending_deletes: self.inner.pending_deletes.lock().len(),
        }
    }

    fn backend_for(&self, kind: StorageKind) -> StorageBackend {
        if kind.is_append_optimized() {
            StorageBackend::Segment(self.inner.segment_storage.clone())
        } else {
            StorageBackend::Fork(self.inner.fork_storage.clone())
        }
    }

    fn insert(
        &self,
        rnode: RelFileNodeBackend,
        kind: StorageKind,
    ) -> Arc<SmgrRelation> {
        let backend = self.backend_for(kind);

        let mut guard = self.inner.cache.lock();
        let cache = &mut *guard;

        if let Some(rel) = cache.relations.get(&rnode) {
            return rel.clone();
        }

        let rel = Arc::new(SmgrRelation::new(rnode, kind, backend));
        cache.relations.insert(rnode, rel.clone());
        cache.unowned.insert(rnode);

        log::debug!("opened {} handle for {}", kind, rnode);
        rel
    }

    /// Returns the cached handle for `rnode`, creating an unowned one
    /// if none is cached. Does no physical I/O.
    pub fn open(&self, rnode: RelFileNodeBackend) -> Arc<SmgrRelation> {
        if let Some(rel) = self.lookup(&rnode) {
            return rel;
        }

        let kind = self.inner.config.hooks.select_kind(&rnode);
        self.insert(rnode, kind)
    }

    /// Like `open`, with the storage kind known to the caller. Fails if
    /// `rnode` is already cached with another kind.
    pub fn open_with_kind(
        &self,
        rnode: RelFileNodeBackend,
        kind: StorageKind,
    ) -> Result<Arc<SmgrRelation>> {
        let rel = self.insert(rnode, kind);
        if rel.kind() != kind {
            return Err(Error::InvalidState(format!(
                "{} is cached as {}, not {}",
                rnode,
                rel.kind(),
                kind
            )));
        }
        Ok(rel)
    }

    /// The cached handle for `rnode`, if any.
    pub fn lookup(
        &self,
        rnode: &RelFileNodeBackend,
    ) -> Option<Arc<SmgrRelation>> {
        self.inner.cache.lock().relations.get(rnode).cloned()
    }

    pub fn new_owner_slot(&self) -> OwnerSlot {
        let mut cache = self.inner.cache.lock();
        cache.next_slot += 1;
        let slot = OwnerSlot(cache.next_slot);
        cache.owner_slots.insert(slot, None);
        slot
    }

    /// The handle `slot` currently designates.
    pub fn owner(&self, slot: OwnerSlot) -> Option<Arc<SmgrRelation>> {
        let cache = self.inner.cache.lock();
        let rnode = cache.owner_slots.get(&slot).copied().flatten()?;
        cache.relations.get(&rnode).cloned()
    }

    /// Forgets `slot`. A handle it designated becomes unowned and is
    /// closed by the next end-of-transaction sweep.
    pub fn release_owner_slot(&self, slot: OwnerSlot) {
        let mut guard = self.inner.cache.lock();
        let cache = &mut *guard;

        let Some(Some(rnode)) = cache.owner_slots.remove(&slot) else {
            return;
        };

        if let Some(rel) = cache.relations.get(&rnode) {
            rel.state.lock().owner = None;
            cache.unowned.insert(rnode);
        }
    }

    /// Records `slot` as the owner of `rel`. If `rel` had another owner
    /// slot, that slot is cleared.
    pub fn set_owner(&self, slot: OwnerSlot, rel: &Arc<SmgrRelation>) -> Result<()> {
        let mut guard = self.inner.cache.lock();
        let cache = &mut *guard;
        let rnode = *rel.rnode();

        let Some(current) = cache.owner_slots.get(&slot).copied() else {
            return Err(Error::InvalidState(format!(
                "unknown owner slot {:?}",
                slot
            )));
        };

        let cached = cache
            .relations
            .get(&rnode)
            .is_some_and(|cached| Arc::ptr_eq(cached, rel));
        if !cached {
            return Err(Error::InvalidState(format!(
                "the handle for {} has been closed",
                rnode
            )));
        }

        match current {
            Some(other) if other != rnode => {
                return Err(Error::InvalidState(format!(
                    "owner slot {:?} already designates {}",
                    slot, other
                )));
            }
            Some(_) => return Ok(()),
            None => {}
        }

        let previous = rel.state.lock().owner.replace(slot);
        if let Some(previous) = previous {
            if let Some(entry) = cache.owner_slots.get_mut(&previous) {
                *entry = None;
            }
        }

        cache.owner_slots.insert(slot, Some(rnode));
        cache.unowned.remove(&rnode);
        Ok(())
    }

    /// Detaches `rel` from `slot` without closing it. Nothing happens if
    /// `slot` does not own `rel`.
    pub fn clear_owner(&self, slot: OwnerSlot, rel: &Arc<SmgrRelation>) {
        let mut guard = self.inner.cache.lock();
        let cache = &mut *guard;
        let rnode = *rel.rnode();

        if cache.owner_slots.get(&slot) != Some(&Some(rnode)) {
            return;
        }

        cache.owner_slots.insert(slot, None);
        rel.state.lock().owner = None;
        cache.unowned.insert(rnode);
    }

    fn close_locked(&self, cache: &mut Cache, rel: &Arc<SmgrRelation>) {
        let mut state = rel.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        let open_files = state.files.open_file_count();
        if let StorageBackend::Fork(storage) = rel.backend() {
            for fork in ForkNumber::ALL {
                storage.close(&mut state.files, fork);
            }
        }
        state.files.close_all();
        state.invalidate();

        if let Some(slot) = state.owner.take() {
            if let Some(entry) = cache.owner_slots.get_mut(&slot) {
                *entry = None;
            }
        }
        drop(state);

        let rnode = *rel.rnode();
        let cached = cache
            .relations
            .get(&rnode)
            .is_some_and(|cached| Arc::ptr_eq(cached, rel));
        if cached {
            cache.relations.remove(&rnode);
            cache.unowned.remove(&rnode);
        }

        log::debug!("closed handle for {} ({} open files)", rnode, open_files);
    }

    /// Releases the files of `rel` and drops it from the cache. Closing
    /// an already closed handle does nothing.
    pub fn close(&self, rel: &Arc<SmgrRelation>) {
        let mut cache = self.inner.cache.lock();
        self.close_locked(&mut cache, rel);
    }

    pub fn close_all(&self) {
        self.close_matching_with(|_| true);
    }

    pub fn close_node(&self, rnode: &RelFileNodeBackend) {
        self.close_matching(RelationPrefix::Exact(*rnode));
    }

    pub fn close_matching(&self, prefix: RelationPrefix) {
        self.close_matching_with(|rnode| prefix.matches(rnode));
    }

    fn close_matching_with<F>(&self, predicate: F)
    where
        F: Fn(&RelFileNodeBackend) -> bool,
    {
        let mut cache = self.inner.cache.lock();
        let victims: Vec<Arc<SmgrRelation>> = cache
            .relations
            .iter()
            .filter(|(rnode, _)| predicate(rnode))
            .map(|(_, rel)| rel.clone())
            .collect();

        for rel in &victims {
            self.close_locked(&mut cache, rel);
        }
    }

    /// Closes every handle that has no owner.
    pub(crate) fn close_unowned(&self) {
        let mut cache = self.inner.cache.lock();
        let victims: Vec<Arc<SmgrRelation>> = cache
            .unowned
            .iter()
            .filter_map(|rnode| cache.relations.get(rnode).cloned())
            .collect();

        for rel in &victims {
            self.close_locked(&mut cache, rel);
        }
    }

    /// Releases the open fork files of a cached handle for `rnode` and
    /// forgets its cached sizes, without removing it from the cache.
    pub(crate) fn release_files(&self, rnode: &RelFileNodeBackend) {
        let Some(rel) = self.lookup(rnode) else {
            return;
        };

        let mut state = rel.state.lock();
        if let StorageBackend::Fork(storage) = rel.backend() {
            for fork in ForkNumber::ALL {
                storage.close(&mut state.files, fork);
            }
        }
        state.invalidate();
    }

    /// Forgets the cached sizes and insertion target of `rel`. The next
    /// `nblocks` asks the backend again.
    pub fn invalidate(&self, rel: &SmgrRelation) {
        rel.state.lock().invalidate();
        log::trace!("invalidated cached sizes of {}", rel.rnode());
    }

    fn with_fork_storage<T, F>(
        &self,
        rel: &SmgrRelation,
        what: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&dyn ForkStorage, &mut RelationState) -> Result<T>,
    {
        let StorageBackend::Fork(storage) = rel.backend() else {
            return Err(Error::Unsupported(format!(
                "{} on {} relation {}",
                what,
                rel.kind(),
                rel.rnode()
            )));
        };

        let mut state = rel.state.lock();
        if state.closed {
            return Err(Error::InvalidState(format!(
                "{} on closed handle for {}",
                what,
                rel.rnode()
            )));
        }

        f(storage.as_ref(), &mut state)
    }

    pub fn exists(&self, rel: &SmgrRelation, fork: ForkNumber) -> Result<bool> {
        self.with_fork_storage(rel, "exists", |storage, state| {
            storage.exists(&mut state.files, fork)
        })
    }

    /// Creates `fork`. With `is_redo`, or outside of normal processing,
    /// an existing fork is accepted.
    pub fn create(
        &self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        is_redo: bool,
    ) -> Result<()> {
        let is_redo = is_redo || self.processing_mode().is_redo();

        let created = self.with_fork_storage(rel, "create", |storage, state| {
            let created = storage.create(&mut state.files, fork, is_redo)?;
            state.nblocks[fork.index()] = if created { Some(0) } else { None };
            Ok(created)
        })?;

        if created {
            self.notify(FileEvent::Created, *rel.rnode());
        }
        Ok(())
    }

    /// Adds block `blkno` to `fork`. The block may not lie past the
    /// current end of the fork.
    pub fn extend(
        &self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        self.with_fork_storage(rel, "extend", |storage, state| {
            storage.extend(&mut state.files, fork, blkno, buf, skip_fsync)?;

            // an unknown size stays unknown: blkno may have overwritten
            // a block below the end
            let cached = &mut state.nblocks[fork.index()];
            *cached = cached.map(|nblocks| nblocks.max(blkno.saturating_add(1)));
            Ok(())
        })?;

        self.notify(FileEvent::Extended, *rel.rnode());
        Ok(())
    }

    pub fn read(
        &self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &mut [u8],
    ) -> Result<()> {
        self.with_fork_storage(rel, "read", |storage, state| {
            storage.read(&mut state.files, fork, blkno, buf)
        })
    }

    pub fn write(
        &self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        self.with_fork_storage(rel, "write", |storage, state| {
            storage.write(&mut state.files, fork, blkno, buf, skip_fsync)
        })
    }

    /// Starts flushing a range of blocks without waiting for it.
    pub fn writeback(
        &self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        self.with_fork_storage(rel, "writeback", |storage, state| {
            match storage.writeback(&mut state.files, fork, blkno, nblocks) {
                Err(e) if e.is_unsupported() => Ok(()),
                other => other,
            }
        })
    }

    /// Hints that `blkno` will be read soon. Never fails.
    pub fn prefetch(&self, rel: &SmgrRelation, fork: ForkNumber, blkno: BlockNumber) {
        let res = self.with_fork_storage(rel, "prefetch", |storage, state| {
            storage.prefetch(&mut state.files, fork, blkno)
        });

        match res {
            Ok(()) => {}
            Err(e) if e.is_unsupported() => {}
            Err(e) => log::trace!(
                "prefetch of block {} of {} fork of {} failed: {}",
                blkno,
                fork,
                rel.rnode(),
                e
            ),
        }
    }

    /// The size of `fork` in blocks, served from the handle when known.
    pub fn nblocks(
        &self,
        rel: &SmgrRelation,
        fork: ForkNumber,
    ) -> Result<BlockNumber> {
        self.with_fork_storage(rel, "nblocks", |storage, state| {
            if let Some(nblocks) = state.nblocks[fork.index()] {
                return Ok(nblocks);
            }

            let nblocks = storage.nblocks(&mut state.files, fork)?;
            state.nblocks[fork.index()] = Some(nblocks);
            Ok(nblocks)
        })
    }

    /// Cuts `fork` down to `nblocks` blocks. Truncating to the current
    /// size touches nothing and notifies nobody.
    pub fn truncate(
        &self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        let changed = self.with_fork_storage(rel, "truncate", |storage, state| {
            state.nblocks[fork.index()] = None;

            let changed = storage.truncate(&mut state.files, fork, nblocks)?;

            state.nblocks[fork.index()] = Some(nblocks);
            if changed {
                state.target_block = None;
            }
            Ok(changed)
        })?;

        if changed {
            self.notify(FileEvent::Truncated, *rel.rnode());
        }
        Ok(())
    }

    /// Makes `fork` durable immediately instead of at the next
    /// checkpoint.
    pub fn immedsync(&self, rel: &SmgrRelation, fork: ForkNumber) -> Result<()> {
        self.with_fork_storage(rel, "immedsync", |storage, state| {
            storage.immedsync(&mut state.files, fork)
        })
    }
}
