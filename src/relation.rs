use std::fmt;

use parking_lot::Mutex;

use crate::backend::RelationFiles;
use crate::{
    BlockNumber, ForkNumber, N_FORKS, RelFileNodeBackend, StorageBackend,
    StorageKind,
};

/// An opaque owner slot. It stands in for the place an external owner,
/// typically a relation descriptor, keeps its handle reference; the
/// cache clears the slot when the handle goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerSlot(pub(crate) u64);

pub(crate) struct RelationState {
    pub owner: Option<OwnerSlot>,
    pub closed: bool,
    pub target_block: Option<BlockNumber>,
    pub nblocks: [Option<BlockNumber>; N_FORKS],
    pub files: RelationFiles,
}

impl RelationState {
    /// Forgets every cached size and the insertion target.
    pub fn invalidate(&mut self) {
        self.target_block = None;
        self.nblocks = [None; N_FORKS];
    }
}

/// A cached storage handle. Handles are shared as `Arc<SmgrRelation>`
/// and stay usable for bookkeeping after being closed, but every I/O
/// through a closed handle fails.
pub struct SmgrRelation {
    rnode: RelFileNodeBackend,
    kind: StorageKind,
    backend: StorageBackend,
    pub(crate) state: Mutex<RelationState>,
}

impl fmt::Debug for SmgrRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SmgrRelation")
            .field("rnode", &self.rnode)
            .field("kind", &self.kind)
            .field("backend", &self.backend)
            .field("owner", &state.owner)
            .field("closed", &state.closed)
            .field("target_block", &state.target_block)
            .field("nblocks", &state.nblocks)
            .field("files", &state.files)
            .finish()
    }
}

impl SmgrRelation {
    pub(crate) fn new(
        rnode: RelFileNodeBackend,
        kind: StorageKind,
        backend: StorageBackend,
    ) -> SmgrRelation {
        SmgrRelation {
            rnode,
            kind,
            backend,
            state: Mutex::new(RelationState {
                owner: None,
                closed: false,
                target_block: None,
                nblocks: [None; N_FORKS],
                files: RelationFiles::new(rnode),
            }),
        }
    }

    pub const fn rnode(&self) -> &RelFileNodeBackend {
        &self.rnode
    }

    pub const fn kind(&self) -> StorageKind {
        self.kind
    }

    pub(crate) const fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    pub const fn is_temp(&self) -> bool {
        self.rnode.is_temp()
    }

    pub fn owner(&self) -> Option<OwnerSlot> {
        self.state.lock().owner
    }

    pub fn is_owned(&self) -> bool {
        self.owner().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// The advisory block at which the next insertion should be tried.
    pub fn target_block(&self) -> Option<BlockNumber> {
        self.state.lock().target_block
    }

    pub fn set_target_block(&self, target: Option<BlockNumber>) {
        self.state.lock().target_block = target;
    }

    /// The cached size of `fork`, or `None` when it is unknown. Use
    /// `Smgr::nblocks` for a size that is re-derived when unknown.
    pub fn cached_nblocks(&self, fork: ForkNumber) -> Option<BlockNumber> {
        self.state.lock().nblocks[fork.index()]
    }

    pub fn fsm_nblocks(&self) -> Option<BlockNumber> {
        self.cached_nblocks(ForkNumber::FreeSpaceMap)
    }

    pub fn vm_nblocks(&self) -> Option<BlockNumber> {
        self.cached_nblocks(ForkNumber::VisibilityMap)
    }

    pub fn open_file_count(&self) -> usize {
        self.state.lock().files.open_file_count()
    }
}
