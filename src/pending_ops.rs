//! Bookkeeping behind the checkpoint hooks of the fork-file backend.
//!
//! Writes that did not ask to skip fsync register the segment they
//! touched; the checkpoint's `sync` step makes those segments durable.
//! Unlinking the main fork of a permanent relation only empties its
//! first segment and queues the removal. The file is removed by the
//! first `post_checkpoint` whose cycle began after the request, which
//! keeps the file number from being reused before the checkpoint has
//! made the deletion's log record redundant.

use fnv::FnvHashSet;

use crate::{ForkNumber, RelFileNodeBackend, SegmentNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SyncTag {
    pub rnode: RelFileNodeBackend,
    pub fork: ForkNumber,
    pub segno: SegmentNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingUnlink {
    pub rnode: RelFileNodeBackend,
    cycle: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PendingOps {
    sync: FnvHashSet<SyncTag>,
    unlinks: Vec<PendingUnlink>,
    checkpoint_cycle: u64,
}

impl PendingOps {
    pub fn remember_sync(&mut self, tag: SyncTag) {
        if self.sync.insert(tag) {
            log::trace!("registered {:?} for the next checkpoint sync", tag);
        }
    }

    /// Cancels sync requests for `fork`, which is about to disappear.
    pub fn forget_fork(&mut self, rnode: &RelFileNodeBackend, fork: ForkNumber) {
        self.sync.retain(|tag| !(tag.rnode == *rnode && tag.fork == fork));
    }

    pub fn register_unlink(&mut self, rnode: RelFileNodeBackend) {
        self.unlinks.push(PendingUnlink { rnode, cycle: self.checkpoint_cycle });
    }

    /// Starts a checkpoint cycle. Unlinks registered before this call
    /// become eligible at the end of the cycle.
    pub fn advance_cycle(&mut self) -> u64 {
        self.checkpoint_cycle += 1;
        self.checkpoint_cycle
    }

    pub fn take_sync_requests(&mut self) -> Vec<SyncTag> {
        let mut tags: Vec<SyncTag> = self.sync.drain().collect();
        tags.sort_by_key(|tag| (tag.rnode, tag.fork, tag.segno));
        tags
    }

    /// Puts back requests a failed sync did not get to.
    pub fn requeue_sync_requests<I: IntoIterator<Item = SyncTag>>(
        &mut self,
        tags: I,
    ) {
        self.sync.extend(tags);
    }

    pub fn take_ready_unlinks(&mut self) -> Vec<PendingUnlink> {
        let cycle = self.checkpoint_cycle;
        let (ready, waiting): (Vec<_>, Vec<_>) =
            self.unlinks.drain(..).partition(|pu| pu.cycle < cycle);
        self.unlinks = waiting;
        ready
    }

    pub fn requeue_unlink(&mut self, unlink: PendingUnlink) {
        self.unlinks.push(unlink);
    }

    pub fn pending_sync_count(&self) -> usize {
        self.sync.len()
    }

    pub fn pending_unlink_count(&self) -> usize {
        self.unlinks.len()
    }
}
