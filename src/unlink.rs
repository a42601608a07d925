//! Unlinking, which never fails its caller, and deletions scheduled for
//! the end of a transaction.

use crate::hooks::FileEvent;
use crate::{
    Error, ForkNumber, RelFileNodeBackend, Smgr, SmgrRelation, StorageKind,
};

/// When a scheduled deletion takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAt {
    /// The object was dropped by the transaction.
    Commit,
    /// The object was created by the transaction.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactOutcome {
    Commit,
    Abort,
}

impl DeleteAt {
    const fn is_due(self, outcome: XactOutcome) -> bool {
        matches!(
            (self, outcome),
            (DeleteAt::Commit, XactOutcome::Commit)
                | (DeleteAt::Abort, XactOutcome::Abort)
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingDelete {
    rnode: RelFileNodeBackend,
    kind: StorageKind,
    at: DeleteAt,
}

/// Every unlink of one object that did not go through. `errors` pairs
/// each failed fork with its error; the fork is `None` for the segments
/// of an append-optimized object.
#[derive(Debug, Clone, PartialEq)]
pub struct UnlinkFailure {
    pub rnode: RelFileNodeBackend,
    pub errors: Vec<(Option<ForkNumber>, Error)>,
}

/// The outcome of an unlink request, with at most one failure per
/// object. Failures have already been logged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnlinkReport {
    unlinked: usize,
    failures: Vec<UnlinkFailure>,
}

impl UnlinkReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[UnlinkFailure] {
        &self.failures
    }

    /// How many forks or segment sets were actually removed. Containers
    /// that were already gone are not counted.
    pub const fn unlinked_count(&self) -> usize {
        self.unlinked
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Fork(ForkNumber),
    Segments,
}

impl Target {
    const fn fork(self) -> Option<ForkNumber> {
        match self {
            Target::Fork(fork) => Some(fork),
            Target::Segments => None,
        }
    }

    // fsm, vm and init forks need not exist
    fn is_optional(self) -> bool {
        matches!(self, Target::Fork(fork) if fork != ForkNumber::Main)
    }
}

enum Outcome {
    Removed,
    AlreadyGone,
    Failed(Error),
}

impl Smgr {
    fn unlink_target(
        &self,
        rnode: RelFileNodeBackend,
        target: Target,
        is_redo: bool,
    ) -> Outcome {
        let res = match target {
            Target::Fork(fork) => {
                self.inner.fork_storage.unlink(&rnode, fork, is_redo)
            }
            Target::Segments => {
                self.inner.segment_storage.unlink(&rnode, is_redo)
            }
        };

        match res {
            Ok(()) => Outcome::Removed,
            Err(e) if e.is_not_found() && (is_redo || target.is_optional()) => {
                log::trace!("{:?} of {} was already gone", target, rnode);
                Outcome::AlreadyGone
            }
            Err(e) => {
                log::warn!("could not unlink {:?} of {}: {}", target, rnode, e);
                Outcome::Failed(e)
            }
        }
    }

    /// Unlinks `targets` of one object, recording a single failure for
    /// it if any target failed. The observer hears about the object only
    /// when something was removed and nothing failed.
    fn unlink_object(
        &self,
        rnode: RelFileNodeBackend,
        targets: &[Target],
        is_redo: bool,
        report: &mut UnlinkReport,
    ) {
        let mut removed = 0;
        let mut errors = vec![];

        for target in targets {
            match self.unlink_target(rnode, *target, is_redo) {
                Outcome::Removed => removed += 1,
                Outcome::AlreadyGone => {}
                Outcome::Failed(error) => errors.push((target.fork(), error)),
            }
        }

        report.unlinked += removed;

        if !errors.is_empty() {
            report.failures.push(UnlinkFailure { rnode, errors });
        } else if removed > 0 {
            self.notify(FileEvent::Unlinked, rnode);
        }
    }

    /// Removes one fork, or for an append-optimized main fork every
    /// segment, of `rnode`. Failures are logged and reported, never
    /// returned as errors.
    pub fn unlink(
        &self,
        rnode: RelFileNodeBackend,
        fork: ForkNumber,
        is_redo: bool,
        kind: StorageKind,
    ) -> UnlinkReport {
        let is_redo = is_redo || self.processing_mode().is_redo();
        let target = if kind.is_append_optimized() && fork == ForkNumber::Main {
            Target::Segments
        } else {
            Target::Fork(fork)
        };

        let _checkpoint = self.inner.checkpoint_mu.lock();

        self.release_files(&rnode);

        let mut report = UnlinkReport::default();
        self.unlink_object(rnode, &[target], is_redo, &mut report);
        report
    }

    /// Removes every fork (or segment set) of every object in `objects`,
    /// continuing past failures.
    pub fn unlink_many(
        &self,
        objects: &[(RelFileNodeBackend, StorageKind)],
        is_redo: bool,
    ) -> UnlinkReport {
        let is_redo = is_redo || self.processing_mode().is_redo();
        let mut report = UnlinkReport::default();

        if objects.is_empty() {
            return report;
        }

        let _checkpoint = self.inner.checkpoint_mu.lock();

        for (rnode, _kind) in objects {
            self.release_files(rnode);
        }

        let every_fork = ForkNumber::ALL.map(Target::Fork);

        for (rnode, kind) in objects {
            let targets: &[Target] = if kind.is_append_optimized() {
                &[Target::Segments]
            } else {
                &every_fork
            };
            self.unlink_object(*rnode, targets, is_redo, &mut report);
        }

        log::debug!(
            "unlinked {} objects with {} failures",
            objects.len(),
            report.failures.len()
        );
        report
    }

    /// Removes the storage behind `rel`. The handle stays cached with its
    /// files released and its sizes unknown.
    pub fn unlink_relation(&self, rel: &SmgrRelation, is_redo: bool) -> UnlinkReport {
        self.unlink_many(&[(*rel.rnode(), rel.kind())], is_redo)
    }

    /// Schedules removal of `rnode` when the current transaction ends
    /// with the matching outcome.
    pub fn schedule_unlink(
        &self,
        rnode: RelFileNodeBackend,
        kind: StorageKind,
        at: DeleteAt,
    ) {
        log::debug!("scheduled unlink of {} at {:?}", rnode, at);
        self.inner.pending_deletes.lock().push(PendingDelete { rnode, kind, at });
    }

    /// Runs the deletions due for `outcome`, drops the others and closes
    /// every unowned handle.
    pub fn at_end_of_xact(&self, outcome: XactOutcome) -> UnlinkReport {
        let pending = std::mem::take(&mut *self.inner.pending_deletes.lock());

        let due: Vec<(RelFileNodeBackend, StorageKind)> = pending
            .iter()
            .filter(|pd| pd.at.is_due(outcome))
            .map(|pd| (pd.rnode, pd.kind))
            .collect();

        log::debug!(
            "end of transaction ({:?}): {} of {} scheduled deletions are due",
            outcome,
            due.len(),
            pending.len()
        );

        let report = self.unlink_many(&due, false);
        self.close_unowned();
        report
    }
}
