use parking_lot::MutexGuard;

use crate::{Error, Result, Smgr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Begun,
    PreCheckpointed,
    Synced,
    Finished,
}

/// One checkpoint, driving the fork backend through `pre_checkpoint`,
/// `sync` and `post_checkpoint` in that order. Unlinks wait while a
/// cycle is alive, so calling `Smgr::unlink` from the thread holding
/// one deadlocks.
pub struct CheckpointCycle<'a> {
    smgr: &'a Smgr,
    phase: Phase,
    _unlinks_blocked: MutexGuard<'a, ()>,
}

impl Smgr {
    pub fn begin_checkpoint(&self) -> CheckpointCycle<'_> {
        let guard = self.inner.checkpoint_mu.lock();
        log::debug!("checkpoint cycle begins");
        CheckpointCycle { smgr: self, phase: Phase::Begun, _unlinks_blocked: guard }
    }

    /// Runs a whole checkpoint cycle.
    pub fn checkpoint(&self) -> Result<()> {
        let mut cycle = self.begin_checkpoint();
        cycle.pre_checkpoint()?;
        cycle.sync()?;
        cycle.post_checkpoint()
    }
}

impl CheckpointCycle<'_> {
    fn expect_phase(&self, expected: Phase, hook: &str) -> Result<()> {
        if self.phase != expected {
            return Err(Error::InvalidState(format!(
                "checkpoint hook {} called in phase {:?}, expected {:?}",
                hook, self.phase, expected
            )));
        }
        Ok(())
    }

    pub fn pre_checkpoint(&mut self) -> Result<()> {
        self.expect_phase(Phase::Begun, "pre_checkpoint")?;
        self.smgr.inner.fork_storage.pre_checkpoint()?;
        self.phase = Phase::PreCheckpointed;
        Ok(())
    }

    /// Makes every write registered since the last cycle durable. May
    /// be retried after a failure.
    pub fn sync(&mut self) -> Result<()> {
        self.expect_phase(Phase::PreCheckpointed, "sync")?;
        self.smgr.inner.fork_storage.sync()?;
        self.phase = Phase::Synced;
        Ok(())
    }

    pub fn post_checkpoint(&mut self) -> Result<()> {
        self.expect_phase(Phase::Synced, "post_checkpoint")?;
        self.smgr.inner.fork_storage.post_checkpoint()?;
        self.phase = Phase::Finished;
        log::debug!("checkpoint cycle finished");
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }
}

impl Drop for CheckpointCycle<'_> {
    fn drop(&mut self) {
        if self.phase != Phase::Finished {
            log::debug!("checkpoint cycle abandoned in phase {:?}", self.phase);
        }
    }
}
