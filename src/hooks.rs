//! Hook registration for extensions that select backends or watch file
//! activity. Every hook starts out unset, meaning the built-in
//! behaviour, and may be assigned once.

use std::fmt;
use std::sync::Arc;

use crate::{
    Error, ForkStorage, RelFileNodeBackend, Result, SegmentStorage,
    StorageKind,
};

/// Passive observer of physical file events, for example a disk quota
/// extension tracking active relations. Each callback fires once after
/// the physical operation succeeded. Returned errors are logged and
/// otherwise ignored.
pub trait StorageObserver: Send + Sync {
    fn file_created(&self, _rnode: RelFileNodeBackend) -> Result<()> {
        Ok(())
    }

    fn file_extended(&self, _rnode: RelFileNodeBackend) -> Result<()> {
        Ok(())
    }

    fn file_truncated(&self, _rnode: RelFileNodeBackend) -> Result<()> {
        Ok(())
    }

    fn file_unlinked(&self, _rnode: RelFileNodeBackend) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileEvent {
    Created,
    Extended,
    Truncated,
    Unlinked,
}

type KindSelector = dyn Fn(&RelFileNodeBackend) -> StorageKind + Send + Sync;

/// The registry passed to the storage manager through its `Config`.
///
/// ```
/// use std::sync::Arc;
///
/// use smgr::{Hooks, StorageKind, StorageObserver};
///
/// struct Quiet;
/// impl StorageObserver for Quiet {}
///
/// let hooks = Hooks::new()
///     .storage_kind(|rnode| {
///         if rnode.node.rel_node >= 50_000 {
///             StorageKind::AoRows
///         } else {
///             StorageKind::Heap
///         }
///     })?
///     .observer(Arc::new(Quiet))?;
/// assert!(hooks.observer(Arc::new(Quiet)).is_err());
/// # Ok::<(), smgr::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct Hooks {
    storage_kind: Option<Arc<KindSelector>>,
    fork_storage: Option<Arc<dyn ForkStorage>>,
    segment_storage: Option<Arc<dyn SegmentStorage>>,
    observer: Option<Arc<dyn StorageObserver>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("storage_kind", &self.storage_kind.is_some())
            .field("fork_storage", &self.fork_storage.is_some())
            .field("segment_storage", &self.segment_storage.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

fn assign_once<T>(slot: &mut Option<T>, value: T, name: &str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::InvalidState(format!(
            "the {} hook has already been assigned",
            name
        )));
    }
    *slot = Some(value);
    Ok(())
}

impl Hooks {
    pub fn new() -> Hooks {
        Hooks::default()
    }

    /// Decides the storage kind of identifiers opened without an
    /// explicit kind. Without it every such handle is `Heap`.
    pub fn storage_kind<F>(mut self, selector: F) -> Result<Hooks>
    where
        F: Fn(&RelFileNodeBackend) -> StorageKind + Send + Sync + 'static,
    {
        assign_once(&mut self.storage_kind, Arc::new(selector), "storage kind")?;
        Ok(self)
    }

    /// Replaces the standard fork-file backend.
    pub fn fork_storage(mut self, storage: Arc<dyn ForkStorage>) -> Result<Hooks> {
        assign_once(&mut self.fork_storage, storage, "fork storage")?;
        Ok(self)
    }

    /// Replaces the standard append-optimized segment backend.
    pub fn segment_storage(
        mut self,
        storage: Arc<dyn SegmentStorage>,
    ) -> Result<Hooks> {
        assign_once(&mut self.segment_storage, storage, "segment storage")?;
        Ok(self)
    }

    pub fn observer(mut self, observer: Arc<dyn StorageObserver>) -> Result<Hooks> {
        assign_once(&mut self.observer, observer, "observer")?;
        Ok(self)
    }

    pub(crate) fn select_kind(&self, rnode: &RelFileNodeBackend) -> StorageKind {
        self.storage_kind.as_ref().map_or(StorageKind::Heap, |f| f(rnode))
    }

    pub(crate) fn fork_storage_override(&self) -> Option<Arc<dyn ForkStorage>> {
        self.fork_storage.clone()
    }

    pub(crate) fn segment_storage_override(&self) -> Option<Arc<dyn SegmentStorage>> {
        self.segment_storage.clone()
    }

    pub(crate) fn notify(&self, event: FileEvent, rnode: RelFileNodeBackend) {
        let Some(observer) = &self.observer else {
            return;
        };

        let res = match event {
            FileEvent::Created => observer.file_created(rnode),
            FileEvent::Extended => observer.file_extended(rnode),
            FileEvent::Truncated => observer.file_truncated(rnode),
            FileEvent::Unlinked => observer.file_unlinked(rnode),
        };

        if let Err(e) = res {
            log::warn!("storage observer failed on {:?} of {}: {}", event, rnode, e);
        }
    }
}
