//! `smgr` is the storage manager switch of a relational database: it
//! turns "read or write block N of fork F of relation R" into file
//! operations, while hiding which physical backend services R.
//!
//! Ordinary relations are stored as fork files split into fixed-size
//! segments. Append-optimized relations are stored as numbered segment
//! files guarded by modification counts. A process keeps one [`Smgr`],
//! which caches a handle per relation, tracks handle ownership, defers
//! file removal until after checkpoints and tells an optional
//! [`StorageObserver`] about file events.
//!
//! ```
//! use smgr::{Config, ForkNumber, RelFileNode, RelFileNodeBackend};
//!
//! let smgr = Config::tmp()?.block_size(1024).open()?;
//!
//! let rnode =
//!     RelFileNodeBackend::permanent(RelFileNode::new(1663, 1, 16384));
//! let rel = smgr.open(rnode);
//!
//! smgr.create(&rel, ForkNumber::Main, false)?;
//! smgr.extend(&rel, ForkNumber::Main, 0, &[7; 1024], false)?;
//! assert_eq!(smgr.nblocks(&rel, ForkNumber::Main)?, 1);
//!
//! smgr.checkpoint()?;
//! # Ok::<(), smgr::Error>(())
//! ```

mod ao;
mod backend;
mod checkpoint;
mod config;
mod hooks;
mod md;
mod pending_ops;
mod relation;
mod relfilenode;
mod result;
mod segments;
mod smgr;
mod sys_io;
mod unlink;

use std::path::Path;

pub use crate::ao::AoStorage;
pub use crate::backend::{
    ForkStorage, RelationFiles, SegmentFile, SegmentMode, SegmentStorage,
    StorageBackend,
};
pub use crate::checkpoint::CheckpointCycle;
pub use crate::config::{Config, ProcessingMode};
pub use crate::hooks::{Hooks, StorageObserver};
pub use crate::md::Md;
pub use crate::relation::{OwnerSlot, SmgrRelation};
pub use crate::relfilenode::{
    BackendId, BlockNumber, DEFAULT_TABLESPACE_OID, ForkNumber,
    GLOBAL_TABLESPACE_OID, MAX_BLOCK_NUMBER, N_FORKS, Oid, RelFileNode,
    RelFileNodeBackend, SegmentNumber, StorageKind,
};
pub use crate::result::{Error, Result};
pub use crate::segments::Segments;
pub use crate::smgr::{RelationPrefix, Smgr, Stats};
pub use crate::unlink::{DeleteAt, UnlinkFailure, UnlinkReport, XactOutcome};

/// Opens a storage manager with the default configuration over `path`.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Smgr> {
    Config::new().path(path).open()
}
