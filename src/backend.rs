//! The operation sets a storage backend implements.
//!
//! Fork-file backends implement [`ForkStorage`] and are addressed by
//! fork and block number. Append-optimized backends implement the
//! narrower [`SegmentStorage`] and are addressed by segment number and
//! byte offset. A handle is bound to exactly one of the two through
//! [`StorageBackend`].
//!
//! Backends report problems as errors. The exception is `unlink`,
//! whose errors the storage manager downgrades to warnings because it
//! runs during post-commit cleanup, and `prefetch`/`writeback`, which
//! a backend may leave unimplemented.

use std::fmt;
use std::fs;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    BlockNumber, Error, ForkNumber, N_FORKS, RelFileNodeBackend, Result,
    SegmentNumber,
};

/// Open files of every fork of one relation. Slot `i` of a fork holds
/// segment `i`; segments are opened in order, so the vector always
/// covers a prefix of the fork's segments. An empty vector means the
/// fork has not been opened.
pub struct RelationFiles {
    rnode: RelFileNodeBackend,
    forks: [Vec<fs::File>; N_FORKS],
}

impl fmt::Debug for RelationFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open: Vec<usize> = self.forks.iter().map(Vec::len).collect();
        f.debug_struct("RelationFiles")
            .field("rnode", &self.rnode)
            .field("open_segments", &open)
            .finish()
    }
}

impl RelationFiles {
    pub fn new(rnode: RelFileNodeBackend) -> RelationFiles {
        RelationFiles { rnode, forks: Default::default() }
    }

    pub const fn rnode(&self) -> &RelFileNodeBackend {
        &self.rnode
    }

    pub fn is_open(&self, fork: ForkNumber) -> bool {
        !self.forks[fork.index()].is_empty()
    }

    pub fn segments(&self, fork: ForkNumber) -> &[fs::File] {
        &self.forks[fork.index()]
    }

    pub fn segments_mut(&mut self, fork: ForkNumber) -> &mut Vec<fs::File> {
        &mut self.forks[fork.index()]
    }

    /// Drops every open segment of `fork`, returning how many were open.
    pub fn close(&mut self, fork: ForkNumber) -> usize {
        let segments = &mut self.forks[fork.index()];
        let n = segments.len();
        segments.clear();
        n
    }

    pub fn close_all(&mut self) -> usize {
        ForkNumber::ALL.into_iter().map(|fork| self.close(fork)).sum()
    }

    pub fn open_file_count(&self) -> usize {
        self.forks.iter().map(Vec::len).sum()
    }
}

/// The contract of a fork-file backend.
///
/// Every method that touches a particular relation receives that
/// relation's [`RelationFiles`], which live in the cached handle so that
/// open files are released when the handle is closed.
pub trait ForkStorage: Send + Sync {
    /// Called once when the storage manager starts.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Called once when the storage manager shuts down.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Releases the open files of `fork` without any physical effect.
    fn close(&self, files: &mut RelationFiles, fork: ForkNumber) {
        files.close(fork);
    }

    /// Creates the first segment of `fork`. Returns `true` if a new
    /// container was made and `false` if `is_redo` allowed an existing
    /// one to be reused. Outside of redo an existing container is
    /// `Error::AlreadyExists`.
    fn create(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        is_redo: bool,
    ) -> Result<bool>;

    fn exists(&self, files: &mut RelationFiles, fork: ForkNumber)
    -> Result<bool>;

    /// Removes every segment of `fork`. A missing container is
    /// `Error::NotFound` whatever the processing mode; the caller decides
    /// whether that matters.
    fn unlink(
        &self,
        rnode: &RelFileNodeBackend,
        fork: ForkNumber,
        is_redo: bool,
    ) -> Result<()>;

    /// Writes `buf` as block `blkno`, which must not lie past the
    /// current end of the fork.
    fn extend(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> Result<()>;

    fn prefetch(
        &self,
        _files: &mut RelationFiles,
        _fork: ForkNumber,
        _blkno: BlockNumber,
    ) -> Result<()> {
        Err(Error::Unsupported("prefetch".into()))
    }

    fn read(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &mut [u8],
    ) -> Result<()>;

    fn write(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> Result<()>;

    /// Starts flushing `nblocks` blocks from `blkno` without waiting.
    fn writeback(
        &self,
        _files: &mut RelationFiles,
        _fork: ForkNumber,
        _blkno: BlockNumber,
        _nblocks: BlockNumber,
    ) -> Result<()> {
        Err(Error::Unsupported("writeback".into()))
    }

    fn nblocks(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
    ) -> Result<BlockNumber>;

    /// Cuts `fork` down to `nblocks` blocks. Returns `false` when it
    /// already had that size and nothing was touched.
    fn truncate(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        nblocks: BlockNumber,
    ) -> Result<bool>;

    /// Makes every segment of `fork` durable now.
    fn immedsync(&self, files: &mut RelationFiles, fork: ForkNumber)
    -> Result<()>;

    fn pre_checkpoint(&self) -> Result<()> {
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn post_checkpoint(&self) -> Result<()> {
        Ok(())
    }
}

/// Whether a segment file is opened for reading only or also for
/// writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    Read,
    ReadWrite,
}

/// An open append-optimized segment file, tied to the modification
/// count it was opened with. Once another open of the same segment
/// rewrites it, operations on this file fail until it is reopened.
#[derive(Debug)]
pub struct SegmentFile {
    rnode: RelFileNodeBackend,
    segno: SegmentNumber,
    mode: SegmentMode,
    modcount: u64,
    path: PathBuf,
    file: fs::File,
}

impl SegmentFile {
    pub fn new(
        rnode: RelFileNodeBackend,
        segno: SegmentNumber,
        mode: SegmentMode,
        modcount: u64,
        path: PathBuf,
        file: fs::File,
    ) -> SegmentFile {
        SegmentFile { rnode, segno, mode, modcount, path, file }
    }

    pub const fn rnode(&self) -> &RelFileNodeBackend {
        &self.rnode
    }

    pub const fn segno(&self) -> SegmentNumber {
        self.segno
    }

    pub const fn mode(&self) -> SegmentMode {
        self.mode
    }

    /// The modification count this file is valid for.
    pub const fn modcount(&self) -> u64 {
        self.modcount
    }

    pub fn set_modcount(&mut self, modcount: u64) {
        self.modcount = modcount;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &fs::File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut fs::File {
        &mut self.file
    }
}

/// The contract of an append-optimized segment backend.
pub trait SegmentStorage: Send + Sync {
    /// Creates segment `segno` with a modification count of zero.
    /// Returns `false` when `is_redo` found it already present.
    fn create(
        &self,
        rnode: &RelFileNodeBackend,
        segno: SegmentNumber,
        is_redo: bool,
    ) -> Result<bool>;

    /// Opens segment `segno`, which must currently carry `modcount`.
    fn open(
        &self,
        rnode: &RelFileNodeBackend,
        segno: SegmentNumber,
        mode: SegmentMode,
        modcount: u64,
    ) -> Result<SegmentFile>;

    /// The physical offset of the file cursor.
    fn position(&self, file: &mut SegmentFile) -> Result<u64>;

    fn seek(&self, file: &mut SegmentFile, pos: SeekFrom) -> Result<u64>;

    fn read(&self, file: &mut SegmentFile, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, file: &mut SegmentFile, buf: &[u8]) -> Result<usize>;

    fn sync(&self, file: &mut SegmentFile) -> Result<()>;

    /// Cuts the segment to `len` bytes and bumps its modification count.
    fn truncate(&self, file: &mut SegmentFile, len: u64) -> Result<()>;

    fn close(&self, file: SegmentFile) -> Result<()>;

    /// Removes every segment of the object. An object without segment
    /// zero is `Error::NotFound`, even during redo.
    fn unlink(&self, rnode: &RelFileNodeBackend, is_redo: bool) -> Result<()>;
}

/// The backend servicing one handle, fixed when the handle is created.
#[derive(Clone)]
pub enum StorageBackend {
    Fork(Arc<dyn ForkStorage>),
    Segment(Arc<dyn SegmentStorage>),
}

impl fmt::Debug for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Fork(_) => f.write_str("StorageBackend::Fork"),
            StorageBackend::Segment(_) => {
                f.write_str("StorageBackend::Segment")
            }
        }
    }
}
