use std::io::SeekFrom;

use crate::hooks::FileEvent;
use crate::{
    Error, Result, SegmentFile, SegmentMode, SegmentNumber, SegmentStorage,
    Smgr, SmgrRelation, StorageBackend,
};

/// Segment-level access to an append-optimized handle, obtained from
/// `Smgr::segments`.
pub struct Segments<'a> {
    smgr: &'a Smgr,
    rel: &'a SmgrRelation,
    storage: &'a dyn SegmentStorage,
}

impl std::fmt::Debug for Segments<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segments").field("rel", self.rel).finish_non_exhaustive()
    }
}

impl Smgr {
    pub fn segments<'a>(&'a self, rel: &'a SmgrRelation) -> Result<Segments<'a>> {
        let StorageBackend::Segment(storage) = rel.backend() else {
            return Err(Error::Unsupported(format!(
                "segment access to {} relation {}",
                rel.kind(),
                rel.rnode()
            )));
        };

        Ok(Segments { smgr: self, rel, storage: storage.as_ref() })
    }
}

impl Segments<'_> {
    fn check_open(&self, what: &str) -> Result<()> {
        if self.rel.is_closed() {
            return Err(Error::InvalidState(format!(
                "{} on closed handle for {}",
                what,
                self.rel.rnode()
            )));
        }
        Ok(())
    }

    fn check_file(&self, file: &SegmentFile, what: &str) -> Result<()> {
        self.check_open(what)?;
        if file.rnode() != self.rel.rnode() {
            return Err(Error::InvalidState(format!(
                "{} through {} with a segment file of {}",
                what,
                self.rel.rnode(),
                file.rnode()
            )));
        }
        Ok(())
    }

    /// Creates segment `segno`; returns whether a new file was made.
    pub fn create(&self, segno: SegmentNumber, is_redo: bool) -> Result<bool> {
        self.check_open("segment create")?;
        let is_redo = is_redo || self.smgr.processing_mode().is_redo();

        let created = self.storage.create(self.rel.rnode(), segno, is_redo)?;
        if created {
            self.smgr.notify(FileEvent::Created, *self.rel.rnode());
        }
        Ok(created)
    }

    pub fn open(
        &self,
        segno: SegmentNumber,
        mode: SegmentMode,
        modcount: u64,
    ) -> Result<SegmentFile> {
        self.check_open("segment open")?;
        self.storage.open(self.rel.rnode(), segno, mode, modcount)
    }

    pub fn position(&self, file: &mut SegmentFile) -> Result<u64> {
        self.check_file(file, "segment position")?;
        self.storage.position(file)
    }

    pub fn seek(&self, file: &mut SegmentFile, pos: SeekFrom) -> Result<u64> {
        self.check_file(file, "segment seek")?;
        self.storage.seek(file, pos)
    }

    pub fn read(&self, file: &mut SegmentFile, buf: &mut [u8]) -> Result<usize> {
        self.check_file(file, "segment read")?;
        self.storage.read(file, buf)
    }

    pub fn write(&self, file: &mut SegmentFile, buf: &[u8]) -> Result<usize> {
        self.check_file(file, "segment write")?;
        let written = self.storage.write(file, buf)?;
        if written > 0 {
            self.smgr.notify(FileEvent::Extended, *self.rel.rnode());
        }
        Ok(written)
    }

    pub fn sync(&self, file: &mut SegmentFile) -> Result<()> {
        self.check_file(file, "segment sync")?;
        self.storage.sync(file)
    }

    /// Cuts the segment to `len` bytes. Other open files on the same
    /// segment go stale.
    pub fn truncate(&self, file: &mut SegmentFile, len: u64) -> Result<()> {
        self.check_file(file, "segment truncate")?;
        self.storage.truncate(file, len)?;
        self.smgr.notify(FileEvent::Truncated, *self.rel.rnode());
        Ok(())
    }

    pub fn close(&self, file: SegmentFile) -> Result<()> {
        self.storage.close(file)
    }
}
