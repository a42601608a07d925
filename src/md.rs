//! The standard fork-file backend.
//!
//! Every fork is a chain of segment files of `blocks_per_segment`
//! blocks each. Segment zero carries the bare relation path, later
//! segments append `.N`. A fork's size is derived from the segment
//! sizes: every segment before the last is full.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fault_injection::{annotate, fallible, maybe};
use parking_lot::Mutex;

use crate::backend::RelationFiles;
use crate::pending_ops::{PendingOps, SyncTag};
use crate::sys_io;
use crate::{
    BlockNumber, Config, Error, ForkNumber, ForkStorage, MAX_BLOCK_NUMBER,
    RelFileNodeBackend, Result, SegmentNumber,
};

/// What to do when a segment needed to reach a block does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extension {
    Fail,
    Create,
}

pub struct Md {
    root: PathBuf,
    block_size: usize,
    blocks_per_segment: BlockNumber,
    pending: Mutex<PendingOps>,
}

impl fmt::Debug for Md {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("Md")
            .field("root", &self.root)
            .field("block_size", &self.block_size)
            .field("blocks_per_segment", &self.blocks_per_segment)
            .field("pending_syncs", &pending.pending_sync_count())
            .field("pending_unlinks", &pending.pending_unlink_count())
            .finish()
    }
}

fn past_end(path: &Path, blkno: BlockNumber, what: &str) -> Error {
    Error::Io(annotate!(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "could not {} block {} in file {:?}: past end of file",
            what, blkno, path
        ),
    )))
}

fn empty_segment(path: &Path) -> io::Result<()> {
    let file = fallible!(fs::OpenOptions::new().write(true).open(path));
    fallible!(file.set_len(0));
    Ok(())
}

fn sync_path(path: &Path) -> io::Result<()> {
    let file =
        fallible!(fs::OpenOptions::new().read(true).write(true).open(path));
    fallible!(file.sync_all());
    Ok(())
}

impl Md {
    /// Fails with `Error::Unsupported` when the configured sizes are
    /// unusable.
    pub fn new(config: &Config) -> Result<Md> {
        config.validate()?;

        Ok(Md {
            root: config.path.clone(),
            block_size: config.block_size,
            blocks_per_segment: config.blocks_per_segment,
            pending: Mutex::default(),
        })
    }

    /// Segments written without `skip_fsync` and not yet synced by a
    /// checkpoint.
    pub fn pending_syncs(&self) -> usize {
        self.pending.lock().pending_sync_count()
    }

    /// Main forks emptied by `unlink` that wait for a checkpoint to be
    /// removed.
    pub fn pending_unlinks(&self) -> usize {
        self.pending.lock().pending_unlink_count()
    }

    fn segment_path(
        &self,
        rnode: &RelFileNodeBackend,
        fork: ForkNumber,
        segno: SegmentNumber,
    ) -> PathBuf {
        self.root.join(rnode.segment_path(fork, segno))
    }

    fn block_location(&self, blkno: BlockNumber) -> (SegmentNumber, u64) {
        let segno = blkno / self.blocks_per_segment;
        let offset = u64::from(blkno % self.blocks_per_segment)
            * self.block_size as u64;
        (segno, offset)
    }

    fn check_buffer(&self, len: usize) -> Result<()> {
        if len != self.block_size {
            return Err(Error::Io(annotate!(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "buffer of {} bytes does not match the block size of {}",
                    len, self.block_size
                ),
            ))));
        }
        Ok(())
    }

    fn register_dirty(
        &self,
        rnode: RelFileNodeBackend,
        fork: ForkNumber,
        segno: SegmentNumber,
    ) {
        if rnode.is_temp() {
            return;
        }
        self.pending.lock().remember_sync(SyncTag { rnode, fork, segno });
    }

    /// Opens the segments of `fork` up to and including `segno`.
    /// A missing segment zero is `Error::NotFound`; a missing later
    /// segment yields `None` unless `behavior` allows creating it.
    fn open_segment<'a>(
        &self,
        files: &'a mut RelationFiles,
        fork: ForkNumber,
        segno: SegmentNumber,
        behavior: Extension,
    ) -> Result<Option<&'a fs::File>> {
        let rnode = *files.rnode();
        let segments = files.segments_mut(fork);

        while segments.len() <= segno as usize {
            let next = segments.len() as SegmentNumber;
            let path = self.segment_path(&rnode, fork, next);

            let mut options = fs::OpenOptions::new();
            options.read(true).write(true);
            if behavior == Extension::Create && next == segno && next > 0 {
                options.create(true);
            }

            match maybe!(options.open(&path)) {
                Ok(file) => {
                    log::trace!("opened {:?}", path);
                    segments.push(file);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if next == 0 {
                        return Err(Error::NotFound(format!(
                            "could not open {} fork of {} at {:?}",
                            fork, rnode, path
                        )));
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Some(&segments[segno as usize]))
    }
}

impl ForkStorage for Md {
    fn init(&self) -> Result<()> {
        maybe!(fs::create_dir_all(&self.root))?;
        log::debug!("md storage initialized at {:?}", self.root);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let pending = self.pending.lock();
        log::debug!(
            "md storage shutting down with {} unsynced segments and {} \
             unlinks waiting for a checkpoint",
            pending.pending_sync_count(),
            pending.pending_unlink_count()
        );
        Ok(())
    }

    fn create(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        is_redo: bool,
    ) -> Result<bool> {
        if is_redo && files.is_open(fork) {
            return Ok(false);
        }

        let rnode = *files.rnode();
        let path = self.segment_path(&rnode, fork, 0);

        if let Some(parent) = path.parent() {
            maybe!(fs::create_dir_all(parent))?;
        }

        let mut options = fs::OpenOptions::new();
        options.read(true).write(true).create_new(true);

        let (file, created) = match maybe!(options.open(&path)) {
            Ok(file) => (file, true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !is_redo {
                    return Err(Error::AlreadyExists(format!(
                        "{} fork of {} at {:?}",
                        fork, rnode, path
                    )));
                }
                let file = maybe!(
                    fs::OpenOptions::new().read(true).write(true).open(&path)
                )?;
                (file, false)
            }
            Err(e) => return Err(e.into()),
        };

        let segments = files.segments_mut(fork);
        segments.clear();
        segments.push(file);

        log::debug!("created {} fork of {} (new: {})", fork, rnode, created);
        Ok(created)
    }

    fn exists(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
    ) -> Result<bool> {
        // another process may have unlinked the fork since we opened it
        files.close(fork);

        match self.open_segment(files, fork, 0, Extension::Fail) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn unlink(
        &self,
        rnode: &RelFileNodeBackend,
        fork: ForkNumber,
        is_redo: bool,
    ) -> Result<()> {
        self.pending.lock().forget_fork(rnode, fork);

        let path = self.segment_path(rnode, fork, 0);
        let defer = fork == ForkNumber::Main && !rnode.is_temp() && !is_redo;

        let first = if defer {
            empty_segment(&path)
        } else {
            maybe!(fs::remove_file(&path))
        };

        let mut ret = match first {
            Ok(()) => {
                if defer {
                    self.pending.lock().register_unlink(*rnode);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!(
                    "could not remove {} fork of {} at {:?}",
                    fork, rnode, path
                )))
            }
            Err(e) => Err(e.into()),
        };

        // stray later segments go even when segment zero is missing
        for segno in 1_u32.. {
            let path = self.segment_path(rnode, fork, segno);
            match maybe!(fs::remove_file(&path)) {
                Ok(()) => log::trace!("removed {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => {
                    log::warn!("could not remove {:?}: {}", path, e);
                    let replace = match &ret {
                        Ok(()) => true,
                        Err(first) => first.is_not_found(),
                    };
                    if replace {
                        ret = Err(e.into());
                    }
                    break;
                }
            }
        }

        ret
    }

    fn extend(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        self.check_buffer(buf.len())?;

        let rnode = *files.rnode();

        if blkno == MAX_BLOCK_NUMBER {
            return Err(Error::Io(annotate!(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot extend {} fork of {} beyond {} blocks",
                    fork, rnode, MAX_BLOCK_NUMBER
                ),
            ))));
        }

        let nblocks = self.nblocks(files, fork)?;
        if blkno > nblocks {
            return Err(Error::Io(annotate!(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot extend {} fork of {} to block {}: \
                     it ends at block {}",
                    fork, rnode, blkno, nblocks
                ),
            ))));
        }

        let (segno, offset) = self.block_location(blkno);
        let path = self.segment_path(&rnode, fork, segno);
        let Some(file) =
            self.open_segment(files, fork, segno, Extension::Create)?
        else {
            return Err(past_end(&path, blkno, "extend to"));
        };

        sys_io::write_all_at(file, buf, offset)?;

        if !skip_fsync {
            self.register_dirty(rnode, fork, segno);
        }

        log::trace!("extended {} fork of {} with block {}", fork, rnode, blkno);
        Ok(())
    }

    fn read(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &mut [u8],
    ) -> Result<()> {
        self.check_buffer(buf.len())?;

        let (segno, offset) = self.block_location(blkno);
        let path = self.segment_path(files.rnode(), fork, segno);
        let Some(file) = self.open_segment(files, fork, segno, Extension::Fail)?
        else {
            return Err(past_end(&path, blkno, "read"));
        };

        match sys_io::read_exact_at(file, buf, offset) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(past_end(&path, blkno, "read"))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        self.check_buffer(buf.len())?;

        let rnode = *files.rnode();
        let (segno, offset) = self.block_location(blkno);
        let path = self.segment_path(&rnode, fork, segno);
        let Some(file) = self.open_segment(files, fork, segno, Extension::Fail)?
        else {
            return Err(past_end(&path, blkno, "write"));
        };

        let len = maybe!(file.metadata())?.len();
        if offset + self.block_size as u64 > len {
            return Err(past_end(&path, blkno, "write"));
        }

        sys_io::write_all_at(file, buf, offset)?;

        if !skip_fsync {
            self.register_dirty(rnode, fork, segno);
        }

        Ok(())
    }

    fn writeback(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        let mut blkno = blkno;
        let mut remaining = nblocks;

        while remaining > 0 {
            let (segno, _offset) = self.block_location(blkno);
            let Some(file) =
                self.open_segment(files, fork, segno, Extension::Fail)?
            else {
                // nothing was ever written past the last segment
                break;
            };

            let file = maybe!(file.try_clone())?;
            let path = self.segment_path(files.rnode(), fork, segno);
            rayon::spawn(move || {
                if let Err(e) = file.sync_data() {
                    log::debug!("writeback of {:?} failed: {}", path, e);
                }
            });

            let in_segment = (self.blocks_per_segment
                - blkno % self.blocks_per_segment)
                .min(remaining);
            remaining -= in_segment;
            blkno = match blkno.checked_add(in_segment) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(())
    }

    fn nblocks(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
    ) -> Result<BlockNumber> {
        let blocks_per_segment = u64::from(self.blocks_per_segment);
        let mut segno: SegmentNumber = 0;

        loop {
            let Some(file) =
                self.open_segment(files, fork, segno, Extension::Fail)?
            else {
                // the previous segment was full and nothing follows it
                break;
            };

            let blocks = maybe!(file.metadata())?.len() / self.block_size as u64;

            if blocks > blocks_per_segment {
                return Err(Error::Io(annotate!(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "segment {} of {} fork of {} holds {} blocks, \
                         more than the segment size of {}",
                        segno,
                        fork,
                        files.rnode(),
                        blocks,
                        blocks_per_segment
                    ),
                ))));
            }

            if blocks < blocks_per_segment {
                let total = u64::from(segno) * blocks_per_segment + blocks;
                return to_block_number(total);
            }

            segno += 1;
        }

        to_block_number(u64::from(segno) * blocks_per_segment)
    }

    fn truncate(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        nblocks: BlockNumber,
    ) -> Result<bool> {
        let current = self.nblocks(files, fork)?;
        let rnode = *files.rnode();

        if nblocks > current {
            return Err(Error::Io(annotate!(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "could not truncate {} fork of {} to {} blocks: \
                     it's only {} blocks now",
                    fork, rnode, nblocks, current
                ),
            ))));
        }

        if nblocks == current {
            return Ok(false);
        }

        let blocks_per_segment = u64::from(self.blocks_per_segment);
        let segment_bytes = blocks_per_segment * self.block_size as u64;
        let target = u64::from(nblocks);

        let segments = files.segments_mut(fork);
        let mut keep_open = segments.len();
        let mut touched = vec![];

        for (segno, file) in segments.iter().enumerate().rev() {
            let segment_start = segno as u64 * blocks_per_segment;

            if segno > 0 && segment_start >= target {
                // emptied but left in place; other processes may still
                // have it open
                maybe!(file.set_len(0))?;
                keep_open = segno;
                touched.push(segno as SegmentNumber);
            } else {
                let len = ((target - segment_start) * self.block_size as u64)
                    .min(segment_bytes);
                maybe!(file.set_len(len))?;
                touched.push(segno as SegmentNumber);
                break;
            }
        }

        segments.truncate(keep_open);

        for segno in touched {
            self.register_dirty(rnode, fork, segno);
        }

        log::debug!(
            "truncated {} fork of {} from {} to {} blocks",
            fork,
            rnode,
            current,
            nblocks
        );
        Ok(true)
    }

    fn immedsync(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
    ) -> Result<()> {
        // opens every segment
        self.nblocks(files, fork)?;

        for file in files.segments(fork) {
            maybe!(file.sync_all())?;
        }

        Ok(())
    }

    fn pre_checkpoint(&self) -> Result<()> {
        let cycle = self.pending.lock().advance_cycle();
        log::debug!("md checkpoint cycle {} started", cycle);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let tags = self.pending.lock().take_sync_requests();
        log::debug!("md sync of {} segments", tags.len());

        let mut tags = tags.into_iter();
        while let Some(tag) = tags.next() {
            let path = self.segment_path(&tag.rnode, tag.fork, tag.segno);
            match sync_path(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::trace!("skipping sync of removed file {:?}", path);
                }
                Err(e) => {
                    self.pending
                        .lock()
                        .requeue_sync_requests(std::iter::once(tag).chain(tags));
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    fn post_checkpoint(&self) -> Result<()> {
        let ready = self.pending.lock().take_ready_unlinks();

        for unlink in ready {
            let path = self.segment_path(&unlink.rnode, ForkNumber::Main, 0);
            match maybe!(fs::remove_file(&path)) {
                Ok(()) => log::trace!("removed {:?} after checkpoint", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::warn!(
                        "file {:?} scheduled for removal was already gone",
                        path
                    );
                }
                Err(e) => {
                    log::warn!(
                        "could not remove {:?}, retrying after the next \
                         checkpoint: {}",
                        path,
                        e
                    );
                    self.pending.lock().requeue_unlink(unlink);
                }
            }
        }

        Ok(())
    }
}

fn to_block_number(total: u64) -> Result<BlockNumber> {
    BlockNumber::try_from(total).map_err(|_| {
        Error::Io(annotate!(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("fork of {} blocks exceeds the block number space", total),
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RelFileNode, DEFAULT_TABLESPACE_OID};

    const BLOCK: usize = 512;

    fn setup(blocks_per_segment: BlockNumber) -> (Config, Md, RelationFiles) {
        let config = Config::tmp()
            .unwrap()
            .block_size(BLOCK)
            .blocks_per_segment(blocks_per_segment);
        let md = Md::new(&config).unwrap();
        md.init().unwrap();
        let rnode = RelFileNodeBackend::permanent(RelFileNode::new(
            DEFAULT_TABLESPACE_OID,
            1,
            100,
        ));
        (config, md, RelationFiles::new(rnode))
    }

    #[test]
    fn extends_across_segments() {
        let (config, md, mut files) = setup(2);
        md.create(&mut files, ForkNumber::Main, false).unwrap();

        for blkno in 0..5_u32 {
            md.extend(&mut files, ForkNumber::Main, blkno, &[blkno as u8; BLOCK], false)
                .unwrap();
        }

        assert_eq!(md.nblocks(&mut files, ForkNumber::Main).unwrap(), 5);
        assert_eq!(files.segments(ForkNumber::Main).len(), 3);
        assert!(config.path.join("base/1/100.2").exists());
        assert_eq!(md.pending_syncs(), 3);

        let mut buf = [0; BLOCK];
        md.read(&mut files, ForkNumber::Main, 3, &mut buf).unwrap();
        assert_eq!(buf, [3; BLOCK]);
    }

    #[test]
    fn truncate_empties_trailing_segments() {
        let (config, md, mut files) = setup(2);
        md.create(&mut files, ForkNumber::Main, false).unwrap();
        for blkno in 0..5_u32 {
            md.extend(&mut files, ForkNumber::Main, blkno, &[1; BLOCK], true)
                .unwrap();
        }

        assert!(md.truncate(&mut files, ForkNumber::Main, 2).unwrap());
        assert_eq!(files.segments(ForkNumber::Main).len(), 1);
        // already that short
        assert!(!md.truncate(&mut files, ForkNumber::Main, 2).unwrap());
        assert_eq!(
            fs::metadata(config.path.join("base/1/100.1")).unwrap().len(),
            0
        );

        let mut fresh = RelationFiles::new(*files.rnode());
        assert_eq!(md.nblocks(&mut fresh, ForkNumber::Main).unwrap(), 2);

        // growing back reuses the emptied segment
        md.extend(&mut files, ForkNumber::Main, 2, &[2; BLOCK], true).unwrap();
        assert_eq!(md.nblocks(&mut files, ForkNumber::Main).unwrap(), 3);
    }

    #[test]
    fn buffer_size_is_checked() {
        let (_config, md, mut files) = setup(4);
        md.create(&mut files, ForkNumber::Main, false).unwrap();
        let err = md
            .extend(&mut files, ForkNumber::Main, 0, &[0; 8], false)
            .unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn unusable_sizes_are_refused() {
        let config = Config::tmp().unwrap().block_size(BLOCK);
        let err = Md::new(&config.clone().blocks_per_segment(0)).unwrap_err();
        assert!(err.is_unsupported());
        assert!(Md::new(&config.block_size(16)).unwrap_err().is_unsupported());
    }

    #[test]
    fn unlinking_a_missing_fork_is_not_found() {
        let (_config, md, files) = setup(2);
        let rnode = *files.rnode();

        for fork in ForkNumber::ALL {
            assert!(md.unlink(&rnode, fork, false).unwrap_err().is_not_found());
            assert!(md.unlink(&rnode, fork, true).unwrap_err().is_not_found());
        }
        assert_eq!(md.pending_unlinks(), 0);
    }
}
