//! The standard append-optimized segment backend.
//!
//! Segment `N` of an object lives at the object's main fork path with a
//! `.N` suffix (none for segment zero). Next to each segment sits a
//! `.modcount` record holding the segment's modification count as eight
//! little-endian bytes followed by their crc32. Truncation bumps the
//! count, which invalidates every other open file on that segment.

use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fault_injection::{annotate, fallible, maybe};
use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::{
    Config, Error, ForkNumber, RelFileNodeBackend, Result, SegmentFile,
    SegmentMode, SegmentNumber, SegmentStorage,
};

const MODCOUNT_SUFFIX: &str = ".modcount";
const TMP_SUFFIX: &str = ".tmp";
const MODCOUNT_RECORD_LEN: usize = 12;

pub struct AoStorage {
    root: PathBuf,
    // last modification count seen for each segment path
    modcounts: Mutex<FnvHashMap<PathBuf, u64>>,
}

impl fmt::Debug for AoStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AoStorage")
            .field("root", &self.root)
            .field("tracked_segments", &self.modcounts.lock().len())
            .finish()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

fn encode_modcount(modcount: u64) -> [u8; MODCOUNT_RECORD_LEN] {
    let count_bytes = modcount.to_le_bytes();
    let crc = crc32fast::hash(&count_bytes);

    let mut record = [0; MODCOUNT_RECORD_LEN];
    record[..8].copy_from_slice(&count_bytes);
    record[8..].copy_from_slice(&crc.to_le_bytes());
    record
}

fn decode_modcount(path: &Path, record: &[u8]) -> io::Result<u64> {
    let corrupt = |why: &str| {
        annotate!(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("modification count record {:?} is corrupt: {}", path, why),
        ))
    };

    if record.len() != MODCOUNT_RECORD_LEN {
        return Err(corrupt("wrong length"));
    }

    let mut count_bytes = [0; 8];
    count_bytes.copy_from_slice(&record[..8]);
    let mut crc_bytes = [0; 4];
    crc_bytes.copy_from_slice(&record[8..]);

    if crc32fast::hash(&count_bytes) != u32::from_le_bytes(crc_bytes) {
        return Err(corrupt("crc mismatch"));
    }

    Ok(u64::from_le_bytes(count_bytes))
}

/// Reads the persisted count of the segment at `segment_path`. A
/// segment without a record has never been rewritten.
fn read_modcount(segment_path: &Path) -> io::Result<u64> {
    let record_path = with_suffix(segment_path, MODCOUNT_SUFFIX);
    match maybe!(fs::read(&record_path)) {
        Ok(record) => decode_modcount(&record_path, &record),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

fn write_modcount(segment_path: &Path, modcount: u64) -> io::Result<()> {
    let record_path = with_suffix(segment_path, MODCOUNT_SUFFIX);
    let tmp_path = with_suffix(&record_path, TMP_SUFFIX);

    let mut tmp_file = fallible!(
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
    );
    fallible!(tmp_file.write_all(&encode_modcount(modcount)));
    fallible!(tmp_file.sync_all());
    drop(tmp_file);

    fallible!(fs::rename(&tmp_path, &record_path));
    Ok(())
}

/// Whether directory entry `name` is a segment, modification count
/// record or leftover temporary file of the object whose segment zero
/// is called `stem`.
fn belongs_to(stem: &str, name: &str) -> bool {
    let Some(rest) = name.strip_prefix(stem) else {
        return false;
    };
    let rest = rest.strip_suffix(TMP_SUFFIX).unwrap_or(rest);
    let rest = rest.strip_suffix(MODCOUNT_SUFFIX).unwrap_or(rest);

    match rest.strip_prefix('.') {
        None => rest.is_empty(),
        Some(digits) => {
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        }
    }
}

impl AoStorage {
    pub fn new(config: &Config) -> AoStorage {
        AoStorage { root: config.path.clone(), modcounts: Mutex::default() }
    }

    fn segment_path(
        &self,
        rnode: &RelFileNodeBackend,
        segno: SegmentNumber,
    ) -> PathBuf {
        self.root.join(rnode.segment_path(ForkNumber::Main, segno))
    }

    fn current_modcount(&self, path: &Path) -> Result<u64> {
        if let Some(modcount) = self.modcounts.lock().get(path) {
            return Ok(*modcount);
        }

        let modcount = read_modcount(path)?;
        self.modcounts.lock().insert(path.to_path_buf(), modcount);
        Ok(modcount)
    }

    fn check_fresh(&self, file: &SegmentFile) -> Result<()> {
        let current = self.current_modcount(file.path())?;
        if current != file.modcount() {
            return Err(Error::InvalidState(format!(
                "segment {} of {} was rewritten (modification count {} is \
                 now {}) and must be reopened",
                file.segno(),
                file.rnode(),
                file.modcount(),
                current
            )));
        }
        Ok(())
    }

    fn check_writable(file: &SegmentFile, what: &str) -> Result<()> {
        if file.mode() == SegmentMode::Read {
            return Err(Error::InvalidState(format!(
                "cannot {} segment {} of {}: it was opened read-only",
                what,
                file.segno(),
                file.rnode()
            )));
        }
        Ok(())
    }
}

impl SegmentStorage for AoStorage {
    fn create(
        &self,
        rnode: &RelFileNodeBackend,
        segno: SegmentNumber,
        is_redo: bool,
    ) -> Result<bool> {
        let path = self.segment_path(rnode, segno);

        if let Some(parent) = path.parent() {
            maybe!(fs::create_dir_all(parent))?;
        }

        let open_res = maybe!(
            fs::OpenOptions::new().write(true).create_new(true).open(&path)
        );

        match open_res {
            Ok(_file) => {
                write_modcount(&path, 0)?;
                self.modcounts.lock().insert(path, 0);
                log::debug!("created segment {} of {}", segno, rnode);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if is_redo {
                    Ok(false)
                } else {
                    Err(Error::AlreadyExists(format!(
                        "segment {} of {} at {:?}",
                        segno, rnode, path
                    )))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn open(
        &self,
        rnode: &RelFileNodeBackend,
        segno: SegmentNumber,
        mode: SegmentMode,
        modcount: u64,
    ) -> Result<SegmentFile> {
        let path = self.segment_path(rnode, segno);

        let mut options = fs::OpenOptions::new();
        options.read(true).write(mode == SegmentMode::ReadWrite);

        let file = match maybe!(options.open(&path)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "segment {} of {} at {:?}",
                    segno, rnode, path
                )));
            }
            Err(e) => return Err(e.into()),
        };

        // another process may have rewritten the segment, so the
        // persisted record wins over anything remembered
        let current = read_modcount(&path)?;
        self.modcounts.lock().insert(path.clone(), current);

        if current != modcount {
            return Err(Error::InvalidState(format!(
                "segment {} of {} carries modification count {}, not {}",
                segno, rnode, current, modcount
            )));
        }

        log::trace!("opened segment {} of {} ({:?})", segno, rnode, mode);
        Ok(SegmentFile::new(*rnode, segno, mode, modcount, path, file))
    }

    fn position(&self, file: &mut SegmentFile) -> Result<u64> {
        self.check_fresh(file)?;
        Ok(maybe!(file.file_mut().stream_position())?)
    }

    fn seek(&self, file: &mut SegmentFile, pos: SeekFrom) -> Result<u64> {
        self.check_fresh(file)?;
        Ok(maybe!(file.file_mut().seek(pos))?)
    }

    fn read(&self, file: &mut SegmentFile, buf: &mut [u8]) -> Result<usize> {
        self.check_fresh(file)?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.file_mut().read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(annotate!(e))),
            }
        }

        Ok(filled)
    }

    fn write(&self, file: &mut SegmentFile, buf: &[u8]) -> Result<usize> {
        self.check_fresh(file)?;
        Self::check_writable(file, "write to")?;

        maybe!(file.file_mut().write_all(buf))?;
        Ok(buf.len())
    }

    fn sync(&self, file: &mut SegmentFile) -> Result<()> {
        self.check_fresh(file)?;
        maybe!(file.file().sync_all())?;
        Ok(())
    }

    fn truncate(&self, file: &mut SegmentFile, len: u64) -> Result<()> {
        self.check_fresh(file)?;
        Self::check_writable(file, "truncate")?;

        maybe!(file.file().set_len(len))?;

        let modcount = file.modcount() + 1;
        write_modcount(file.path(), modcount)?;
        self.modcounts.lock().insert(file.path().to_path_buf(), modcount);
        file.set_modcount(modcount);

        if maybe!(file.file_mut().stream_position())? > len {
            maybe!(file.file_mut().seek(SeekFrom::Start(len)))?;
        }

        log::debug!(
            "truncated segment {} of {} to {} bytes, modification count {}",
            file.segno(),
            file.rnode(),
            len,
            modcount
        );
        Ok(())
    }

    fn close(&self, file: SegmentFile) -> Result<()> {
        log::trace!("closed segment {} of {}", file.segno(), file.rnode());
        drop(file);
        Ok(())
    }

    fn unlink(&self, rnode: &RelFileNodeBackend, _is_redo: bool) -> Result<()> {
        let base = self.segment_path(rnode, 0);
        let (Some(dir), Some(stem)) =
            (base.parent(), base.file_name().and_then(|name| name.to_str()))
        else {
            return Err(Error::Unsupported(format!(
                "segment path {:?} has no parent directory",
                base
            )));
        };

        let entries = match maybe!(fs::read_dir(dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "segments of {} at {:?}",
                    rnode, base
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut found_base = false;
        let mut first_error = None;

        for entry in entries {
            let entry = maybe!(entry)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !belongs_to(stem, name) {
                continue;
            }

            found_base |= name == stem;

            let path = entry.path();
            match maybe!(fs::remove_file(&path)) {
                Ok(()) => {
                    self.modcounts.lock().remove(&path);
                    log::trace!("removed {:?}", path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("could not remove {:?}: {}", path, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e.into());
        }

        if !found_base {
            return Err(Error::NotFound(format!(
                "segments of {} at {:?}",
                rnode, base
            )));
        }

        log::debug!("unlinked the segments of {}", rnode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_segment_files() {
        assert!(belongs_to("16384", "16384"));
        assert!(belongs_to("16384", "16384.2"));
        assert!(belongs_to("16384", "16384.modcount"));
        assert!(belongs_to("16384", "16384.12.modcount"));
        assert!(belongs_to("16384", "16384.1.modcount.tmp"));

        assert!(!belongs_to("16384", "163845"));
        assert!(!belongs_to("16384", "16384_fsm"));
        assert!(!belongs_to("16384", "16384."));
        assert!(!belongs_to("16384", "16384.x"));
    }

    #[test]
    fn corrupt_modcount_records_are_rejected() {
        let path = Path::new("base/1/2.modcount");
        let mut record = encode_modcount(7);
        assert_eq!(decode_modcount(path, &record).unwrap(), 7);

        record[0] ^= 0xFF;
        let err = decode_modcount(path, &record).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        assert!(decode_modcount(path, &record[..8]).is_err());
    }
}
