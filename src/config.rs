use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fault_injection::{annotate, maybe};

use crate::{
    AoStorage, BlockNumber, Error, Hooks, Md, Result, Smgr,
};

const DEFAULT_PATH: &str = "smgr.default";
const DEFAULT_BLOCK_SIZE: usize = 8192;
const DEFAULT_BLOCKS_PER_SEGMENT: BlockNumber = 131_072;
const MAX_BLOCK_SIZE: usize = 32 * 1024;

/// How tolerant `create` and `unlink` are of work that has already been
/// done. Outside of `Normal`, an existing container on create and a
/// missing one on unlink are silently accepted, so replaying a log
/// twice is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    #[default]
    Normal,
    Bootstrap,
    Recovery,
}

impl ProcessingMode {
    pub const fn is_redo(self) -> bool {
        !matches!(self, ProcessingMode::Normal)
    }

    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            ProcessingMode::Normal => 0,
            ProcessingMode::Bootstrap => 1,
            ProcessingMode::Recovery => 2,
        }
    }

    pub(crate) const fn from_u8(byte: u8) -> ProcessingMode {
        match byte {
            1 => ProcessingMode::Bootstrap,
            2 => ProcessingMode::Recovery,
            _ => ProcessingMode::Normal,
        }
    }
}

/// Top-level configuration for the storage manager.
///
/// # Examples
///
/// ```
/// let config = smgr::Config::new()
///     .path("/path/to/data")
///     .block_size(4096)
///     .blocks_per_segment(1024);
/// assert_eq!(config.block_size, 4096);
/// ```
#[derive(Clone)]
pub struct Config {
    /// The data directory. Relation files live below it.
    pub path: PathBuf,
    /// Size of a block in bytes. Defaults to 8192.
    pub block_size: usize,
    /// Blocks in one segment file of a fork. Defaults to 131072, which
    /// is 1gb at the default block size.
    pub blocks_per_segment: BlockNumber,
    pub processing_mode: ProcessingMode,
    pub hooks: Hooks,
    tempdir_deleter: Option<Arc<tempdir::TempDir>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("blocks_per_segment", &self.blocks_per_segment)
            .field("processing_mode", &self.processing_mode)
            .field("hooks", &self.hooks)
            .field("temporary", &self.tempdir_deleter.is_some())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: DEFAULT_PATH.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            blocks_per_segment: DEFAULT_BLOCKS_PER_SEGMENT,
            processing_mode: ProcessingMode::Normal,
            hooks: Hooks::default(),
            tempdir_deleter: None,
        }
    }
}

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    }
}

impl Config {
    /// Returns a default `Config`
    pub fn new() -> Config {
        Config::default()
    }

    /// Returns a config in a fresh temporary directory that is removed
    /// once the last clone of the config and every `Smgr` opened from it
    /// are dropped.
    pub fn tmp() -> io::Result<Config> {
        let tempdir = maybe!(tempdir::TempDir::new("smgr_tmp"))?;

        Ok(Config {
            path: tempdir.path().into(),
            tempdir_deleter: Some(Arc::new(tempdir)),
            ..Config::default()
        })
    }

    /// Set the data directory (builder).
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Config {
        self.path = path.as_ref().to_path_buf();
        self
    }

    builder!(
        (block_size, usize, "size of a block in bytes, a power of two between 512 and 32kb"),
        (blocks_per_segment, BlockNumber, "number of blocks stored in one segment file of a fork"),
        (processing_mode, ProcessingMode, "the initial processing mode, which may later be changed at runtime"),
        (hooks, Hooks, "backend overrides, the storage kind selector and the file event observer")
    );

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(512..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(Error::Unsupported(format!(
                "block_size must be a power of two between 512 and {}, got {}",
                MAX_BLOCK_SIZE, self.block_size
            )));
        }

        if self.blocks_per_segment == 0 {
            return Err(Error::Unsupported(
                "blocks_per_segment must be at least 1".into(),
            ));
        }

        let segment_bytes =
            self.block_size as u64 * u64::from(self.blocks_per_segment);
        if i64::try_from(segment_bytes).is_err() {
            return Err(Error::Unsupported(format!(
                "segments of {} blocks of {} bytes are too large",
                self.blocks_per_segment, self.block_size
            )));
        }

        Ok(())
    }

    /// Opens a storage manager over the configured data directory.
    pub fn open(&self) -> Result<Smgr> {
        self.validate()?;

        maybe!(fs::create_dir_all(&self.path))?;

        let directory_lock = maybe!(fs::File::open(&self.path))?;
        if let Err(e) = maybe!(fs2::FileExt::try_lock_shared(&directory_lock)) {
            return Err(Error::Io(annotate!(io::Error::new(
                e.kind(),
                format!(
                    "data directory {:?} is locked exclusively by \
                     another process: {}",
                    self.path, e
                ),
            ))));
        }

        let fork_storage = match self.hooks.fork_storage_override() {
            Some(storage) => storage,
            None => Arc::new(Md::new(self)?),
        };

        let segment_storage = match self.hooks.segment_storage_override() {
            Some(storage) => storage,
            None => Arc::new(AoStorage::new(self)),
        };

        fork_storage.init()?;

        log::info!(
            "storage manager opened at {:?} with {} byte blocks",
            self.path,
            self.block_size
        );

        Ok(Smgr::new(self.clone(), fork_storage, segment_storage, directory_lock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nonsense_sizes() {
        let config = Config::tmp().unwrap();

        let err = config.clone().block_size(1000).open().unwrap_err();
        assert!(err.is_unsupported());

        let err = config.clone().block_size(128).open().unwrap_err();
        assert!(err.is_unsupported());

        let err = config.blocks_per_segment(0).open().unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn processing_mode_bytes() {
        for mode in [
            ProcessingMode::Normal,
            ProcessingMode::Bootstrap,
            ProcessingMode::Recovery,
        ] {
            assert_eq!(ProcessingMode::from_u8(mode.as_u8()), mode);
        }
        assert!(!ProcessingMode::Normal.is_redo());
        assert!(ProcessingMode::Recovery.is_redo());
    }
}
