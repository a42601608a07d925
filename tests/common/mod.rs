#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use smgr::{
    BlockNumber, Config, Error, ForkNumber, ForkStorage, Hooks, Md,
    RelFileNode, RelFileNodeBackend, RelationFiles, Result, Smgr,
    StorageObserver, DEFAULT_TABLESPACE_OID,
};

pub const BLOCK_SIZE: usize = 512;

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record.module_path().unwrap().split("::").last().unwrap(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

pub fn config() -> Config {
    Config::tmp().unwrap().block_size(BLOCK_SIZE).blocks_per_segment(4)
}

pub fn rnode(rel: u32) -> RelFileNodeBackend {
    RelFileNodeBackend::permanent(RelFileNode::new(DEFAULT_TABLESPACE_OID, 1, rel))
}

pub fn block(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

/// Call counts of a `CountingStorage`.
#[derive(Debug, Default)]
pub struct Calls {
    pub create: AtomicUsize,
    pub exists: AtomicUsize,
    pub extend: AtomicUsize,
    pub nblocks: AtomicUsize,
    pub truncate: AtomicUsize,
    pub unlink: AtomicUsize,
    pub pre_checkpoint: AtomicUsize,
    pub sync: AtomicUsize,
    pub post_checkpoint: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// A fork backend that counts calls before handing them to `Md`, and
/// can be told to fail unlinks of particular relations.
pub struct CountingStorage {
    pub md: Md,
    pub calls: Calls,
    failing_unlinks: Mutex<HashSet<RelFileNodeBackend>>,
}

impl CountingStorage {
    pub fn new(md: Md) -> CountingStorage {
        CountingStorage {
            md,
            calls: Calls::default(),
            failing_unlinks: Mutex::default(),
        }
    }

    pub fn fail_unlinks_of(&self, rnode: RelFileNodeBackend) {
        self.failing_unlinks.lock().insert(rnode);
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

impl ForkStorage for CountingStorage {
    fn init(&self) -> Result<()> {
        self.md.init()
    }

    fn create(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        is_redo: bool,
    ) -> Result<bool> {
        bump(&self.calls.create);
        self.md.create(files, fork, is_redo)
    }

    fn exists(&self, files: &mut RelationFiles, fork: ForkNumber) -> Result<bool> {
        bump(&self.calls.exists);
        self.md.exists(files, fork)
    }

    fn unlink(
        &self,
        rnode: &RelFileNodeBackend,
        fork: ForkNumber,
        is_redo: bool,
    ) -> Result<()> {
        bump(&self.calls.unlink);
        if self.failing_unlinks.lock().contains(rnode) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "injected unlink failure",
            )));
        }
        self.md.unlink(rnode, fork, is_redo)
    }

    fn extend(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        bump(&self.calls.extend);
        self.md.extend(files, fork, blkno, buf, skip_fsync)
    }

    fn read(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &mut [u8],
    ) -> Result<()> {
        self.md.read(files, fork, blkno, buf)
    }

    fn write(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        blkno: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        self.md.write(files, fork, blkno, buf, skip_fsync)
    }

    fn nblocks(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
    ) -> Result<BlockNumber> {
        bump(&self.calls.nblocks);
        self.md.nblocks(files, fork)
    }

    fn truncate(
        &self,
        files: &mut RelationFiles,
        fork: ForkNumber,
        nblocks: BlockNumber,
    ) -> Result<bool> {
        bump(&self.calls.truncate);
        self.md.truncate(files, fork, nblocks)
    }

    fn immedsync(&self, files: &mut RelationFiles, fork: ForkNumber) -> Result<()> {
        self.md.immedsync(files, fork)
    }

    fn pre_checkpoint(&self) -> Result<()> {
        bump(&self.calls.pre_checkpoint);
        self.md.pre_checkpoint()
    }

    fn sync(&self) -> Result<()> {
        bump(&self.calls.sync);
        self.md.sync()
    }

    fn post_checkpoint(&self) -> Result<()> {
        bump(&self.calls.post_checkpoint);
        self.md.post_checkpoint()
    }
}

/// Opens a storage manager whose fork backend is a `CountingStorage`.
pub fn counting_smgr() -> (Smgr, Arc<CountingStorage>) {
    counting_smgr_with(config(), Hooks::new())
}

pub fn counting_smgr_with(
    config: Config,
    hooks: Hooks,
) -> (Smgr, Arc<CountingStorage>) {
    let storage = Arc::new(CountingStorage::new(Md::new(&config).unwrap()));
    let hooks = hooks.fork_storage(storage.clone()).unwrap();
    let smgr = config.hooks(hooks).open().unwrap();
    (smgr, storage)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Created(RelFileNodeBackend),
    Extended(RelFileNodeBackend),
    Truncated(RelFileNodeBackend),
    Unlinked(RelFileNodeBackend),
}

/// Records every file event, optionally failing each callback after
/// recording it.
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<Event>>,
    pub fail: bool,
}

impl RecordingObserver {
    pub fn failing() -> RecordingObserver {
        RecordingObserver { fail: true, ..RecordingObserver::default() }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn record(&self, event: Event) -> Result<()> {
        self.events.lock().push(event);
        if self.fail {
            Err(Error::Unsupported("observer refuses".into()))
        } else {
            Ok(())
        }
    }
}

impl StorageObserver for RecordingObserver {
    fn file_created(&self, rnode: RelFileNodeBackend) -> Result<()> {
        self.record(Event::Created(rnode))
    }

    fn file_extended(&self, rnode: RelFileNodeBackend) -> Result<()> {
        self.record(Event::Extended(rnode))
    }

    fn file_truncated(&self, rnode: RelFileNodeBackend) -> Result<()> {
        self.record(Event::Truncated(rnode))
    }

    fn file_unlinked(&self, rnode: RelFileNodeBackend) -> Result<()> {
        self.record(Event::Unlinked(rnode))
    }
}
