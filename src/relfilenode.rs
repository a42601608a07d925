//! Physical identifiers for storage objects and the mapping from an
//! identifier to its files under the data directory.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// Catalog object identifier.
pub type Oid = u32;

/// Block number within one fork of a relation.
pub type BlockNumber = u32;

/// Segment number of a physical file belonging to a fork, or of an
/// append-optimized segment file.
pub type SegmentNumber = u32;

/// Largest block number a fork may hold, exclusive.
pub const MAX_BLOCK_NUMBER: BlockNumber = BlockNumber::MAX;

/// Tablespace holding per-database objects unless told otherwise.
pub const DEFAULT_TABLESPACE_OID: Oid = 1663;

/// Tablespace holding cluster-wide shared objects.
pub const GLOBAL_TABLESPACE_OID: Oid = 1664;

/// The number of forks a relation may have.
pub const N_FORKS: usize = 4;

/// A session tag scoping temporary objects to the session that made them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub u32);

/// Tablespace, database and file number of a storage object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelFileNode {
    pub spc_node: Oid,
    pub db_node: Oid,
    pub rel_node: Oid,
}

impl RelFileNode {
    pub const fn new(spc_node: Oid, db_node: Oid, rel_node: Oid) -> Self {
        RelFileNode { spc_node, db_node, rel_node }
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_node, self.db_node, self.rel_node)
    }
}

/// The key of the handle cache: a `RelFileNode` plus the backend scope.
/// `backend` is `None` for objects that outlive the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelFileNodeBackend {
    pub node: RelFileNode,
    pub backend: Option<BackendId>,
}

impl RelFileNodeBackend {
    pub const fn new(node: RelFileNode, backend: Option<BackendId>) -> Self {
        RelFileNodeBackend { node, backend }
    }

    /// An identifier for an object that survives the session.
    pub const fn permanent(node: RelFileNode) -> Self {
        RelFileNodeBackend { node, backend: None }
    }

    /// An identifier for a temporary object owned by `backend`.
    pub const fn temp(node: RelFileNode, backend: BackendId) -> Self {
        RelFileNodeBackend { node, backend: Some(backend) }
    }

    pub const fn is_temp(&self) -> bool {
        self.backend.is_some()
    }

    /// Path of the first segment of `fork`, relative to the data
    /// directory.
    pub fn relpath(&self, fork: ForkNumber) -> PathBuf {
        let RelFileNode { spc_node, db_node, rel_node } = self.node;

        let file_name = match self.backend {
            None => format!("{}{}", rel_node, fork.suffix()),
            Some(BackendId(b)) => {
                format!("t{}_{}{}", b, rel_node, fork.suffix())
            }
        };

        let mut path = PathBuf::new();
        if spc_node == GLOBAL_TABLESPACE_OID {
            path.push("global");
        } else if spc_node == DEFAULT_TABLESPACE_OID {
            path.push("base");
            path.push(db_node.to_string());
        } else {
            path.push("pg_tblspc");
            path.push(spc_node.to_string());
            path.push(db_node.to_string());
        }
        path.push(file_name);
        path
    }

    /// Path of segment `segno` of `fork`, relative to the data directory.
    /// Segment zero is the bare relation path.
    pub fn segment_path(
        &self,
        fork: ForkNumber,
        segno: SegmentNumber,
    ) -> PathBuf {
        let path = self.relpath(fork);
        if segno == 0 {
            path
        } else {
            let mut os = path.into_os_string();
            os.push(format!(".{}", segno));
            os.into()
        }
    }
}

impl fmt::Display for RelFileNodeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.backend {
            None => write!(f, "{}", self.node),
            Some(BackendId(b)) => write!(
                f,
                "{}/{}/t{}_{}",
                self.node.spc_node, self.node.db_node, b, self.node.rel_node
            ),
        }
    }
}

/// A named sub-stream of a relation, stored and sized independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ForkNumber {
    Main = 0,
    FreeSpaceMap = 1,
    VisibilityMap = 2,
    Init = 3,
}

impl ForkNumber {
    pub const ALL: [ForkNumber; N_FORKS] = [
        ForkNumber::Main,
        ForkNumber::FreeSpaceMap,
        ForkNumber::VisibilityMap,
        ForkNumber::Init,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            ForkNumber::Main => "main",
            ForkNumber::FreeSpaceMap => "fsm",
            ForkNumber::VisibilityMap => "vm",
            ForkNumber::Init => "init",
        }
    }

    const fn suffix(self) -> &'static str {
        match self {
            ForkNumber::Main => "",
            ForkNumber::FreeSpaceMap => "_fsm",
            ForkNumber::VisibilityMap => "_vm",
            ForkNumber::Init => "_init",
        }
    }
}

impl fmt::Display for ForkNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ForkNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<ForkNumber> {
        ForkNumber::ALL
            .into_iter()
            .find(|fork| fork.name() == s)
            .ok_or_else(|| Error::Unsupported(format!("unknown fork {:?}", s)))
    }
}

/// How the catalog says an object is stored. Decides which backend
/// services the object for the lifetime of its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageKind {
    #[default]
    Heap,
    AoRows,
    AoColumns,
}

impl StorageKind {
    /// The one-character tag stored in the catalog.
    pub const fn as_char(self) -> char {
        match self {
            StorageKind::Heap => 'h',
            StorageKind::AoRows => 'a',
            StorageKind::AoColumns => 'c',
        }
    }

    pub fn from_char(c: char) -> Result<StorageKind> {
        match c {
            'h' => Ok(StorageKind::Heap),
            'a' => Ok(StorageKind::AoRows),
            'c' => Ok(StorageKind::AoColumns),
            other => Err(Error::Unsupported(format!(
                "unknown storage kind tag {:?}",
                other
            ))),
        }
    }

    pub const fn is_append_optimized(self) -> bool {
        matches!(self, StorageKind::AoRows | StorageKind::AoColumns)
    }

    pub const fn name(self) -> &'static str {
        match self {
            StorageKind::Heap => "heap",
            StorageKind::AoRows => "ao_row",
            StorageKind::AoColumns => "ao_column",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StorageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<StorageKind> {
        match s {
            "heap" => Ok(StorageKind::Heap),
            "ao_row" => Ok(StorageKind::AoRows),
            "ao_column" => Ok(StorageKind::AoColumns),
            other => Err(Error::Unsupported(format!(
                "unknown storage kind {:?}",
                other
            ))),
        }
    }
}
