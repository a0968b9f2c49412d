//! Served index handles: one per index name, each behind its own
//! reader/writer lock with embedded query statistics.

use std::any::Any;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::net::mirror::MirrorGroup;

use super::stats::QueryStats;

/// The index object itself is opaque to the serving core; the executor
/// downcasts when it needs the concrete type.
pub trait SearchIndex: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Kind of a served index. Only `Rt` and `Percolate` handles are mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Plain,
    Template,
    Rt,
    Percolate,
    Distributed,
}

impl IndexType {
    pub fn is_mutable(self) -> bool {
        matches!(self, IndexType::Rt | IndexType::Percolate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexType::Plain => "plain",
            IndexType::Template => "template",
            IndexType::Rt => "rt",
            IndexType::Percolate => "percolate",
            IndexType::Distributed => "distributed",
        }
    }
}

impl FromStr for IndexType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "plain" => IndexType::Plain,
            "template" => IndexType::Template,
            "rt" => IndexType::Rt,
            "percolate" => IndexType::Percolate,
            "distributed" => IndexType::Distributed,
            other => return Err(format!("unknown index type '{other}'")),
        })
    }
}

/// How index files are mapped once the storage layer opens them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAccess {
    #[default]
    Mmap,
    Mlock,
    File,
}

/// Remote half of a distributed index: local member names plus the mirror
/// groups queried in parallel.
#[derive(Clone, Default)]
pub struct DistributedDesc {
    pub locals: Vec<String>,
    pub groups: Vec<Arc<MirrorGroup>>,
}

/// Mutable contents of a served index, guarded by the handle lock.
pub struct ServedIndex {
    pub index: Box<dyn SearchIndex>,
    pub path: PathBuf,
    /// Staging path used while a rotation hands the handle over.
    pub new_path: Option<PathBuf>,
    pub preopen: bool,
    pub kill_list_targets: Vec<String>,
    /// Relative access cost, used to order rotations.
    pub mass: u64,
    pub rotation_priority: i32,
    pub file_access: FileAccess,
    pub distributed: Option<DistributedDesc>,
}

/// A registered index: per-handle lock around the contents, stats outside
/// it so status queries never contend with a long search.
pub struct Served {
    index_type: IndexType,
    contents: RwLock<ServedIndex>,
    stats: QueryStats,
}

/// Write access denied because the index kind is immutable.
#[derive(Debug, thiserror::Error)]
#[error("index is {0} and not mutable")]
pub struct NotMutable(pub &'static str);

impl Served {
    pub fn new(index_type: IndexType, contents: ServedIndex) -> Arc<Served> {
        Arc::new(Served {
            index_type,
            contents: RwLock::new(contents),
            stats: QueryStats::new(),
        })
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ServedIndex> {
        self.contents.read()
    }

    /// Exclusive access for insert/replace paths. Only mutable index kinds
    /// grant it.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, ServedIndex>, NotMutable> {
        if !self.index_type.is_mutable() {
            return Err(NotMutable(self.index_type.as_str()));
        }
        Ok(self.contents.write())
    }
}
