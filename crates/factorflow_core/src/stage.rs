use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::kernel::StageKernel;

/// How work inside a stage is split up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskKind {
    /// Independent per block of stocks, each over the full time range.
    SliceByStock,
    /// One time step at a time across all stocks.
    SliceByTime,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SliceByStock => "SLICE_BY_STOCK",
            Self::SliceByTime => "SLICE_BY_TIME",
        };
        write!(f, "{s}")
    }
}

/// One schedulable unit of a module.
///
/// Buffers and dependent stages are referenced by index into the owning
/// module.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: usize,
    pub name: String,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    /// Number of distinct producer stages that must complete before this
    /// stage can run.
    pub pending_count: usize,
    pub dependents: Vec<usize>,
    pub task_kind: TaskKind,
    pub kernel: Arc<dyn StageKernel>,
}

impl Stage {
    pub fn is_root(&self) -> bool {
        self.pending_count == 0
    }
}
