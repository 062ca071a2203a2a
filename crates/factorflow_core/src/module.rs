use factorflow_error::{DbError, Result};
use indexmap::IndexMap;
use serde::Serialize;

use crate::buffer::{Buffer, BufferKind};
use crate::config::CompilerConfig;
use crate::layout::{DataType, Layout};
use crate::stage::{Stage, TaskKind};

/// Bumped whenever the shape of [`ModuleDescriptor`] changes.
pub const MODULE_FORMAT_VERSION: u32 = 1;

/// A compiled, immutable set of stages and the buffers connecting them.
///
/// Modules are read only after assembly and can be shared across any number
/// of concurrent executions.
#[derive(Debug)]
pub struct Module {
    name: String,
    config: CompilerConfig,
    stages: Vec<Stage>,
    buffers: Vec<Buffer>,
    input_names: Vec<String>,
    /// Unreliable count per output, in output order.
    unreliable: IndexMap<String, usize>,
}

impl Module {
    /// Package stages and buffers into a module.
    ///
    /// Checks that every index refers to something inside the module and that
    /// the dependency structure is self consistent.
    pub fn assemble(
        name: impl Into<String>,
        config: CompilerConfig,
        stages: Vec<Stage>,
        buffers: Vec<Buffer>,
        unreliable: IndexMap<String, usize>,
    ) -> Result<Self> {
        for (idx, buffer) in buffers.iter().enumerate() {
            if buffer.id != idx {
                return Err(DbError::compile("Buffer ids must be dense")
                    .with_field("buffer", buffer.name.clone())
                    .with_field("id", buffer.id));
            }
        }

        let mut writers: Vec<Option<usize>> = vec![None; buffers.len()];
        let mut incoming = vec![0; stages.len()];
        for (idx, stage) in stages.iter().enumerate() {
            if stage.id != idx {
                return Err(DbError::compile("Stage ids must be dense")
                    .with_field("stage", stage.name.clone()));
            }
            for &buf in stage.inputs.iter().chain(&stage.outputs) {
                if buf >= buffers.len() {
                    return Err(DbError::compile("Stage references unknown buffer")
                        .with_field("stage", stage.name.clone())
                        .with_field("buffer", buf));
                }
            }
            for &buf in &stage.outputs {
                if let Some(prev) = writers[buf].replace(idx) {
                    return Err(DbError::compile("Buffer has more than one writer")
                        .with_field("buffer", buffers[buf].name.clone())
                        .with_field("first", prev)
                        .with_field("second", idx));
                }
            }
            for &dep in &stage.dependents {
                let count = incoming.get_mut(dep).ok_or_else(|| {
                    DbError::compile("Stage depends on unknown stage").with_field("dependent", dep)
                })?;
                *count += 1;
            }
        }

        for (stage, count) in stages.iter().zip(incoming) {
            if stage.pending_count != count {
                return Err(DbError::compile("Pending count doesn't match dependency edges")
                    .with_field("stage", stage.name.clone())
                    .with_field("pending_count", stage.pending_count)
                    .with_field("edges", count));
            }
        }
        if !stages.is_empty() && !stages.iter().any(|s| s.is_root()) {
            return Err(DbError::compile("Module has no root stage"));
        }

        let input_names = buffers
            .iter()
            .filter(|b| b.kind == BufferKind::Input)
            .map(|b| b.name.clone())
            .collect();

        Ok(Module {
            name: name.into(),
            config,
            stages,
            buffers,
            input_names,
            unreliable,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn buffer_by_name(&self, name: &str) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.name == name)
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Output names in the order they were declared.
    pub fn output_names(&self) -> impl ExactSizeIterator<Item = &str> {
        self.unreliable.keys().map(|s| s.as_str())
    }

    /// Number of leading time steps each output needs before its values are
    /// meaningful.
    pub fn output_unreliable_count(&self) -> &IndexMap<String, usize> {
        &self.unreliable
    }

    /// Number of past steps needed to compute any output exactly.
    pub fn max_lookback(&self) -> usize {
        self.unreliable.values().copied().max().unwrap_or(0)
    }

    pub fn blocking_len(&self) -> usize {
        self.config.blocking_len
    }

    pub fn input_layout(&self) -> Layout {
        self.config.input_layout
    }

    pub fn output_layout(&self) -> Layout {
        self.config.output_layout
    }

    pub fn dtype(&self) -> DataType {
        self.config.dtype
    }

    /// Number of producer to consumer edges between stages.
    pub fn num_edges(&self) -> usize {
        self.stages.iter().map(|s| s.dependents.len()).sum()
    }

    /// Serializable description of the module, minus the kernels.
    pub fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            version: MODULE_FORMAT_VERSION,
            name: self.name.clone(),
            config: self.config.clone(),
            buffers: self.buffers.clone(),
            stages: self
                .stages
                .iter()
                .map(|s| StageDescriptor {
                    id: s.id,
                    name: s.name.clone(),
                    inputs: s.inputs.clone(),
                    outputs: s.outputs.clone(),
                    dependents: s.dependents.clone(),
                    num_dependents: s.dependents.len(),
                    pending_count: s.pending_count,
                    task_kind: s.task_kind,
                })
                .collect(),
            unreliable_counts: self.unreliable.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleDescriptor {
    pub version: u32,
    pub name: String,
    pub config: CompilerConfig,
    pub buffers: Vec<Buffer>,
    pub stages: Vec<StageDescriptor>,
    pub unreliable_counts: IndexMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageDescriptor {
    pub id: usize,
    pub name: String,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub dependents: Vec<usize>,
    pub num_dependents: usize,
    pub pending_count: usize,
    pub task_kind: TaskKind,
}
