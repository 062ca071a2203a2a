use std::sync::Arc;

use factorflow_error::{DbError, Result};
use tracing::debug;

use crate::buffer::{BufferKind, BufferRegistry};
use crate::config::CompilerConfig;
use crate::ir::{Function, Op, OpKind};
use crate::kernel::{KernelGenerator, KernelRequest, StageKernel};
use crate::partition::PartitionedGraph;
use crate::stage::TaskKind;

/// A stage before dependencies have been attached.
#[derive(Debug)]
pub struct PartialStage {
    pub name: String,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub task_kind: TaskKind,
    pub kernel: Arc<dyn StageKernel>,
}

/// Turn every sub-function into a stage, registering the buffers that cross
/// stage boundaries.
///
/// Top level inputs and outputs are expected to already be registered so
/// that sub-functions referencing them reuse the same ids.
pub fn partition_stages(
    graph: &PartitionedGraph,
    registry: &mut BufferRegistry,
    config: &CompilerConfig,
    generator: &dyn KernelGenerator,
) -> Result<Vec<PartialStage>> {
    let mut stages = Vec::with_capacity(graph.parts.len());

    for part in &graph.parts {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for op in part.ops() {
            match op {
                Op::Input { name } => inputs.push(registry.resolve(name, BufferKind::Temp).id),
                Op::Output { name, .. } => {
                    outputs.push(registry.resolve(name, BufferKind::Temp).id)
                }
                _ => (),
            }
        }

        let task_kind = classify_task_kind(part);
        debug!(
            stage = %part.name,
            %task_kind,
            minimal = is_minimal_cross_sectional(part),
            num_inputs = inputs.len(),
            num_outputs = outputs.len(),
            "partitioned stage"
        );

        let kernel = generator.generate(&KernelRequest {
            func: part,
            input_buffers: &inputs,
            output_buffers: &outputs,
            registry: &*registry,
            config,
        })?;

        stages.push(PartialStage {
            name: part.name.clone(),
            inputs,
            outputs,
            task_kind,
            kernel,
        });
    }

    check_buffers_resolved(&stages, registry)?;

    Ok(stages)
}

/// Stages containing an operator that has to see all stocks at a time step
/// are sliced by time, everything else by stock.
pub fn classify_task_kind(func: &Function) -> TaskKind {
    let mut task_kind = TaskKind::SliceByStock;
    for op in func.ops() {
        match op.kind() {
            OpKind::CrossSectional => task_kind = TaskKind::SliceByTime,
            OpKind::Io | OpKind::Elementwise | OpKind::Rolling => (),
        }
    }
    task_kind
}

/// If the function is just a single cross-sectional operator reading one
/// input and writing one output.
pub fn is_minimal_cross_sectional(func: &Function) -> bool {
    matches!(
        func.ops(),
        [
            Op::Input { .. },
            Op::CrossSectional { .. },
            Op::Output { .. }
        ]
    )
}

/// Every buffer a stage reads must either come from the caller or be written
/// by some stage.
fn check_buffers_resolved(stages: &[PartialStage], registry: &BufferRegistry) -> Result<()> {
    let buffers: Vec<_> = registry.iter().collect();
    let mut written = vec![false; buffers.len()];
    for stage in stages {
        for &out in &stage.outputs {
            let slot = written.get_mut(out).ok_or_else(|| {
                DbError::compile("Stage writes an unknown buffer")
                    .with_field("stage", stage.name.clone())
                    .with_field("buffer", out)
            })?;
            *slot = true;
        }
    }

    for stage in stages {
        for &input in &stage.inputs {
            let buffer = buffers.get(input).ok_or_else(|| {
                DbError::compile("Stage reads an unknown buffer")
                    .with_field("stage", stage.name.clone())
                    .with_field("buffer", input)
            })?;
            if buffer.kind != BufferKind::Input && !written[input] {
                return Err(DbError::compile("Stage reads a buffer nothing writes")
                    .with_field("stage", stage.name.clone())
                    .with_field("buffer", buffer.name.clone()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FunctionBuilder;

    #[derive(Debug)]
    struct NoopKernel;

    impl StageKernel for NoopKernel {
        fn run_stock_block(
            &self,
            _inputs: &[&[f64]],
            _outputs: &mut [&mut [f64]],
            _lanes: usize,
            _num_time: usize,
        ) -> Result<()> {
            Ok(())
        }

        fn new_stepper(
            &self,
            _num_stocks: usize,
        ) -> Result<Box<dyn crate::kernel::KernelStepper>> {
            Err(DbError::execution("not steppable"))
        }
    }

    fn partial(inputs: Vec<usize>, outputs: Vec<usize>) -> PartialStage {
        PartialStage {
            name: "s".to_string(),
            inputs,
            outputs,
            task_kind: TaskKind::SliceByStock,
            kernel: Arc::new(NoopKernel),
        }
    }

    #[test]
    fn unknown_buffer_ids_rejected() {
        let mut registry = BufferRegistry::new();
        registry.resolve("a", BufferKind::Input);
        registry.resolve("b", BufferKind::Output);

        check_buffers_resolved(&[partial(vec![0], vec![1])], &registry).unwrap();

        let err = check_buffers_resolved(&[partial(vec![0], vec![5])], &registry).unwrap_err();
        assert_eq!(factorflow_error::ErrorKind::Compile, err.kind());
        let err = check_buffers_resolved(&[partial(vec![7], vec![1])], &registry).unwrap_err();
        assert_eq!(factorflow_error::ErrorKind::Compile, err.kind());
    }

    #[test]
    fn classify() {
        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let r = b.rank(a);
        b.output(r, "r");
        let f = b.build("f").unwrap();
        assert_eq!(TaskKind::SliceByTime, classify_task_kind(&f));
        assert!(is_minimal_cross_sectional(&f));

        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let s = b.windowed_sum(a, 2);
        let r = b.rank(s);
        b.output(r, "r");
        let f = b.build("f").unwrap();
        assert_eq!(TaskKind::SliceByTime, classify_task_kind(&f));
        assert!(!is_minimal_cross_sectional(&f));

        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let s = b.windowed_sum(a, 2);
        b.output(s, "s");
        let f = b.build("f").unwrap();
        assert_eq!(TaskKind::SliceByStock, classify_task_kind(&f));
    }
}
