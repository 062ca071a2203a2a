//! Compiling a function into a [`Module`].
//!
//! ```text
//! function -> optimizer passes -> partition decision -> stage partitioner
//!          -> dependency builder -> module assembler -> module
//! ```
pub mod dependency;
pub mod partitioner;

use std::collections::HashSet;
use std::sync::Arc;

use factorflow_error::{DbError, Result};
use indexmap::IndexMap;
use tracing::debug;

use crate::buffer::{BufferKind, BufferRegistry};
use crate::config::CompilerConfig;
use crate::ir::{Function, Op};
use crate::kernel::{InterpretedKernelGenerator, KernelGenerator};
use crate::module::Module;
use crate::optimizer::{DeadCodeElimination, GraphOptimizer};
use crate::partition::{PartitionedGraph, auto_partition};
use crate::stage::Stage;

pub use dependency::{StageDependencies, build_dependencies};
pub use partitioner::{PartialStage, classify_task_kind, partition_stages};

/// Compile `func` with the default passes and kernel generator.
pub fn compile(func: &Function, config: CompilerConfig) -> Result<Module> {
    Compiler::new(config).compile(func)
}

#[derive(Debug)]
pub struct Compiler {
    config: CompilerConfig,
    optimizers: Vec<Box<dyn GraphOptimizer>>,
    generator: Arc<dyn KernelGenerator>,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Compiler {
            config,
            optimizers: vec![Box::new(DeadCodeElimination)],
            generator: Arc::new(InterpretedKernelGenerator),
        }
    }

    /// Replace the optimizer passes.
    pub fn with_optimizers(mut self, optimizers: Vec<Box<dyn GraphOptimizer>>) -> Self {
        self.optimizers = optimizers;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn KernelGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile using the default partition decision.
    pub fn compile(&self, func: &Function) -> Result<Module> {
        self.compile_inner(func, |optimized| {
            Ok(auto_partition(optimized, self.config.partition_factor))
        })
    }

    /// Compile with an explicit partition per operator.
    ///
    /// The assignment is applied to the optimized function, so it's only
    /// meaningful when the optimizer passes leave operator indices alone.
    pub fn compile_with_assignment(
        &self,
        func: &Function,
        assignment: &[Option<usize>],
    ) -> Result<Module> {
        self.compile_inner(func, |_| Ok(assignment.to_vec()))
    }

    fn compile_inner<F>(&self, func: &Function, assign: F) -> Result<Module>
    where
        F: FnOnce(&Function) -> Result<Vec<Option<usize>>>,
    {
        self.config.validate()?;
        func.validate()?;

        // Top level I/O first so partition local lookups see the same ids.
        let mut registry = BufferRegistry::new();
        for op in func.ops() {
            match op {
                Op::Input { name } => {
                    registry.resolve(name, BufferKind::Input);
                }
                Op::Output { name, .. } => {
                    registry.resolve(name, BufferKind::Output);
                }
                _ => (),
            }
        }

        let mut optimized = func.clone();
        for pass in &self.optimizers {
            pass.optimize(&mut optimized)?;
            debug!(pass = pass.name(), function = %optimized.name, "ran optimizer pass");
        }
        check_io_preserved(func, &optimized)?;

        let counts = optimized.unreliable_counts();
        let unreliable: IndexMap<String, usize> = optimized
            .ops()
            .iter()
            .enumerate()
            .filter_map(|(idx, op)| match op {
                Op::Output { name, .. } => Some((name.clone(), counts[idx])),
                _ => None,
            })
            .collect();

        let assignment = assign(&optimized)?;
        let graph = PartitionedGraph::from_assignment(&optimized, &assignment)?;
        let partial =
            partition_stages(&graph, &mut registry, &self.config, self.generator.as_ref())?;
        let deps = build_dependencies(&graph.main)?;

        let stages: Vec<Stage> = partial
            .into_iter()
            .zip(deps)
            .enumerate()
            .map(|(id, (stage, dep))| Stage {
                id,
                name: stage.name,
                inputs: stage.inputs,
                outputs: stage.outputs,
                pending_count: dep.pending_count,
                dependents: dep.dependents,
                task_kind: stage.task_kind,
                kernel: stage.kernel,
            })
            .collect();

        debug!(
            function = %func.name,
            num_stages = stages.len(),
            num_buffers = registry.len(),
            "compiled module"
        );

        Module::assemble(
            func.name.clone(),
            self.config.clone(),
            stages,
            registry.into_buffers(),
            unreliable,
        )
    }
}

fn check_io_preserved(original: &Function, optimized: &Function) -> Result<()> {
    let names = |f: &Function| -> HashSet<String> {
        f.input_names()
            .chain(f.output_names())
            .map(|s| s.to_string())
            .collect()
    };
    if names(original) != names(optimized) {
        return Err(DbError::compile(
            "Optimizer changed the inputs or outputs of the function",
        )
        .with_field("function", original.name.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use factorflow_error::ErrorKind;

    use super::*;
    use crate::buffer::BufferKind;
    use crate::ir::FunctionBuilder;
    use crate::stage::TaskKind;

    fn ret_rank() -> Function {
        let mut b = FunctionBuilder::new();
        let open = b.input("open");
        let close = b.input("close");
        let one = b.constant(1.0);
        let ratio = b.div(close, open);
        let ret = b.sub(ratio, one);
        b.output(ret, "ret");
        let rank = b.rank(ret);
        b.output(rank, "rank_ret");
        b.build("ret_rank").unwrap()
    }

    #[test]
    fn two_stage_module() {
        let module = compile(&ret_rank(), CompilerConfig::default()).unwrap();

        let stages = module.stages();
        assert_eq!(2, stages.len());
        assert_eq!(TaskKind::SliceByStock, stages[0].task_kind);
        assert_eq!(TaskKind::SliceByTime, stages[1].task_kind);
        assert_eq!(0, stages[0].pending_count);
        assert_eq!(vec![1], stages[0].dependents);
        assert_eq!(1, stages[1].pending_count);

        // Top level buffers keep the ids they got before partitioning.
        let names: Vec<_> = module
            .buffers()
            .iter()
            .map(|b| (b.id, b.name.as_str(), b.kind))
            .collect();
        assert_eq!(
            vec![
                (0, "open", BufferKind::Input),
                (1, "close", BufferKind::Input),
                (2, "ret", BufferKind::Output),
                (3, "rank_ret", BufferKind::Output),
            ],
            names
        );
        assert_eq!(vec![1, 0], stages[0].inputs);
        assert_eq!(vec![2], stages[0].outputs);
        assert_eq!(vec![2], stages[1].inputs);

        assert_eq!(
            vec!["ret", "rank_ret"],
            module.output_names().collect::<Vec<_>>()
        );
    }

    #[test]
    fn pending_sum_matches_edges() {
        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let c = b.input("c");
        let s = b.windowed_sum(a, 3);
        let r1 = b.rank(s);
        let r2 = b.rank(c);
        let m = b.mul(r1, r2);
        let m2 = b.add(m, s);
        b.output(m2, "x");
        let module = compile(&b.build("f").unwrap(), CompilerConfig::default()).unwrap();

        let pending: usize = module.stages().iter().map(|s| s.pending_count).sum();
        assert_eq!(module.num_edges(), pending);
        assert!(module.stages().iter().any(|s| s.is_root()));
        assert_eq!(2, module.output_unreliable_count()["x"]);
    }

    #[test]
    fn temp_buffers_registered() {
        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let s = b.windowed_avg(a, 5);
        let r = b.rank(s);
        b.output(r, "x");
        let module = compile(&b.build("f").unwrap(), CompilerConfig::default()).unwrap();

        let tmp = module.buffer_by_name("__tmp_1").unwrap();
        assert_eq!(BufferKind::Temp, tmp.kind);
        assert_eq!(4, module.max_lookback());
    }

    #[test]
    fn bad_assignment_is_compile_error() {
        let f = ret_rank();
        let err = Compiler::new(CompilerConfig::default())
            .compile_with_assignment(&f, &[None; 8])
            .unwrap_err();
        assert_eq!(ErrorKind::Compile, err.kind());
    }

    #[test]
    fn explicit_assignment() {
        let f = ret_rank();
        let assignment = [None, None, None, Some(0), Some(1), Some(1), Some(2), Some(2)];
        let module = Compiler::new(CompilerConfig::default())
            .compile_with_assignment(&f, &assignment)
            .unwrap();
        assert_eq!(3, module.stages().len());
        assert_eq!(vec![1], module.stages()[0].dependents);
        assert_eq!(vec![2], module.stages()[1].dependents);
    }

    /// Renames every output, which a pass must never do.
    #[derive(Debug)]
    struct RenameOutputs;

    impl GraphOptimizer for RenameOutputs {
        fn name(&self) -> &'static str {
            "rename_outputs"
        }

        fn optimize(&self, func: &mut Function) -> Result<()> {
            for op in func.ops_mut() {
                if let Op::Output { name, .. } = op {
                    name.push_str("_renamed");
                }
            }
            Ok(())
        }
    }

    #[test]
    fn optimizer_must_preserve_io() {
        let err = Compiler::new(CompilerConfig::default())
            .with_optimizers(vec![Box::new(RenameOutputs)])
            .compile(&ret_rank())
            .unwrap_err();
        assert_eq!(ErrorKind::Compile, err.kind());
    }

    #[test]
    fn noop_keeps_dead_operators() {
        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let dead = b.unary(crate::ir::UnaryOp::Abs, a);
        let neg = b.unary(crate::ir::UnaryOp::Neg, a);
        b.output(neg, "x");
        let f = b.build("f").unwrap();
        assert_eq!(1, dead);

        let module = Compiler::new(CompilerConfig::default())
            .with_optimizers(vec![Box::new(crate::optimizer::NoopOptimizer)])
            .compile_with_assignment(&f, &[None, Some(0), Some(0), Some(0)])
            .unwrap();
        assert_eq!(1, module.stages().len());

        // Dead code elimination drops the Abs before partitioning.
        let module = compile(&f, CompilerConfig::default()).unwrap();
        assert_eq!(1, module.stages().len());
    }

    #[test]
    fn descriptor_serializes() {
        let module = compile(&ret_rank(), CompilerConfig::default()).unwrap();
        let json = serde_json::to_value(module.descriptor()).unwrap();
        assert_eq!(2, json["stages"].as_array().unwrap().len());
        assert_eq!("SliceByTime", json["stages"][1]["task_kind"]);
        assert_eq!("STs", json["config"]["output_layout"]);
    }
}
