//! Boundary for graph optimization passes that run before partitioning.
//!
//! Passes are free to rewrite the graph however they like as long as the set
//! of Input and Output names is preserved and the result computes the same
//! values.
use std::fmt::Debug;

use factorflow_error::Result;
use tracing::debug;

use crate::ir::{Function, Op, OpRef};

pub trait GraphOptimizer: Debug + Sync + Send {
    fn name(&self) -> &'static str;

    fn optimize(&self, func: &mut Function) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOptimizer;

impl GraphOptimizer for NoopOptimizer {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn optimize(&self, _func: &mut Function) -> Result<()> {
        Ok(())
    }
}

/// Removes compute operators that don't contribute to any Output.
///
/// Inputs are always kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadCodeElimination;

impl GraphOptimizer for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn optimize(&self, func: &mut Function) -> Result<()> {
        let ops = func.ops();
        let mut live = vec![false; ops.len()];
        for idx in (0..ops.len()).rev() {
            if matches!(ops[idx], Op::Output { .. } | Op::Input { .. }) {
                live[idx] = true;
            }
            if live[idx] {
                for operand in ops[idx].operands() {
                    live[operand] = true;
                }
            }
        }

        let removed = live.iter().filter(|l| !**l).count();
        if removed == 0 {
            return Ok(());
        }

        let mut remap: Vec<Option<OpRef>> = vec![None; ops.len()];
        let mut new_ops = Vec::with_capacity(ops.len() - removed);
        for (idx, op) in ops.iter().enumerate() {
            if !live[idx] {
                continue;
            }
            // Operands of a live op are live and come earlier, so they've
            // already been remapped.
            new_ops.push(op.map_operands(|o| remap[o].unwrap_or(o)));
            remap[idx] = Some(new_ops.len() - 1);
        }

        debug!(function = %func.name, %removed, "removed dead operators");
        *func.ops_mut() = new_ops;
        func.validate()
    }
}
