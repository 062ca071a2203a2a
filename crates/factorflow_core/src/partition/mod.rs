//! Deciding which operators get fused into the same stage.
pub mod graph;

pub use graph::{MainGraph, MainNode, PartitionedGraph};

use crate::ir::{Function, Op, OpKind};

/// Assign operators to partitions.
///
/// Every cross-sectional operator is isolated in its own partition so that
/// only the smallest possible amount of work has to run sliced by time.
/// Remaining compute operators are grouped by how many cross-sectional
/// operators sit between them and the inputs, then chunked in operator order
/// into partitions of at most `partition_factor` operators.
///
/// Partition ids are handed out in an order where producers come before
/// consumers.
pub fn auto_partition(func: &Function, partition_factor: usize) -> Vec<Option<usize>> {
    let ops = func.ops();
    let partition_factor = partition_factor.max(1);

    let mut level = vec![0; ops.len()];
    for (idx, op) in ops.iter().enumerate() {
        level[idx] = op
            .operands()
            .into_iter()
            .map(|o| level[o] + usize::from(ops[o].is_cross_sectional()))
            .max()
            .unwrap_or(0);
    }
    let max_level = level.iter().copied().max().unwrap_or(0);

    let mut assignment = vec![None; ops.len()];
    let mut next = 0;
    for lvl in 0..=max_level {
        let mut current = None;
        let mut count = 0;
        for (idx, op) in ops.iter().enumerate() {
            let fusable = matches!(op.kind(), OpKind::Elementwise | OpKind::Rolling)
                && !matches!(op, Op::Constant(_));
            if level[idx] != lvl || !fusable {
                continue;
            }
            if current.is_none() || count == partition_factor {
                current = Some(next);
                next += 1;
                count = 0;
            }
            assignment[idx] = current;
            count += 1;
        }

        for (idx, op) in ops.iter().enumerate() {
            if level[idx] == lvl && op.is_cross_sectional() {
                assignment[idx] = Some(next);
                next += 1;
            }
        }
    }

    // Outputs go with the value they write. Outputs that just copy an input
    // or a constant go to the first partition at level zero.
    let first_partition = ops
        .iter()
        .enumerate()
        .find(|(idx, op)| {
            level[*idx] == 0 && !op.is_cross_sectional() && assignment[*idx].is_some()
        })
        .and_then(|(idx, _)| assignment[idx]);
    let mut passthrough = first_partition;
    for (idx, op) in ops.iter().enumerate() {
        let Op::Output { input, .. } = op else {
            continue;
        };
        assignment[idx] = match assignment[*input] {
            Some(p) => Some(p),
            None => {
                let p = *passthrough.get_or_insert_with(|| {
                    next += 1;
                    next - 1
                });
                Some(p)
            }
        };
    }

    assignment
}
