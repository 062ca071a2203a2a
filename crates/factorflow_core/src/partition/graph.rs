use std::collections::{HashMap, VecDeque};

use factorflow_error::{DbError, Result};

use crate::ir::{Function, Op, OpRef};

/// Top level graph with one node per sub-function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainGraph {
    pub nodes: Vec<MainNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainNode {
    /// Name of the sub-function this node stands for.
    pub name: String,
    /// Producer node for every Input operator of the sub-function that reads
    /// a value computed by another sub-function. A producer appears once per
    /// such Input.
    pub inputs: Vec<usize>,
    /// Consumer nodes, one entry per Input operator reading from this node.
    pub uses: Vec<usize>,
}

impl MainGraph {
    /// Check that `inputs` and `uses` describe the same set of edges.
    pub fn check_edges(&self) -> Result<()> {
        let num_nodes = self.nodes.len();
        for node in &self.nodes {
            if let Some(&bad) = node.inputs.iter().chain(&node.uses).find(|&&n| n >= num_nodes) {
                return Err(DbError::compile("Main graph references unknown node")
                    .with_field("node", node.name.clone())
                    .with_field("reference", bad));
            }
        }

        let mut from_inputs: Vec<(usize, usize)> = Vec::new();
        let mut from_uses: Vec<(usize, usize)> = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            from_inputs.extend(node.inputs.iter().map(|&producer| (producer, idx)));
            from_uses.extend(node.uses.iter().map(|&consumer| (idx, consumer)));
        }
        from_inputs.sort_unstable();
        from_uses.sort_unstable();

        if from_inputs != from_uses {
            let mismatch = from_inputs
                .iter()
                .zip(&from_uses)
                .find(|(a, b)| a != b)
                .map(|(a, _)| *a)
                .or_else(|| from_inputs.get(from_uses.len()).copied())
                .or_else(|| from_uses.get(from_inputs.len()).copied());
            return Err(DbError::compile("Main graph inputs and uses disagree")
                .with_field("edges_from_inputs", from_inputs.len())
                .with_field("edges_from_uses", from_uses.len())
                .with_field("first_mismatch", format!("{mismatch:?}")));
        }

        Ok(())
    }

    /// Check that there's no cycle between nodes.
    pub fn check_acyclic(&self) -> Result<()> {
        self.check_edges()?;

        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.inputs.len()).collect();
        let mut queue: VecDeque<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, p)| **p == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut visited = 0;
        while let Some(idx) = queue.pop_front() {
            visited += 1;
            for &consumer in &self.nodes[idx].uses {
                pending[consumer] = pending[consumer].checked_sub(1).ok_or_else(|| {
                    DbError::compile("Node used more often than it reads")
                        .with_field("node", self.nodes[consumer].name.clone())
                })?;
                if pending[consumer] == 0 {
                    queue.push_back(consumer);
                }
            }
        }

        if visited != self.nodes.len() {
            let stuck: Vec<_> = pending
                .iter()
                .enumerate()
                .filter(|(_, p)| **p > 0)
                .map(|(idx, _)| self.nodes[idx].name.clone())
                .collect();
            return Err(
                DbError::compile("Partitions have a cyclic dependency").with_field("stuck", stuck)
            );
        }

        Ok(())
    }
}

/// A function split into sub-functions, each of which becomes one stage.
#[derive(Debug, Clone)]
pub struct PartitionedGraph {
    pub main: MainGraph,
    pub parts: Vec<Function>,
}

impl PartitionedGraph {
    /// Split `func` according to `assignment`.
    ///
    /// `assignment[i]` is the partition of operator `i`. Inputs and Constants
    /// don't belong to a partition and are ignored; Constants get copied into
    /// every partition that reads them. All other operators must be assigned,
    /// and partition ids must be dense starting at zero.
    pub fn from_assignment(func: &Function, assignment: &[Option<usize>]) -> Result<Self> {
        let ops = func.ops();
        if assignment.len() != ops.len() {
            return Err(DbError::compile("Partition assignment has wrong length")
                .with_field("ops", ops.len())
                .with_field("assignment", assignment.len()));
        }

        let mut num_parts = 0;
        for (idx, op) in ops.iter().enumerate() {
            match (op, assignment[idx]) {
                (Op::Input { .. } | Op::Constant(_), _) => (),
                (_, Some(p)) => num_parts = num_parts.max(p + 1),
                (_, None) => {
                    return Err(DbError::compile("Operator not assigned to a partition")
                        .with_field("op", idx));
                }
            }
        }
        let part_of = |idx: OpRef| match ops[idx] {
            Op::Input { .. } | Op::Constant(_) => None,
            _ => assignment[idx],
        };

        // Names of values leaving their partition.
        let uses = func.uses();
        let mut crossing_names: HashMap<OpRef, String> = HashMap::new();
        for (idx, consumers) in uses.iter().enumerate() {
            let Some(p) = part_of(idx) else {
                continue;
            };
            let crosses = consumers.iter().any(|&c| part_of(c) != Some(p));
            if !crosses {
                continue;
            }
            let same_part_output = consumers.iter().find_map(|&c| match &ops[c] {
                Op::Output { name, .. } if part_of(c) == Some(p) => Some(name.clone()),
                _ => None,
            });
            let name = same_part_output.unwrap_or_else(|| format!("__tmp_{idx}"));
            crossing_names.insert(idx, name);
        }

        let mut parts = Vec::with_capacity(num_parts);
        for p in 0..num_parts {
            parts.push(build_part(func, p, &part_of, &crossing_names)?);
        }

        // Connect partitions through the buffers they read and write.
        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (p, part) in parts.iter().enumerate() {
            for name in part.output_names() {
                if let Some(prev) = producers.insert(name, p) {
                    return Err(DbError::compile("Buffer written by more than one partition")
                        .with_field("buffer", name.to_string())
                        .with_field("first", prev)
                        .with_field("second", p));
                }
            }
        }

        let mut nodes: Vec<MainNode> = parts
            .iter()
            .map(|part| MainNode {
                name: part.name.clone(),
                inputs: Vec::new(),
                uses: Vec::new(),
            })
            .collect();
        for (p, part) in parts.iter().enumerate() {
            for name in part.input_names() {
                if let Some(&producer) = producers.get(name) {
                    nodes[p].inputs.push(producer);
                    nodes[producer].uses.push(p);
                }
            }
        }

        let main = MainGraph { nodes };
        main.check_acyclic()?;

        Ok(PartitionedGraph { main, parts })
    }
}

fn build_part(
    func: &Function,
    part: usize,
    part_of: &impl Fn(OpRef) -> Option<usize>,
    crossing_names: &HashMap<OpRef, String>,
) -> Result<Function> {
    let ops = func.ops();
    let mut local: HashMap<OpRef, OpRef> = HashMap::new();
    let mut new_ops: Vec<Op> = Vec::new();
    let mut emitted_outputs: Vec<OpRef> = Vec::new();

    for (idx, op) in ops.iter().enumerate() {
        if part_of(idx) != Some(part) {
            continue;
        }

        for operand in op.operands() {
            if local.contains_key(&operand) {
                continue;
            }
            let boundary = match &ops[operand] {
                Op::Input { name } => Op::Input { name: name.clone() },
                Op::Constant(v) => Op::Constant(*v),
                _ => {
                    let name = crossing_names.get(&operand).ok_or_else(|| {
                        DbError::compile("Operand crosses partitions without a buffer")
                            .with_field("op", operand)
                    })?;
                    Op::Input { name: name.clone() }
                }
            };
            new_ops.push(boundary);
            local.insert(operand, new_ops.len() - 1);
        }

        new_ops.push(op.map_operands(|o| local[&o]));
        local.insert(idx, new_ops.len() - 1);
        if let Op::Output { input, .. } = op {
            emitted_outputs.push(*input);
        }
    }

    if new_ops.is_empty() {
        return Err(DbError::compile("Partition has no operators").with_field("partition", part));
    }

    // Values read by other partitions that aren't already written through a
    // named Output in this partition.
    for (idx, _) in ops.iter().enumerate() {
        if part_of(idx) != Some(part) {
            continue;
        }
        let Some(name) = crossing_names.get(&idx) else {
            continue;
        };
        if emitted_outputs.contains(&idx) {
            continue;
        }
        new_ops.push(Op::Output {
            name: name.clone(),
            input: local[&idx],
        });
    }

    Function::try_new(format!("{}_{part}", func.name), new_ops)
}
