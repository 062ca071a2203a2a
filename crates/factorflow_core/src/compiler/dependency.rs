use factorflow_error::Result;

use crate::partition::MainGraph;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDependencies {
    pub pending_count: usize,
    pub dependents: Vec<usize>,
}

/// Derive stage dependencies from the main graph.
///
/// A stage reading several buffers from the same producer still only waits
/// on that producer once, and the producer lists the consumer once. The
/// runtime decrements once per dependent, so both sides agree.
pub fn build_dependencies(main: &MainGraph) -> Result<Vec<StageDependencies>> {
    main.check_acyclic()?;

    let deps = main
        .nodes
        .iter()
        .map(|node| StageDependencies {
            pending_count: distinct(&node.inputs).len(),
            dependents: distinct(&node.uses),
        })
        .collect();

    Ok(deps)
}

/// Deduplicate, keeping first-seen order.
fn distinct(vals: &[usize]) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::with_capacity(vals.len());
    for &v in vals {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}
