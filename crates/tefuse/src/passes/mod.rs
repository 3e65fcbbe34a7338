//! Graph pass infrastructure: the pass trait, run statistics and the pipeline driver.

mod dce;
mod pipeline;

pub use dce::DeadCodeElimination;
pub use pipeline::{Pipeline, PipelineBuilder, Step};

use crate::error::FuserError;
use crate::ir::Graph;

/// Statistics returned by a [`GraphPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Grouping nodes created.
    pub groups_created: usize,
    /// Nodes moved into grouping nodes.
    pub nodes_fused: usize,
    /// Candidate groups discarded for being below the minimum size.
    pub rejected_small: usize,
    /// Nodes removed (typically by dead code elimination).
    pub erased_nodes: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            groups_created: self.groups_created + other.groups_created,
            nodes_fused: self.nodes_fused + other.nodes_fused,
            rejected_small: self.rejected_small + other.rejected_small,
            erased_nodes: self.erased_nodes + other.erased_nodes,
        }
    }
}

/// A rewrite over a whole graph.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph) -> Result<PassResult, FuserError>;
}

#[cfg(test)]
mod tests {
    use super::PassResult;

    #[test]
    fn merge_accumulates_counters() {
        let a = PassResult {
            changed: false,
            groups_created: 1,
            nodes_fused: 3,
            rejected_small: 0,
            erased_nodes: 2,
        };
        let b = PassResult {
            changed: true,
            rejected_small: 1,
            ..PassResult::default()
        };
        let merged = a.merge(b);
        assert!(merged.changed);
        assert_eq!(merged.groups_created, 1);
        assert_eq!(merged.nodes_fused, 3);
        assert_eq!(merged.rejected_small, 1);
        assert_eq!(merged.erased_nodes, 2);
    }
}
