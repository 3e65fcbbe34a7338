use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use crate::error::FuserError;
use crate::ir::{Graph, Node, NodeId, OpRegistry, ValueId};
use crate::passes::{GraphPass, PassResult};

/// Removes nodes whose results are never used.
///
/// In-place ops and operators missing from the registry are treated as side-effecting and kept.
pub struct DeadCodeElimination {
    registry: Arc<OpRegistry>,
}

impl DeadCodeElimination {
    const NAME: &'static str = "dce";

    pub fn new(registry: Arc<OpRegistry>) -> Self {
        Self { registry }
    }

    fn is_side_effecting(&self, node: &Node) -> bool {
        if node.kind.is_tensor_expr_group() {
            return false;
        }
        self.registry.schema(&node.kind).is_none() || self.registry.is_mutating(&node.kind)
    }
}

impl Default for DeadCodeElimination {
    fn default() -> Self {
        Self::new(OpRegistry::global())
    }
}

impl GraphPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult, FuserError> {
        let mut live: HashSet<ValueId> = graph.outputs().iter().copied().collect();
        let mut dead: Vec<NodeId> = Vec::new();

        for &id in graph.node_ids().iter().rev() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let needed = self.is_side_effecting(node)
                || node.outputs.iter().any(|output| live.contains(output));
            if needed {
                live.extend(node.inputs.iter().copied());
            } else {
                dead.push(node.id);
            }
        }

        for node in graph.remove_nodes(&dead)? {
            trace!(kind = %node.kind, "removed dead node");
        }

        Ok(PassResult {
            changed: !dead.is_empty(),
            erased_nodes: dead.len(),
            ..PassResult::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_graph;

    #[test]
    fn unused_pure_nodes_are_removed_but_mutations_stay() {
        let mut graph = parse_graph(
            r#"
            graph(%x : Float(4:1, device=cpu)):
              %one : int = prim::Constant[value=1]()
              %unused : int = prim::Constant[value=2]()
              %a : Float(4:1, device=cpu) = aten::neg(%x)
              %b : Float(4:1, device=cpu) = aten::add_(%a, %x, %one)
              %c : Float(4:1, device=cpu) = aten::relu(%x)
              %d : Float(4:1, device=cpu) = aten::exp(%c)
              %e : Tensor = custom::print(%x)
              return (%x)
            "#,
        )
        .unwrap();
        let result = DeadCodeElimination::default().run(&mut graph).unwrap();
        assert!(result.changed);
        assert_eq!(result.erased_nodes, 3);
        let kinds: Vec<_> = graph
            .nodes_in_order()
            .map(|node| node.kind.to_string())
            .collect();
        assert_eq!(
            kinds,
            ["prim::Constant", "aten::neg", "aten::add_", "custom::print"]
        );
        assert_eq!(graph.lint(), Ok(()));
    }

    #[test]
    fn clean_graph_is_unchanged() {
        let mut graph = parse_graph(
            "graph(%x : Tensor):\n  %y : Tensor = aten::relu(%x)\n  return (%y)\n",
        )
        .unwrap();
        let result = DeadCodeElimination::default().run(&mut graph).unwrap();
        assert_eq!(result, PassResult::default());
    }
}
