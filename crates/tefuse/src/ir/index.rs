use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use crate::ir::graph::{Graph, NodeId, ValueId};
use crate::ir::ops::OpRegistry;

/// Structural snapshot of a graph: node positions, value users, alias classes and in-place
/// writers.
///
/// An in-place op's outputs alias its first operand, so values joined through such ops form
/// one alias class. Writers are recorded per class.
///
/// The index is not updated by graph mutations; rebuild it after rewriting.
#[derive(Debug, Clone)]
pub struct GraphIndex {
    order: Vec<NodeId>,
    pos_of: HashMap<NodeId, usize>,
    users: HashMap<ValueId, SmallVec<[NodeId; 4]>>,
    alias_root: HashMap<ValueId, ValueId>,
    mutators: HashMap<ValueId, SmallVec<[NodeId; 2]>>,
    mutating: HashSet<NodeId>,
    graph_outputs: HashSet<ValueId>,
}

/// Union-find over value ids. Only values joined by an in-place op get an entry.
#[derive(Default)]
struct AliasSets {
    parent: HashMap<ValueId, ValueId>,
}

impl AliasSets {
    fn find(&mut self, value: ValueId) -> ValueId {
        let mut root = value;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }
        let mut current = value;
        while current != root {
            let next = self.parent.get(&current).copied().unwrap_or(root);
            self.parent.insert(current, root);
            current = next;
        }
        root
    }

    fn union(&mut self, a: ValueId, b: ValueId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower id wins so the root is the earliest value of the class.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(child, root);
            self.parent.entry(root).or_insert(root);
        }
    }
}

impl GraphIndex {
    pub fn build(graph: &Graph, registry: &OpRegistry) -> Self {
        let order = graph.node_ids().to_vec();
        let mut pos_of = HashMap::with_capacity(order.len());
        let mut users: HashMap<ValueId, SmallVec<[NodeId; 4]>> = HashMap::new();
        let mut writes: Vec<(NodeId, ValueId)> = Vec::new();
        let mut aliases = AliasSets::default();

        for (position, node) in graph.nodes_in_order().enumerate() {
            pos_of.insert(node.id, position);
            for &input in &node.inputs {
                let entry = users.entry(input).or_default();
                if !entry.contains(&node.id) {
                    entry.push(node.id);
                }
            }
            if registry.is_mutating(&node.kind) {
                if let Some(&target) = node.inputs.first() {
                    writes.push((node.id, target));
                    for &output in &node.outputs {
                        aliases.union(target, output);
                    }
                }
            }
        }

        let mut mutating = HashSet::with_capacity(writes.len());
        let mut mutators: HashMap<ValueId, SmallVec<[NodeId; 2]>> = HashMap::new();
        for &(node, target) in &writes {
            mutating.insert(node);
            mutators.entry(aliases.find(target)).or_default().push(node);
        }
        let members: Vec<ValueId> = aliases.parent.keys().copied().collect();
        let alias_root = members
            .into_iter()
            .map(|value| (value, aliases.find(value)))
            .collect();

        GraphIndex {
            order,
            pos_of,
            users,
            alias_root,
            mutators,
            mutating,
            graph_outputs: graph.outputs().iter().copied().collect(),
        }
    }

    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.pos_of.get(&node).copied()
    }

    /// Consumers of `value` in execution order.
    pub fn users(&self, value: ValueId) -> &[NodeId] {
        self.users.get(&value).map(|users| users.as_slice()).unwrap_or(&[])
    }

    /// Representative of the alias class of `value`.
    pub fn alias_root(&self, value: ValueId) -> ValueId {
        self.alias_root.get(&value).copied().unwrap_or(value)
    }

    pub fn may_alias(&self, a: ValueId, b: ValueId) -> bool {
        self.alias_root(a) == self.alias_root(b)
    }

    /// Nodes that write `value`, or any value aliasing it, in place.
    pub fn mutators(&self, value: ValueId) -> &[NodeId] {
        self.mutators
            .get(&self.alias_root(value))
            .map(|nodes| nodes.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_mutating(&self, node: NodeId) -> bool {
        self.mutating.contains(&node)
    }

    pub fn is_graph_output(&self, value: ValueId) -> bool {
        self.graph_outputs.contains(&value)
    }

    /// Nodes strictly between two positions, in execution order.
    pub fn between(&self, after: usize, before: usize) -> &[NodeId] {
        if after + 1 >= before || before > self.order.len() {
            return &[];
        }
        &self.order[after + 1..before]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text::parse_graph;

    #[test]
    fn in_place_writers_are_indexed_by_first_operand() {
        let graph = parse_graph(
            r#"
            graph(%x : Float(4:1, device=cpu), %y : Float(4:1, device=cpu)):
              %one : int = prim::Constant[value=1]()
              %a : Float(4:1, device=cpu) = aten::mul(%x, %y)
              %b : Float(4:1, device=cpu) = aten::add_(%a, %y, %one)
              return (%b)
            "#,
        )
        .unwrap();
        let index = GraphIndex::build(&graph, &OpRegistry::with_aten());
        let ids = graph.node_ids();
        let a_out = graph.node(ids[1]).unwrap().outputs[0];
        let y = graph.inputs()[1];
        assert_eq!(index.mutators(a_out), &[ids[2]]);
        assert!(index.mutators(y).is_empty());
        assert_eq!(index.users(y), &[ids[1], ids[2]]);
        assert!(index.is_mutating(ids[2]));
        assert_eq!(index.between(0, 2), &[ids[1]]);
        assert!(index.between(1, 2).is_empty());
    }

    #[test]
    fn in_place_results_share_the_alias_class_of_their_target() {
        let graph = parse_graph(
            r#"
            graph(%x : Float(4:1, device=cuda:0), %y : Float(4:1, device=cuda:0)):
              %one : int = prim::Constant[value=1]()
              %c : Float(4:1, device=cuda:0) = aten::add_(%x, %y, %one)
              %d : Float(4:1, device=cuda:0) = aten::relu_(%c)
              %w : Float(4:1, device=cuda:0) = aten::mul_(%x, %y)
              %p : Float(4:1, device=cuda:0) = aten::mul(%d, %y)
              return (%p, %w)
            "#,
        )
        .unwrap();
        let index = GraphIndex::build(&graph, &OpRegistry::with_aten());
        let ids = graph.node_ids();
        let x = graph.inputs()[0];
        let y = graph.inputs()[1];
        let c = graph.node(ids[1]).unwrap().outputs[0];
        let d = graph.node(ids[2]).unwrap().outputs[0];
        let p = graph.node(ids[4]).unwrap().outputs[0];

        assert!(index.may_alias(x, c));
        assert!(index.may_alias(d, x));
        assert!(!index.may_alias(x, y));
        assert!(!index.may_alias(p, x));
        assert_eq!(index.alias_root(d), x);
        assert_eq!(index.mutators(d), &[ids[1], ids[2], ids[3]]);
        assert!(index.mutators(p).is_empty());
    }
}
