use std::collections::HashSet;

use crate::ir::{Device, Graph, GraphIndex, NodeId, ValueId};

/// Candidate group grown backwards from an anchor node.
///
/// The anchor is the latest member in execution order; the grouping node replaces it there.
#[derive(Debug, Clone)]
pub struct FusionGroup {
    anchor: NodeId,
    device: Device,
    /// Members sorted by position, anchor last.
    members: Vec<(usize, NodeId)>,
    member_set: HashSet<NodeId>,
}

impl FusionGroup {
    pub fn new(anchor: NodeId, position: usize, device: Device) -> Self {
        Self {
            anchor,
            device,
            members: vec![(position, anchor)],
            member_set: HashSet::from([anchor]),
        }
    }

    pub fn anchor(&self) -> NodeId {
        self.anchor
    }

    pub fn anchor_position(&self) -> usize {
        self.members.last().map(|&(position, _)| position).unwrap_or(0)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.member_set.contains(&node)
    }

    /// Members in execution order.
    pub fn members(&self) -> Vec<NodeId> {
        self.members.iter().map(|&(_, node)| node).collect()
    }

    pub fn add(&mut self, node: NodeId, position: usize) {
        if self.member_set.insert(node) {
            let at = self.members.partition_point(|&(other, _)| other < position);
            self.members.insert(at, (position, node));
        }
    }

    /// Values read by members but defined outside the group, in first-use order.
    pub fn boundary_inputs(&self, graph: &Graph) -> Vec<ValueId> {
        let mut seen = HashSet::new();
        let mut inputs = Vec::new();
        for &(_, member) in &self.members {
            let Some(node) = graph.node(member) else {
                continue;
            };
            for &input in &node.inputs {
                let internal = graph
                    .producer_of(input)
                    .map(|producer| self.contains(producer))
                    .unwrap_or(false);
                if !internal && seen.insert(input) {
                    inputs.push(input);
                }
            }
        }
        inputs
    }

    /// Member outputs that stay visible after fusion: graph outputs and values with users
    /// outside the group.
    pub fn exports(&self, graph: &Graph, index: &GraphIndex) -> Vec<ValueId> {
        self.exports_with(graph, index, None)
    }

    /// Exports the group would have if `extra` were a member too.
    pub fn exports_with(
        &self,
        graph: &Graph,
        index: &GraphIndex,
        extra: Option<NodeId>,
    ) -> Vec<ValueId> {
        let is_member = |node: NodeId| self.contains(node) || Some(node) == extra;
        let mut nodes: Vec<(usize, NodeId)> = self.members.clone();
        if let Some(extra) = extra.filter(|&extra| !self.contains(extra)) {
            nodes.push((index.position(extra).unwrap_or(0), extra));
            nodes.sort_unstable();
        }

        let mut exports = Vec::new();
        for (_, member) in nodes {
            let Some(node) = graph.node(member) else {
                continue;
            };
            for &output in &node.outputs {
                let escapes = index.is_graph_output(output)
                    || index.users(output).iter().any(|&user| !is_member(user));
                if escapes {
                    exports.push(output);
                }
            }
        }
        exports
    }
}
