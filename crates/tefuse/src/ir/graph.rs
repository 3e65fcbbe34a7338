use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ir::ops::Symbol;
use crate::ir::types::ValueType;
use crate::refcount::{Ref, RefCount, RefCounted};

/// Identifier of an SSA value inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Identifier of a node inside one graph. Stable across insertions and removals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl ValueId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Node-level constant attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Int(value) => write!(f, "{value}"),
            Attribute::Float(value) => write!(f, "{value:?}"),
            Attribute::Str(value) => write!(f, "{value:?}"),
            Attribute::Bool(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    /// Name used by the text format, without the leading `%`.
    pub name: String,
    pub ty: ValueType,
    /// Defining node and output offset; `None` for graph inputs.
    pub producer: Option<(NodeId, usize)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: Symbol,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub attrs: BTreeMap<String, Attribute>,
    /// Body of a grouping node. Shared between clones of the owning graph.
    pub subgraph: Option<Ref<Graph>>,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }
}

/// Description of a node to be added to a graph.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub kind: Symbol,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<(String, ValueType)>,
    pub attrs: BTreeMap<String, Attribute>,
    pub subgraph: Option<Ref<Graph>>,
}

impl NodeSpec {
    pub fn new(kind: impl Into<Symbol>) -> Self {
        Self {
            kind: kind.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: BTreeMap::new(),
            subgraph: None,
        }
    }

    pub fn input(mut self, value: ValueId) -> Self {
        self.inputs.push(value);
        self
    }

    pub fn inputs(mut self, values: impl IntoIterator<Item = ValueId>) -> Self {
        self.inputs.extend(values);
        self
    }

    pub fn output(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.outputs.push((name.into(), ty));
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: Attribute) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn subgraph(mut self, graph: Ref<Graph>) -> Self {
        self.subgraph = Some(graph);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("value {0} does not exist in this graph")]
    UnknownValue(ValueId),
    #[error("node {0} does not exist in this graph")]
    UnknownNode(NodeId),
    #[error("node {node} cannot be removed: output %{value} is still used")]
    LiveUses { node: NodeId, value: String },
    #[error("position {position} is out of bounds for a graph of {len} nodes")]
    PositionOutOfBounds { position: usize, len: usize },
}

/// Dataflow graph: ordered nodes plus graph-level inputs and outputs.
///
/// Values and nodes live in id-indexed slots; `order` holds the live nodes in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    values: Vec<Option<Value>>,
    nodes: Vec<Option<Node>>,
    order: Vec<NodeId>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    next_group: usize,
    #[serde(skip)]
    refs: RefCount,
}

unsafe impl RefCounted for Graph {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            nodes: Vec::new(),
            order: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            next_group: 0,
            refs: RefCount::new(),
        }
    }

    pub fn add_input(&mut self, name: impl Into<String>, ty: ValueType) -> ValueId {
        let id = self.new_value(name.into(), ty, None);
        self.inputs.push(id);
        id
    }

    pub fn append_node(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        let position = self.order.len();
        self.insert_node_at(position, spec)
    }

    pub fn insert_node_at(&mut self, position: usize, spec: NodeSpec) -> Result<NodeId, GraphError> {
        if position > self.order.len() {
            return Err(GraphError::PositionOutOfBounds {
                position,
                len: self.order.len(),
            });
        }
        for &input in &spec.inputs {
            self.value(input).ok_or(GraphError::UnknownValue(input))?;
        }
        let id = NodeId(self.nodes.len() as u32);
        let outputs = spec
            .outputs
            .into_iter()
            .enumerate()
            .map(|(offset, (name, ty))| self.new_value(name, ty, Some((id, offset))))
            .collect();
        self.nodes.push(Some(Node {
            id,
            kind: spec.kind,
            inputs: spec.inputs,
            outputs,
            attrs: spec.attrs,
            subgraph: spec.subgraph,
        }));
        self.order.insert(position, id);
        Ok(id)
    }

    pub fn register_output(&mut self, value: ValueId) -> Result<(), GraphError> {
        self.value(value).ok_or(GraphError::UnknownValue(value))?;
        self.outputs.push(value);
        Ok(())
    }

    /// Removes a node whose outputs are no longer used. Its output values are dropped.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, GraphError> {
        self.remove_nodes(&[id])?
            .pop()
            .ok_or(GraphError::UnknownNode(id))
    }

    /// Removes a set of nodes in one sweep. Uses among the removed nodes are allowed; a use
    /// by a surviving node or a graph output fails the whole call and leaves the graph as is.
    pub fn remove_nodes(&mut self, ids: &[NodeId]) -> Result<Vec<Node>, GraphError> {
        let mut doomed: HashSet<NodeId> = HashSet::with_capacity(ids.len());
        for &id in ids {
            self.node(id).ok_or(GraphError::UnknownNode(id))?;
            doomed.insert(id);
        }

        let mut used: HashSet<ValueId> = self.outputs.iter().copied().collect();
        for node in self.nodes_in_order().filter(|node| !doomed.contains(&node.id)) {
            used.extend(node.inputs.iter().copied());
        }
        for &id in ids {
            let Some(node) = self.node(id) else {
                continue;
            };
            if let Some(&output) = node.outputs.iter().find(|output| used.contains(output)) {
                return Err(GraphError::LiveUses {
                    node: id,
                    value: self.value_name(output).to_string(),
                });
            }
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for &id in ids {
            let Some(node) = self.nodes[id.index()].take() else {
                continue;
            };
            for output in &node.outputs {
                self.values[output.index()] = None;
            }
            removed.push(node);
        }
        self.order.retain(|other| !doomed.contains(other));
        Ok(removed)
    }

    /// Rewires every use of `from` (node inputs and graph outputs) to `to`.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) -> Result<usize, GraphError> {
        self.value(from).ok_or(GraphError::UnknownValue(from))?;
        self.value(to).ok_or(GraphError::UnknownValue(to))?;
        let mut replaced = 0;
        for node in self.nodes.iter_mut().flatten() {
            for input in node.inputs.iter_mut().filter(|input| **input == from) {
                *input = to;
                replaced += 1;
            }
        }
        for output in self.outputs.iter_mut().filter(|output| **output == from) {
            *output = to;
            replaced += 1;
        }
        Ok(replaced)
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id.index()).and_then(Option::as_ref)
    }

    /// Text name of a value, or `?` when the value does not exist.
    pub fn value_name(&self, id: ValueId) -> &str {
        self.value(id).map(|value| value.name.as_str()).unwrap_or("?")
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.value(id).map(|value| &value.ty)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter().flatten()
    }

    /// Live node ids in execution order.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.order
    }

    pub fn nodes_in_order(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|&id| self.node(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn position_of(&self, id: NodeId) -> Option<usize> {
        self.order.iter().position(|&other| other == id)
    }

    pub fn producer_of(&self, value: ValueId) -> Option<NodeId> {
        self.value(value)
            .and_then(|value| value.producer)
            .map(|(node, _)| node)
    }

    /// Nodes consuming `value`, in execution order. A node using it twice appears once.
    pub fn users_of(&self, value: ValueId) -> Vec<NodeId> {
        self.nodes_in_order()
            .filter(|node| node.inputs.contains(&value))
            .map(|node| node.id)
            .collect()
    }

    pub fn is_graph_output(&self, value: ValueId) -> bool {
        self.outputs.contains(&value)
    }

    /// Reserves the next grouping-node index of this graph.
    pub fn next_group_index(&mut self) -> usize {
        let index = self.next_group;
        self.next_group += 1;
        index
    }

    pub(crate) fn set_next_group_index(&mut self, next: usize) {
        self.next_group = self.next_group.max(next);
    }

    pub fn count_kind(&self, predicate: impl Fn(&Symbol) -> bool) -> usize {
        self.nodes_in_order()
            .filter(|node| predicate(&node.kind))
            .count()
    }

    /// Replaces `members` by a single node placed where `anchor` was.
    ///
    /// `outputs` are existing member outputs that stay visible outside; they are re-parented to
    /// the new node. Every other member output is dropped.
    pub(crate) fn collapse(
        &mut self,
        members: &[NodeId],
        anchor: NodeId,
        spec: NodeSpec,
        outputs: Vec<ValueId>,
    ) -> Result<NodeId, GraphError> {
        let anchor_pos = self
            .position_of(anchor)
            .ok_or(GraphError::UnknownNode(anchor))?;
        for &member in members {
            self.node(member).ok_or(GraphError::UnknownNode(member))?;
        }
        for &input in &spec.inputs {
            self.value(input).ok_or(GraphError::UnknownValue(input))?;
        }
        for &output in &outputs {
            self.value(output).ok_or(GraphError::UnknownValue(output))?;
        }

        let id = NodeId(self.nodes.len() as u32);
        let member_set: HashSet<NodeId> = members.iter().copied().collect();
        for &member in members {
            if let Some(node) = self.nodes[member.index()].take() {
                for value in node.outputs {
                    if !outputs.contains(&value) {
                        self.values[value.index()] = None;
                    }
                }
            }
        }
        for (offset, &value) in outputs.iter().enumerate() {
            if let Some(slot) = self.values[value.index()].as_mut() {
                slot.producer = Some((id, offset));
            }
        }
        self.nodes.push(Some(Node {
            id,
            kind: spec.kind,
            inputs: spec.inputs,
            outputs,
            attrs: spec.attrs,
            subgraph: spec.subgraph,
        }));
        self.order[anchor_pos] = id;
        self.order.retain(|node| !member_set.contains(node));
        Ok(id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    fn new_value(&mut self, name: String, ty: ValueType, producer: Option<(NodeId, usize)>) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Some(Value {
            id,
            name,
            ty,
            producer,
        }));
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{Device, ScalarType, TensorType};

    fn float(device: Device) -> ValueType {
        ValueType::Tensor(TensorType::contiguous(ScalarType::Float, &[4], device))
    }

    fn chain() -> (Graph, ValueId, NodeId, NodeId) {
        let mut graph = Graph::new();
        let x = graph.add_input("x", float(Device::Cpu));
        let a = graph
            .append_node(
                NodeSpec::new("aten::neg")
                    .input(x)
                    .output("a", float(Device::Cpu)),
            )
            .unwrap();
        let a_out = graph.node(a).unwrap().outputs[0];
        let b = graph
            .append_node(
                NodeSpec::new("aten::relu")
                    .input(a_out)
                    .output("b", float(Device::Cpu)),
            )
            .unwrap();
        let b_out = graph.node(b).unwrap().outputs[0];
        graph.register_output(b_out).unwrap();
        (graph, x, a, b)
    }

    #[test]
    fn producers_and_users_are_tracked() {
        let (graph, x, a, b) = chain();
        let a_out = graph.node(a).unwrap().outputs[0];
        assert_eq!(graph.producer_of(a_out), Some(a));
        assert_eq!(graph.producer_of(x), None);
        assert_eq!(graph.users_of(a_out), vec![b]);
        assert_eq!(graph.position_of(b), Some(1));
    }

    #[test]
    fn removing_a_used_node_fails() {
        let (mut graph, _, a, b) = chain();
        assert!(matches!(
            graph.remove_node(a),
            Err(GraphError::LiveUses { node, .. }) if node == a
        ));
        assert!(matches!(
            graph.remove_node(b),
            Err(GraphError::LiveUses { .. })
        ));
    }

    #[test]
    fn batch_removal_allows_uses_inside_the_batch() {
        let (mut graph, x, a, b) = chain();
        assert!(matches!(
            graph.remove_nodes(&[a]),
            Err(GraphError::LiveUses { node, .. }) if node == a
        ));
        assert_eq!(graph.len(), 2);

        let b_out = graph.node(b).unwrap().outputs[0];
        graph.replace_all_uses(b_out, x).unwrap();
        let removed = graph.remove_nodes(&[b, a]).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(graph.is_empty());
        assert_eq!(graph.lint(), Ok(()));
    }

    #[test]
    fn replace_all_uses_rewires_outputs_too() {
        let (mut graph, x, a, b) = chain();
        let b_out = graph.node(b).unwrap().outputs[0];
        assert_eq!(graph.replace_all_uses(b_out, x).unwrap(), 1);
        graph.remove_node(b).unwrap();
        let a_out = graph.node(a).unwrap().outputs[0];
        assert!(graph.users_of(a_out).is_empty());
        graph.remove_node(a).unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.outputs(), &[x]);
    }

    #[test]
    fn insert_rejects_unknown_inputs() {
        let mut graph = Graph::new();
        let err = graph
            .append_node(NodeSpec::new("aten::neg").input(ValueId(9)))
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownValue(ValueId(9)));
    }

    #[test]
    fn collapse_keeps_exported_values() {
        let (mut graph, x, a, b) = chain();
        let b_out = graph.node(b).unwrap().outputs[0];
        let group = graph
            .collapse(
                &[a, b],
                b,
                NodeSpec::new(Symbol::tensor_expr_group(0)).input(x),
                vec![b_out],
            )
            .unwrap();
        assert_eq!(graph.node_ids(), &[group]);
        assert_eq!(graph.producer_of(b_out), Some(group));
        assert_eq!(graph.values().count(), 2);
    }

    #[test]
    fn json_preserves_structure() {
        let (graph, _, _, _) = chain();
        let json = graph.to_json().unwrap();
        let back = Graph::from_json(&json).unwrap();
        assert_eq!(back, graph);
    }
}
