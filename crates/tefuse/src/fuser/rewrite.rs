use std::collections::HashMap;

use crate::fuser::group::FusionGroup;
use crate::ir::{symbols, Graph, GraphError, GraphIndex, NodeId, NodeSpec, Symbol, ValueId};
use crate::refcount::Ref;

/// Scalar `prim::Constant` producing `value`, if any. Such constants are copied into the
/// subgraph instead of becoming group inputs.
fn scalar_constant(graph: &Graph, value: ValueId) -> Option<NodeId> {
    let producer = graph.node(graph.producer_of(value)?)?;
    let scalar = graph
        .value_type(value)
        .map(|ty| !ty.is_tensor())
        .unwrap_or(false);
    (producer.kind.is(symbols::CONSTANT) && producer.inputs.is_empty() && scalar)
        .then_some(producer.id)
}

/// Replaces the members of `group` with one `prim::TensorExprGroup_<n>` node owning a subgraph
/// that holds the members, in order, plus copies of the scalar constants they read.
pub(crate) fn materialize_group(
    graph: &mut Graph,
    index: &GraphIndex,
    group: &FusionGroup,
) -> Result<NodeId, GraphError> {
    let members = group.members();
    let exports = group.exports(graph, index);

    let mut external = Vec::new();
    let mut constants = Vec::new();
    for value in group.boundary_inputs(graph) {
        match scalar_constant(graph, value) {
            Some(node) => constants.push((value, node)),
            None => external.push(value),
        }
    }

    let mut subgraph = Graph::new();
    let mut mapping: HashMap<ValueId, ValueId> = HashMap::new();
    for &value in &external {
        let outer = graph.value(value).ok_or(GraphError::UnknownValue(value))?;
        let inner = subgraph.add_input(outer.name.clone(), outer.ty.clone());
        mapping.insert(value, inner);
    }
    for &(value, constant) in &constants {
        let node = graph.node(constant).ok_or(GraphError::UnknownNode(constant))?;
        let outer = graph.value(value).ok_or(GraphError::UnknownValue(value))?;
        let mut spec = NodeSpec::new(node.kind.clone()).output(outer.name.clone(), outer.ty.clone());
        spec.attrs = node.attrs.clone();
        let copy = subgraph.append_node(spec)?;
        if let Some(&inner) = subgraph.node(copy).and_then(|copy| copy.outputs.first()) {
            mapping.insert(value, inner);
        }
    }
    for &member in &members {
        let node = graph.node(member).ok_or(GraphError::UnknownNode(member))?;
        let mut spec = NodeSpec::new(node.kind.clone());
        for input in &node.inputs {
            spec = spec.input(*mapping.get(input).ok_or(GraphError::UnknownValue(*input))?);
        }
        for &output in &node.outputs {
            let value = graph.value(output).ok_or(GraphError::UnknownValue(output))?;
            spec = spec.output(value.name.clone(), value.ty.clone());
        }
        spec.attrs = node.attrs.clone();
        spec.subgraph = node.subgraph.clone();
        let copy = subgraph.append_node(spec)?;
        let inner_outputs = subgraph
            .node(copy)
            .map(|copy| copy.outputs.clone())
            .unwrap_or_default();
        for (&outer, inner) in node.outputs.iter().zip(inner_outputs) {
            mapping.insert(outer, inner);
        }
    }
    for export in &exports {
        subgraph.register_output(*mapping.get(export).ok_or(GraphError::UnknownValue(*export))?)?;
    }

    let kind = Symbol::tensor_expr_group(graph.next_group_index());
    let spec = NodeSpec::new(kind)
        .inputs(external)
        .subgraph(Ref::new(subgraph));
    graph.collapse(&members, group.anchor(), spec, exports)
}
