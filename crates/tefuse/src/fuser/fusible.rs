use smallvec::SmallVec;
use thiserror::Error;

use crate::fuser::device::DeviceSet;
use crate::ir::{symbols, Device, Graph, NodeId, OpRegistry, Symbol, ValueId, ValueType};

/// Why a node was left out of a group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("{0} is already a grouping node")]
    AlreadyFused(Symbol),
    #[error("{0} is not a registered operator")]
    Unregistered(Symbol),
    #[error("{0} writes its first operand in place")]
    Mutating(Symbol),
    #[error("{0} is neither elementwise nor structural")]
    NotSupported(Symbol),
    #[error("tensor list %{0} is not built by prim::ListConstruct")]
    OpaqueList(String),
    #[error("%{0} has no device or rank")]
    IncompleteType(String),
    #[error("%{0} is zero-dimensional")]
    ZeroRank(String),
    #[error("output %{0} is not a tensor")]
    NonTensorOutput(String),
    #[error("tensors live on different devices ({0})")]
    DeviceMismatch(DeviceSet),
    #[error("no tensor carries a device")]
    NoDevice,
    #[error("fusion is disabled on {0}")]
    DeviceDisabled(Device),
    #[error("output %{0} is written in place outside the group")]
    MutatedOutput(String),
    #[error("{kind} between the node and the group writes its input %{value}")]
    MutationBetween { kind: Symbol, value: String },
    #[error("output %{0} is used before the group")]
    UseBeforeAnchor(String),
    #[error("the group would export %{0} without a complete tensor type")]
    IncompleteExport(String),
}

/// Tensor inputs of `node`, with `Tensor[]` inputs built by `prim::ListConstruct` replaced by
/// the list elements.
pub(crate) fn tensor_inputs(
    graph: &Graph,
    node: NodeId,
) -> Result<SmallVec<[ValueId; 4]>, RejectReason> {
    let mut tensors = SmallVec::new();
    let Some(node) = graph.node(node) else {
        return Ok(tensors);
    };
    for &input in &node.inputs {
        match graph.value_type(input) {
            Some(ValueType::Tensor(_)) => tensors.push(input),
            Some(ValueType::TensorList) => {
                let list = graph
                    .producer_of(input)
                    .and_then(|producer| graph.node(producer))
                    .filter(|producer| producer.kind.is(symbols::LIST_CONSTRUCT))
                    .ok_or_else(|| RejectReason::OpaqueList(graph.value_name(input).to_string()))?;
                tensors.extend(
                    list.inputs
                        .iter()
                        .copied()
                        .filter(|&element| matches!(graph.value_type(element), Some(ValueType::Tensor(_)))),
                );
            }
            _ => {}
        }
    }
    Ok(tensors)
}

/// Tensor values a node reads or writes. Opaque lists contribute nothing.
pub(crate) fn touching_tensors(graph: &Graph, node: NodeId) -> SmallVec<[ValueId; 4]> {
    let mut tensors = tensor_inputs(graph, node).unwrap_or_default();
    if let Some(node) = graph.node(node) {
        tensors.extend(
            node.outputs
                .iter()
                .copied()
                .filter(|&output| matches!(graph.value_type(output), Some(ValueType::Tensor(_)))),
        );
    }
    tensors
}

/// Decides whether `node` may join a fusion group on its own merits and returns the device it
/// would run on.
///
/// Inputs need a known device and a known, non-zero rank. Outputs may be unannotated, but a
/// known rank of zero or a conflicting device rejects the node. Mutation comes from the
/// registry, never from operator names.
pub fn check_fusible(
    graph: &Graph,
    registry: &OpRegistry,
    node: NodeId,
) -> Result<Device, RejectReason> {
    let Some(current) = graph.node(node) else {
        return Err(RejectReason::NoDevice);
    };
    if current.kind.is_tensor_expr_group() {
        return Err(RejectReason::AlreadyFused(current.kind.clone()));
    }
    let schema = registry
        .schema(&current.kind)
        .ok_or_else(|| RejectReason::Unregistered(current.kind.clone()))?;
    if schema.mutates_first_operand {
        return Err(RejectReason::Mutating(current.kind.clone()));
    }
    if !schema.is_fusible_class() {
        return Err(RejectReason::NotSupported(current.kind.clone()));
    }

    let mut devices = DeviceSet::new();
    for input in tensor_inputs(graph, node)? {
        let name = || graph.value_name(input).to_string();
        let tensor = graph
            .value_type(input)
            .and_then(ValueType::as_tensor)
            .filter(|tensor| tensor.is_complete())
            .ok_or_else(|| RejectReason::IncompleteType(name()))?;
        if tensor.rank() == Some(0) {
            return Err(RejectReason::ZeroRank(name()));
        }
        if let Some(device) = tensor.device {
            devices.insert(device);
        }
    }

    for &output in &current.outputs {
        match graph.value_type(output) {
            Some(ValueType::Tensor(tensor)) => {
                if tensor.rank() == Some(0) {
                    return Err(RejectReason::ZeroRank(graph.value_name(output).to_string()));
                }
                if let Some(device) = tensor.device {
                    devices.insert(device);
                }
            }
            Some(ValueType::TensorList) => {}
            _ => {
                return Err(RejectReason::NonTensorOutput(
                    graph.value_name(output).to_string(),
                ))
            }
        }
    }

    if devices.is_empty() {
        return Err(RejectReason::NoDevice);
    }
    devices
        .single()
        .ok_or(RejectReason::DeviceMismatch(devices))
}

pub fn is_fusible(graph: &Graph, registry: &OpRegistry, node: NodeId) -> bool {
    check_fusible(graph, registry, node).is_ok()
}
