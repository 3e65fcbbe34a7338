use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::FuserError;
use crate::fuser::config::{DeviceGate, FuserConfig};
use crate::fuser::device::{devices_consistent, devices_of};
use crate::fuser::fusible::{check_fusible, tensor_inputs, RejectReason};
use crate::fuser::group::FusionGroup;
use crate::fuser::rewrite::materialize_group;
use crate::ir::{Device, Graph, GraphIndex, NodeId, OpRegistry, ValueType};
use crate::passes::{DeadCodeElimination, GraphPass, PassResult};

/// Groups fusible tensor operations into `prim::TensorExprGroup_<n>` nodes.
///
/// Nodes are visited consumers-first. Each unvisited fusible node seeds a group that absorbs
/// its producers until nothing more qualifies; groups smaller than
/// [`FuserConfig::min_group_size`] are dropped and their nodes stay in place.
pub struct TensorExprFuser {
    config: FuserConfig,
    registry: Arc<OpRegistry>,
}

impl TensorExprFuser {
    const NAME: &'static str = "tensorexpr-fuser";

    pub fn new(config: FuserConfig) -> Self {
        Self::with_registry(config, OpRegistry::global())
    }

    pub fn with_registry(config: FuserConfig, registry: Arc<OpRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &FuserConfig {
        &self.config
    }

    fn fuse(&self, graph: &mut Graph) -> Result<PassResult, FuserError> {
        self.config.validate()?;
        graph.lint()?;

        let mut result = PassResult::default();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let snapshot: Vec<NodeId> = graph.node_ids().to_vec();
        // Only materializing a group rewrites the graph; the index is rebuilt after that.
        let mut index = GraphIndex::build(graph, &self.registry);

        for &seed in snapshot.iter().rev() {
            if graph.node(seed).is_none() || !visited.insert(seed) {
                continue;
            }
            let device = match self.check_seed(graph, seed) {
                Ok(device) => device,
                Err(reason) => {
                    trace!(node = %seed, %reason, "not starting a group");
                    continue;
                }
            };

            let Some(position) = index.position(seed) else {
                continue;
            };
            let mut group = FusionGroup::new(seed, position, device);
            let exports = group.exports(graph, &index);
            if let Some(&value) = exports
                .iter()
                .find(|&&value| !matches!(graph.value_type(value), Some(ValueType::Tensor(_))))
            {
                trace!(node = %seed, value = graph.value_name(value), "seed exports a non-tensor");
                continue;
            }

            self.grow(graph, &index, &mut group, &visited);
            visited.extend(group.members());

            if group.len() < self.config.min_group_size {
                debug!(
                    anchor = %seed,
                    size = group.len(),
                    min = self.config.min_group_size,
                    "group below minimum size"
                );
                result.rejected_small += 1;
                continue;
            }

            let size = group.len();
            let node = materialize_group(graph, &index, &group)?;
            index = GraphIndex::build(graph, &self.registry);
            debug!(
                kind = %graph.node(node).map(|n| n.kind.to_string()).unwrap_or_default(),
                size,
                device = %group.device(),
                "created fusion group"
            );
            result.changed = true;
            result.groups_created += 1;
            result.nodes_fused += size;
        }

        Ok(result)
    }

    fn check_seed(&self, graph: &Graph, seed: NodeId) -> Result<Device, RejectReason> {
        let device = check_fusible(graph, &self.registry, seed)?;
        if !self.config.can_fuse_on_device(device) {
            return Err(RejectReason::DeviceDisabled(device));
        }
        Ok(device)
    }

    /// Absorbs producers of the group's inputs until a full sweep adds nothing.
    fn grow(
        &self,
        graph: &Graph,
        index: &GraphIndex,
        group: &mut FusionGroup,
        visited: &HashSet<NodeId>,
    ) {
        loop {
            let mut candidates: Vec<(usize, NodeId)> = group
                .boundary_inputs(graph)
                .into_iter()
                .filter_map(|value| graph.producer_of(value))
                .filter(|producer| !group.contains(*producer) && !visited.contains(producer))
                .filter_map(|producer| index.position(producer).map(|pos| (pos, producer)))
                .collect();
            candidates.sort_unstable_by(|a, b| b.cmp(a));
            candidates.dedup();

            let mut absorbed = false;
            for (position, candidate) in candidates {
                if group.contains(candidate) {
                    continue;
                }
                match self.can_absorb(graph, index, group, candidate, position) {
                    Ok(()) => {
                        trace!(node = %candidate, anchor = %group.anchor(), "absorbed");
                        group.add(candidate, position);
                        absorbed = true;
                    }
                    Err(reason) => trace!(node = %candidate, %reason, "not absorbed"),
                }
            }
            if !absorbed {
                break;
            }
        }
    }

    fn can_absorb(
        &self,
        graph: &Graph,
        index: &GraphIndex,
        group: &FusionGroup,
        candidate: NodeId,
        position: usize,
    ) -> Result<(), RejectReason> {
        let device = check_fusible(graph, &self.registry, candidate)?;
        if !self.config.can_fuse_on_device(device) {
            return Err(RejectReason::DeviceDisabled(device));
        }
        if !devices_consistent(graph, &group.members(), &[candidate]) {
            let mut devices = devices_of(graph, candidate);
            devices.insert(group.device());
            return Err(RejectReason::DeviceMismatch(devices));
        }

        let Some(node) = graph.node(candidate) else {
            return Err(RejectReason::NoDevice);
        };
        let anchor_pos = group.anchor_position();

        // The candidate moves down to the anchor: nothing may observe its results earlier, and
        // nothing in between may write what it reads or writes.
        for &output in &node.outputs {
            if index
                .mutators(output)
                .iter()
                .any(|&writer| !group.contains(writer))
            {
                return Err(RejectReason::MutatedOutput(
                    graph.value_name(output).to_string(),
                ));
            }
            let early_use = index.users(output).iter().any(|&user| {
                !group.contains(user)
                    && index
                        .position(user)
                        .map(|pos| pos < anchor_pos)
                        .unwrap_or(false)
            });
            if early_use {
                return Err(RejectReason::UseBeforeAnchor(
                    graph.value_name(output).to_string(),
                ));
            }
        }

        let reads: Vec<_> = node
            .inputs
            .iter()
            .copied()
            .chain(tensor_inputs(graph, candidate).unwrap_or_default())
            .collect();
        for &between in index.between(position, anchor_pos) {
            if !index.is_mutating(between) || group.contains(between) {
                continue;
            }
            let Some(writer) = graph.node(between) else {
                continue;
            };
            let Some(&target) = writer.inputs.first() else {
                continue;
            };
            if let Some(&read) = reads.iter().find(|&&read| index.may_alias(read, target)) {
                return Err(RejectReason::MutationBetween {
                    kind: writer.kind.clone(),
                    value: graph.value_name(read).to_string(),
                });
            }
        }

        for value in group.exports_with(graph, index, Some(candidate)) {
            let complete = graph
                .value_type(value)
                .and_then(ValueType::as_tensor)
                .map(|tensor| tensor.is_complete())
                .unwrap_or(false);
            if !complete {
                return Err(RejectReason::IncompleteExport(
                    graph.value_name(value).to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl GraphPass for TensorExprFuser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult, FuserError> {
        self.fuse(graph)
    }
}

/// Runs the fuser over `graph` and removes the nodes it leaves dead.
///
/// The graph is linted first; a malformed graph is returned as an error untouched.
pub fn fuse_tensor_exprs(graph: &mut Graph, config: &FuserConfig) -> Result<PassResult, FuserError> {
    let fused = TensorExprFuser::new(*config).run(graph)?;
    let cleaned = DeadCodeElimination::default().run(graph)?;
    Ok(fused.merge(cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{parse_graph, OpClass, OperatorSchema};

    fn cpu(min_group_size: usize) -> FuserConfig {
        FuserConfig::default()
            .with_cpu_fusion(true)
            .with_min_group_size(min_group_size)
    }

    #[test]
    fn chain_collapses_into_one_group() {
        let mut graph = parse_graph(
            r#"
            graph(%x : Float(8:1, device=cpu)):
              %a : Float(8:1, device=cpu) = aten::neg(%x)
              %b : Float(8:1, device=cpu) = aten::exp(%a)
              %c : Float(8:1, device=cpu) = aten::relu(%b)
              return (%c)
            "#,
        )
        .unwrap();
        let result = TensorExprFuser::new(cpu(2)).run(&mut graph).unwrap();
        assert_eq!(result.groups_created, 1);
        assert_eq!(result.nodes_fused, 3);
        assert_eq!(graph.len(), 1);
        let group = graph.nodes_in_order().next().unwrap();
        assert_eq!(group.kind.as_str(), "prim::TensorExprGroup_0");
        assert_eq!(group.subgraph.as_ref().unwrap().len(), 3);
        assert_eq!(graph.lint(), Ok(()));
    }

    #[test]
    fn zero_min_group_size_is_a_config_error() {
        let mut graph = Graph::new();
        let err = TensorExprFuser::new(cpu(0)).run(&mut graph).unwrap_err();
        assert!(matches!(err, FuserError::Config(_)));
    }

    #[test]
    fn custom_registry_controls_barriers() {
        let src = r#"
            graph(%x : Float(8:1, device=cuda:0)):
              %a : Float(8:1, device=cuda:0) = aten::neg(%x)
              %b : Float(8:1, device=cuda:0) = aten::exp(%a)
              return (%b)
        "#;
        let mut registry = OpRegistry::with_aten();
        registry.register(
            "aten::exp",
            OperatorSchema::in_place(OpClass::Elementwise),
        );
        let mut graph = parse_graph(src).unwrap();
        let fuser = TensorExprFuser::with_registry(FuserConfig::default(), Arc::new(registry));
        let result = fuser.run(&mut graph).unwrap();
        assert!(!result.changed);
        assert_eq!(result.rejected_small, 1);
    }
}
