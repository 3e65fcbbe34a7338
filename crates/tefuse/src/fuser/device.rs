use std::fmt;

use smallvec::SmallVec;

use crate::fuser::fusible::touching_tensors;
use crate::ir::{Device, Graph, NodeId};

/// Distinct devices seen on a set of tensor values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSet {
    devices: SmallVec<[Device; 2]>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: Device) {
        if !self.devices.contains(&device) {
            self.devices.push(device);
        }
    }

    pub fn extend(&mut self, other: &DeviceSet) {
        for &device in &other.devices {
            self.insert(device);
        }
    }

    /// At most one distinct device.
    pub fn is_consistent(&self) -> bool {
        self.devices.len() <= 1
    }

    /// The device, when exactly one was seen.
    pub fn single(&self) -> Option<Device> {
        match self.devices.as_slice() {
            [device] => Some(*device),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Device> + '_ {
        self.devices.iter().copied()
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, device) in self.devices.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{device}")?;
        }
        Ok(())
    }
}

/// Known devices of every tensor value touching `node`. Unknown devices are wildcards.
pub fn devices_of(graph: &Graph, node: NodeId) -> DeviceSet {
    let mut set = DeviceSet::new();
    for value in touching_tensors(graph, node) {
        if let Some(device) = graph
            .value_type(value)
            .and_then(|ty| ty.as_tensor())
            .and_then(|tensor| tensor.device)
        {
            set.insert(device);
        }
    }
    set
}

/// Whether the nodes of `a` and `b` could run in one kernel: all devices they touch agree.
///
/// Symmetric: merging `a` into `b` and `b` into `a` give the same answer.
pub fn devices_consistent(graph: &Graph, a: &[NodeId], b: &[NodeId]) -> bool {
    let mut set = DeviceSet::new();
    for &node in a.iter().chain(b) {
        set.extend(&devices_of(graph, node));
        if !set.is_consistent() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_graph;

    const MIXED: &str = r#"
        graph(%x : Float(10:1, device=cpu),
              %y : Float(20:1, device=cpu),
              %z : Float(10:1, device=cuda:0)):
          %dim : int = prim::Constant[value=0]()
          %xy_list : Tensor[] = prim::ListConstruct(%x, %y)
          %xy_cat : Float(30:1, device=cpu) = aten::cat(%xy_list, %dim)
          %z2 : Float(10:1, device=cuda:0) = aten::mul(%z, %z)
          %w : Tensor = aten::relu(%xy_cat)
          return (%xy_cat, %z2, %w)
    "#;

    #[test]
    fn list_inputs_are_looked_through() {
        let graph = parse_graph(MIXED).unwrap();
        let cat = graph.node_ids()[2];
        assert_eq!(devices_of(&graph, cat).single(), Some(Device::Cpu));
    }

    #[test]
    fn consistency_is_symmetric() {
        let graph = parse_graph(MIXED).unwrap();
        let ids = graph.node_ids();
        let (cat, mul, relu) = (ids[2], ids[3], ids[4]);
        assert!(!devices_consistent(&graph, &[cat], &[mul]));
        assert!(!devices_consistent(&graph, &[mul], &[cat]));
        assert!(devices_consistent(&graph, &[cat], &[relu]));
        assert!(devices_consistent(&graph, &[relu], &[cat]));
        assert!(!devices_consistent(&graph, &[relu, cat], &[mul]));
    }

    #[test]
    fn distinct_cuda_indices_conflict() {
        let mut set = DeviceSet::new();
        set.insert(Device::Cuda(0));
        set.insert(Device::Cuda(0));
        assert_eq!(set.single(), Some(Device::Cuda(0)));
        set.insert(Device::Cuda(1));
        assert!(!set.is_consistent());
        assert_eq!(set.to_string(), "cuda:0, cuda:1");
    }
}
