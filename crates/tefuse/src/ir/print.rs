use std::fmt::{self, Write};

use crate::ir::graph::{Graph, Node, ValueId};
use crate::ir::types::{Dim, TensorType, ValueType};

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.scalar.map(|scalar| scalar.as_str()).unwrap_or("Tensor");
        f.write_str(name)?;
        if self.dims.is_none() && self.device.is_none() {
            return Ok(());
        }
        let mut entries: Vec<String> = match &self.dims {
            Some(dims) => dims.iter().map(format_dim).collect(),
            None => vec!["...".to_string()],
        };
        if let Some(device) = self.device {
            entries.push(format!("device={device}"));
        }
        write!(f, "({})", entries.join(", "))
    }
}

fn format_dim(dim: &Dim) -> String {
    let size = dim
        .size
        .map(|size| size.to_string())
        .unwrap_or_else(|| "*".to_string());
    match dim.stride {
        Some(stride) => format!("{size}:{stride}"),
        None => size,
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(tensor) => fmt::Display::fmt(tensor, f),
            ValueType::TensorList => f.write_str("Tensor[]"),
            ValueType::IntList => f.write_str("int[]"),
            ValueType::Int => f.write_str("int"),
            ValueType::Float => f.write_str("float"),
            ValueType::Bool => f.write_str("bool"),
            ValueType::Str => f.write_str("str"),
            ValueType::NoneType => f.write_str("NoneType"),
        }
    }
}

/// Prints the graph in the format accepted by [`crate::ir::parse_graph`]. Subgraphs of
/// grouping nodes follow the main body as `with <kind> = graph(...)` blocks.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_graph(f, self, "")?;
        for node in self.nodes_in_order() {
            if let Some(subgraph) = &node.subgraph {
                write_graph(f, subgraph, &format!("with {} = ", node.kind))?;
            }
        }
        Ok(())
    }
}

fn write_graph(f: &mut fmt::Formatter<'_>, graph: &Graph, prefix: &str) -> fmt::Result {
    write!(f, "{prefix}graph(")?;
    for (idx, &input) in graph.inputs().iter().enumerate() {
        if idx > 0 {
            f.write_str(",\n      ")?;
        }
        write_binding(f, graph, input)?;
    }
    f.write_str("):\n")?;
    for node in graph.nodes_in_order() {
        f.write_str("  ")?;
        write_node(f, graph, node)?;
        f.write_char('\n')?;
    }
    let outputs: Vec<String> = graph
        .outputs()
        .iter()
        .map(|&value| format!("%{}", graph.value_name(value)))
        .collect();
    writeln!(f, "  return ({})", outputs.join(", "))
}

fn write_binding(f: &mut fmt::Formatter<'_>, graph: &Graph, value: ValueId) -> fmt::Result {
    match graph.value(value) {
        Some(value) => write!(f, "%{} : {}", value.name, value.ty),
        None => write!(f, "%<{value}> : <missing>"),
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, graph: &Graph, node: &Node) -> fmt::Result {
    for (idx, &output) in node.outputs.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write_binding(f, graph, output)?;
    }
    if !node.outputs.is_empty() {
        f.write_char(' ')?;
    }
    write!(f, "= {}", node.kind)?;
    if !node.attrs.is_empty() {
        let attrs: Vec<String> = node
            .attrs
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        write!(f, "[{}]", attrs.join(", "))?;
    }
    let inputs: Vec<String> = node
        .inputs
        .iter()
        .map(|&value| format!("%{}", graph.value_name(value)))
        .collect();
    write!(f, "({})", inputs.join(", "))
}

#[cfg(test)]
mod tests {
    use crate::ir::text::parse_graph;

    const SOURCE: &str = "\
graph(%x : Float(10:1, device=cpu),
      %y : Float(20:1, device=cuda:0)):
  %dim : int = prim::Constant[value=0]()
  %l : Tensor[] = prim::ListConstruct(%x, %y)
  %r : Tensor = aten::cat(%l, %dim)
  %h : Half(*, 4) = aten::neg(%r)
  return (%r)
";

    #[test]
    fn printing_reproduces_the_parsed_text() {
        let graph = parse_graph(SOURCE).unwrap();
        assert_eq!(graph.to_string(), SOURCE);
        let reparsed = parse_graph(&graph.to_string()).unwrap();
        assert_eq!(reparsed, graph);
    }

    #[test]
    fn unknown_rank_with_device_round_trips() {
        let source = "graph(%x : Float(..., device=cuda:1)):\n  return (%x)\n";
        let graph = parse_graph(source).unwrap();
        assert_eq!(graph.to_string(), source);
    }
}
