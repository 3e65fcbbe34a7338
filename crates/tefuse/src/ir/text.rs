use std::collections::HashMap;

use thiserror::Error;

use crate::ir::graph::{Attribute, Graph, GraphError, NodeSpec, ValueId};
use crate::ir::ops::Symbol;
use crate::ir::types::{Device, Dim, ScalarType, TensorType, ValueType};
use crate::refcount::Ref;

/// Errors raised while parsing the text graph format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextIrError {
    #[error("line {line}: {message}")]
    At { line: usize, message: String },
    #[error("{0}")]
    Message(String),
}

impl TextIrError {
    fn at(line: usize, message: impl Into<String>) -> Self {
        TextIrError::At {
            line,
            message: message.into(),
        }
    }

    fn new(message: impl Into<String>) -> Self {
        TextIrError::Message(message.into())
    }
}

/// Parses a graph written in the TorchScript-like text format.
///
/// # Example
/// ```
/// use tefuse::ir::parse_graph;
///
/// let graph = parse_graph(r#"
/// graph(%x : Float(4:1, device=cpu)):
///   %y : Float(4:1, device=cpu) = aten::relu(%x)
///   return (%y)
/// "#).expect("valid graph");
/// assert_eq!(graph.len(), 1);
/// assert_eq!(graph.outputs().len(), 1);
/// ```
pub fn parse_graph(src: &str) -> Result<Graph, TextIrError> {
    parse_graph_with_names(src).map(|parsed| parsed.graph)
}

/// Parses a graph and keeps the mapping from text names to value ids of the outer graph.
pub fn parse_graph_with_names(src: &str) -> Result<ParsedGraph, TextIrError> {
    Parser::new(src).parse()
}

#[derive(Debug, Clone)]
pub struct ParsedGraph {
    pub graph: Graph,
    pub value_names: HashMap<String, ValueId>,
}

impl ParsedGraph {
    pub fn value(&self, name: &str) -> Option<ValueId> {
        self.value_names.get(normalize_value_name(name)).copied()
    }
}

struct Line<'a> {
    number: usize,
    text: &'a str,
}

struct Parser<'a> {
    lines: Vec<Line<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        let lines = source
            .lines()
            .enumerate()
            .map(|(idx, raw)| Line {
                number: idx + 1,
                text: strip_comment(raw).trim(),
            })
            .filter(|line| !line.text.is_empty())
            .collect();
        Self { lines, pos: 0 }
    }

    fn parse(mut self) -> Result<ParsedGraph, TextIrError> {
        if self.lines.is_empty() {
            return Err(TextIrError::new("input is empty"));
        }
        let (line, header) = self.take_header()?;
        let params = header
            .strip_prefix("graph")
            .ok_or_else(|| TextIrError::at(line, "graph header must start with `graph(`"))?;
        let (mut graph, value_names) = self.parse_graph_block(line, params)?;

        while self.pos < self.lines.len() {
            let (line, header) = self.take_header()?;
            let rest = header.strip_prefix("with ").ok_or_else(|| {
                TextIrError::at(line, "expected `with <kind> = graph(...)` after `return`")
            })?;
            let (kind, body) = rest
                .split_once('=')
                .ok_or_else(|| TextIrError::at(line, "subgraph header is missing `=`"))?;
            let kind = Symbol::new(kind.trim());
            let params = body
                .trim()
                .strip_prefix("graph")
                .ok_or_else(|| TextIrError::at(line, "subgraph must start with `graph(`"))?;
            let (subgraph, _) = self.parse_graph_block(line, params)?;
            attach_subgraph(&mut graph, &kind, subgraph)
                .map_err(|message| TextIrError::at(line, message))?;
        }

        let next_group = graph
            .nodes_in_order()
            .filter_map(|node| node.kind.group_index())
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);
        graph.set_next_group_index(next_group);

        Ok(ParsedGraph { graph, value_names })
    }

    /// Collects a possibly multi-line header up to the parenthesis closing its parameter list.
    fn take_header(&mut self) -> Result<(usize, String), TextIrError> {
        let start = self.lines[self.pos].number;
        let mut header = String::new();
        let mut depth = 0isize;
        let mut opened = false;
        while let Some(line) = self.lines.get(self.pos) {
            self.pos += 1;
            if !header.is_empty() {
                header.push(' ');
            }
            header.push_str(line.text);
            for ch in line.text.chars() {
                match ch {
                    '(' => {
                        depth += 1;
                        opened = true;
                    }
                    ')' => depth -= 1,
                    _ => {}
                }
            }
            if opened && depth <= 0 {
                return Ok((start, header));
            }
        }
        Err(TextIrError::at(start, "unterminated graph header"))
    }

    /// Parses `(<params>):` followed by statements up to and including `return`.
    fn parse_graph_block(
        &mut self,
        header_line: usize,
        params: &str,
    ) -> Result<(Graph, HashMap<String, ValueId>), TextIrError> {
        let params = params.trim();
        if !params.starts_with('(') {
            return Err(TextIrError::at(header_line, "missing `(` in graph header"));
        }
        let close = find_matching(params, 0, '(', ')')
            .ok_or_else(|| TextIrError::at(header_line, "missing `)` in graph header"))?;
        if params[close + 1..].trim() != ":" {
            return Err(TextIrError::at(
                header_line,
                "graph header must end with `):`",
            ));
        }

        let mut graph = Graph::new();
        let mut names: HashMap<String, ValueId> = HashMap::new();
        for param in split_top_level(&params[1..close], ',') {
            let (name, ty) = parse_binding(param).map_err(|msg| TextIrError::at(header_line, msg))?;
            if names.contains_key(&name) {
                return Err(TextIrError::at(
                    header_line,
                    format!("duplicate definition of `%{name}`"),
                ));
            }
            let id = graph.add_input(name.clone(), ty);
            names.insert(name, id);
        }

        while let Some(line) = self.lines.get(self.pos) {
            self.pos += 1;
            let number = line.number;
            if let Some(rest) = line.text.strip_prefix("return") {
                for name in parse_value_list(rest).map_err(|msg| TextIrError::at(number, msg))? {
                    let id = lookup(&names, &name).map_err(|msg| TextIrError::at(number, msg))?;
                    graph
                        .register_output(id)
                        .map_err(|err| TextIrError::at(number, err.to_string()))?;
                }
                return Ok((graph, names));
            }
            parse_statement(&mut graph, &mut names, line.text)
                .map_err(|msg| TextIrError::at(number, msg))?;
        }
        Err(TextIrError::at(header_line, "graph is missing `return`"))
    }
}

fn attach_subgraph(graph: &mut Graph, kind: &Symbol, subgraph: Graph) -> Result<(), String> {
    let targets: Vec<_> = graph
        .nodes_in_order()
        .filter(|node| &node.kind == kind && node.subgraph.is_none())
        .map(|node| node.id)
        .collect();
    if targets.is_empty() {
        return Err(format!("no `{kind}` node to attach the subgraph to"));
    }
    let shared = Ref::new(subgraph);
    for id in targets {
        if let Some(node) = graph.node_mut(id) {
            node.subgraph = Some(shared.clone());
        }
    }
    Ok(())
}

fn parse_statement(
    graph: &mut Graph,
    names: &mut HashMap<String, ValueId>,
    text: &str,
) -> Result<(), String> {
    let eq = find_top_level(text, '=')
        .ok_or_else(|| "statements must be of the form `%out : T = op(...)`".to_string())?;
    let (lhs, rhs) = (text[..eq].trim(), text[eq + 1..].trim());

    let mut spec = parse_call(rhs, names)?;
    let mut defined = Vec::new();
    for binding in split_top_level(lhs, ',') {
        let (name, ty) = parse_binding(binding)?;
        if names.contains_key(&name) || defined.contains(&name) {
            return Err(format!("duplicate definition of `%{name}`"));
        }
        defined.push(name.clone());
        spec = spec.output(name, ty);
    }

    let node = graph.append_node(spec).map_err(|err: GraphError| err.to_string())?;
    let outputs = graph
        .node(node)
        .map(|node| node.outputs.clone())
        .unwrap_or_default();
    for (name, id) in defined.into_iter().zip(outputs) {
        names.insert(name, id);
    }
    Ok(())
}

/// Parses `ns::op[attr=value, ...](%a, %b)`.
fn parse_call(src: &str, names: &HashMap<String, ValueId>) -> Result<NodeSpec, String> {
    let end = src
        .find(|ch: char| ch == '[' || ch == '(' || ch.is_whitespace())
        .ok_or_else(|| format!("operator `{src}` is missing its operand list"))?;
    let kind = src[..end].trim();
    if kind.is_empty() {
        return Err("operator name cannot be empty".to_string());
    }
    let mut spec = NodeSpec::new(kind);
    let mut rest = src[end..].trim_start();

    if rest.starts_with('[') {
        let close =
            find_matching(rest, 0, '[', ']').ok_or_else(|| "unmatched `[` in attributes".to_string())?;
        for entry in split_top_level(&rest[1..close], ',') {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| format!("attribute `{entry}` must be `name=value`"))?;
            spec = spec.attr(key.trim(), parse_attribute(value.trim()));
        }
        rest = rest[close + 1..].trim_start();
    }

    if !rest.starts_with('(') {
        return Err(format!("operator `{kind}` is missing its operand list"));
    }
    let close =
        find_matching(rest, 0, '(', ')').ok_or_else(|| "unmatched `(` in operands".to_string())?;
    if !rest[close + 1..].trim().is_empty() {
        return Err(format!(
            "unexpected trailing input `{}`",
            rest[close + 1..].trim()
        ));
    }
    for operand in split_top_level(&rest[1..close], ',') {
        spec = spec.input(lookup(names, operand)?);
    }
    Ok(spec)
}

fn parse_attribute(src: &str) -> Attribute {
    if let Some(inner) = src.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Attribute::Str(inner.to_string());
    }
    match src {
        "true" | "True" => return Attribute::Bool(true),
        "false" | "False" => return Attribute::Bool(false),
        _ => {}
    }
    if let Ok(value) = src.parse::<i64>() {
        return Attribute::Int(value);
    }
    if let Ok(value) = src.parse::<f64>() {
        return Attribute::Float(value);
    }
    Attribute::Str(src.to_string())
}

/// Parses `%name : Type`.
fn parse_binding(src: &str) -> Result<(String, ValueType), String> {
    let (name, ty) = src
        .split_once(':')
        .ok_or_else(|| format!("binding `{src}` must be `%name : Type`"))?;
    let name = name.trim();
    if !name.starts_with('%') || name.len() == 1 {
        return Err(format!("invalid value name `{name}`"));
    }
    Ok((normalize_value_name(name).to_string(), parse_type(ty)?))
}

fn parse_value_list(src: &str) -> Result<Vec<String>, String> {
    let inner = src
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| "`return` expects a parenthesised value list".to_string())?;
    Ok(split_top_level(inner, ',')
        .into_iter()
        .map(|name| normalize_value_name(name).to_string())
        .collect())
}

fn lookup(names: &HashMap<String, ValueId>, name: &str) -> Result<ValueId, String> {
    names
        .get(normalize_value_name(name))
        .copied()
        .ok_or_else(|| format!("unknown value `{}`", name.trim()))
}

pub(crate) fn parse_type(src: &str) -> Result<ValueType, String> {
    let trimmed = src.trim();
    let simple = match trimmed {
        "Tensor" => Some(ValueType::Tensor(TensorType::unknown())),
        "Tensor[]" => Some(ValueType::TensorList),
        "int[]" => Some(ValueType::IntList),
        "int" => Some(ValueType::Int),
        "float" => Some(ValueType::Float),
        "bool" => Some(ValueType::Bool),
        "str" => Some(ValueType::Str),
        "NoneType" => Some(ValueType::NoneType),
        _ => None,
    };
    if let Some(ty) = simple {
        return Ok(ty);
    }

    let (name, body) = match trimmed.find('(') {
        Some(open) => {
            let body = trimmed[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| format!("unterminated type `{trimmed}`"))?;
            (&trimmed[..open], Some(body))
        }
        None => (trimmed, None),
    };
    let scalar = match name {
        "Tensor" => None,
        other => Some(
            ScalarType::from_name(other).ok_or_else(|| format!("unknown type `{trimmed}`"))?,
        ),
    };
    let Some(body) = body else {
        return Ok(ValueType::Tensor(TensorType {
            scalar,
            dims: None,
            device: None,
        }));
    };

    let mut dims = Vec::new();
    let mut unknown_rank = false;
    let mut device = None;
    for entry in split_top_level(body, ',') {
        if entry == "..." {
            unknown_rank = true;
        } else if let Some(value) = entry.strip_prefix("device=") {
            device = Some(value.parse::<Device>().map_err(|err| err.to_string())?);
        } else if entry.contains('=') {
            return Err(format!("unsupported tensor type entry `{entry}`"));
        } else {
            dims.push(parse_dim(entry)?);
        }
    }
    if unknown_rank && !dims.is_empty() {
        return Err(format!("`...` cannot be mixed with dimensions in `{trimmed}`"));
    }
    Ok(ValueType::Tensor(TensorType {
        scalar,
        dims: (!unknown_rank).then_some(dims),
        device,
    }))
}

fn parse_dim(src: &str) -> Result<Dim, String> {
    let (size, stride) = match src.split_once(':') {
        Some((size, stride)) => (size, Some(stride)),
        None => (src, None),
    };
    let parse_part = |part: &str| -> Result<Option<usize>, String> {
        match part.trim() {
            "*" => Ok(None),
            digits => digits
                .parse::<usize>()
                .map(Some)
                .map_err(|_| format!("invalid dimension `{src}`")),
        }
    };
    Ok(Dim {
        size: parse_part(size)?,
        stride: stride.map(parse_part).transpose()?.flatten(),
    })
}

fn normalize_value_name(name: &str) -> &str {
    name.trim().trim_start_matches('%')
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            c if c == delimiter && depth == 0 => {
                let piece = input[start..idx].trim();
                if !piece.is_empty() {
                    pieces.push(piece);
                }
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    let tail = input[start..].trim();
    if !tail.is_empty() {
        pieces.push(tail);
    }
    pieces
}

fn find_top_level(input: &str, target: char) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            c if c == target && depth == 0 => return Some(idx),
            _ => {}
        }
    }
    None
}

fn find_matching(src: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0isize;
    for (idx, ch) in src[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(start + idx);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_types_cover_all_annotation_forms() {
        let ty = parse_type("Float(128:1, device=cpu)").unwrap();
        let tensor = ty.as_tensor().unwrap();
        assert_eq!(tensor.scalar, Some(ScalarType::Float));
        assert_eq!(tensor.dims, Some(vec![Dim::with_stride(128, 1)]));
        assert_eq!(tensor.device, Some(Device::Cpu));

        let zero_dim = parse_type("Float(device=cuda)").unwrap();
        assert_eq!(zero_dim.as_tensor().unwrap().rank(), Some(0));
        assert_eq!(zero_dim.as_tensor().unwrap().device, Some(Device::Cuda(0)));

        let unknown_rank = parse_type("Double(..., device=cuda:1)").unwrap();
        assert_eq!(unknown_rank.as_tensor().unwrap().rank(), None);

        let bare = parse_type("Long").unwrap();
        assert_eq!(bare.as_tensor().unwrap().scalar, Some(ScalarType::Long));
        assert!(bare.as_tensor().unwrap().dims.is_none());

        let star = parse_type("Float(*, 3:*)").unwrap();
        assert_eq!(
            star.as_tensor().unwrap().dims,
            Some(vec![Dim::unknown(), Dim::new(3)])
        );

        assert_eq!(parse_type("Tensor[]").unwrap(), ValueType::TensorList);
        assert!(parse_type("Quaternion(3)").is_err());
        assert!(parse_type("Float(3, requires_grad=1)").is_err());
    }

    #[test]
    fn statements_split_at_the_top_level_equals() {
        let parsed = parse_graph_with_names(
            r#"
            graph(%0 : Float(8:1, device=cpu)):  # header
              %c : int = prim::Constant[value=1]()
              %s : str = prim::Constant[value="a=b"]()
              %2.1 : Float(8:1, device=cpu) = aten::add(%0, %0, %c)
              return (%2.1)
            "#,
        )
        .unwrap();
        let graph = &parsed.graph;
        assert_eq!(graph.len(), 3);
        let ids = graph.node_ids();
        assert_eq!(
            graph.node(ids[0]).unwrap().attr("value"),
            Some(&Attribute::Int(1))
        );
        assert_eq!(
            graph.node(ids[1]).unwrap().attr("value"),
            Some(&Attribute::Str("a=b".to_string()))
        );
        assert_eq!(graph.outputs(), &[parsed.value("%2.1").unwrap()]);
    }

    #[test]
    fn unknown_values_report_their_line() {
        let err = parse_graph(
            "graph(%x : Tensor):\n  %y : Tensor = aten::relu(%z)\n  return (%y)\n",
        )
        .unwrap_err();
        assert_eq!(
            err,
            TextIrError::At {
                line: 2,
                message: "unknown value `%z`".to_string()
            }
        );
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let err = parse_graph(
            "graph(%x : Tensor):\n  %x : Tensor = aten::relu(%x)\n  return (%x)\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate definition of `%x`"));
    }

    #[test]
    fn missing_return_is_an_error() {
        let err = parse_graph("graph(%x : Tensor):\n  %y : Tensor = aten::relu(%x)\n").unwrap_err();
        assert!(err.to_string().contains("missing `return`"));
    }

    #[test]
    fn with_blocks_attach_subgraphs_and_advance_the_group_counter() {
        let mut graph = parse_graph(
            r#"
            graph(%x : Float(4:1, device=cpu)):
              %y : Float(4:1, device=cpu) = prim::TensorExprGroup_3(%x)
              return (%y)
            with prim::TensorExprGroup_3 = graph(%a : Float(4:1, device=cpu)):
              %b : Float(4:1, device=cpu) = aten::relu(%a)
              return (%b)
            "#,
        )
        .unwrap();
        let node = graph.nodes_in_order().next().unwrap();
        let subgraph = node.subgraph.as_ref().unwrap();
        assert_eq!(subgraph.len(), 1);
        assert_eq!(graph.next_group_index(), 4);
    }
}
