use std::collections::HashSet;

use thiserror::Error;

use crate::ir::graph::{Graph, NodeId, ValueId};
use crate::ir::ops::Symbol;

/// Structural defects found by [`Graph::lint`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LintError {
    #[error("node {node} ({kind}) references value {value}, which does not exist")]
    UnknownValue {
        node: NodeId,
        kind: Symbol,
        value: ValueId,
    },
    #[error("graph input {0} does not exist")]
    UnknownInput(ValueId),
    #[error("%{value} is used by {kind} before it is defined")]
    UseBeforeDefinition { value: String, kind: Symbol },
    #[error("%{value} is defined more than once")]
    DuplicateDefinition { value: String },
    #[error("%{value} does not point back at its defining node")]
    ProducerMismatch { value: String },
    #[error("graph output %{value} is never defined")]
    UndefinedOutput { value: String },
    #[error("node order references missing node {0}")]
    MissingNode(NodeId),
    #[error("node {0} appears twice in the node order")]
    DuplicateNode(NodeId),
    #[error("{kind} has {node} {what} but its subgraph has {subgraph}")]
    SubgraphArity {
        kind: Symbol,
        what: &'static str,
        node: usize,
        subgraph: usize,
    },
    #[error("subgraph of {kind} is malformed: {source}")]
    Subgraph {
        kind: Symbol,
        #[source]
        source: Box<LintError>,
    },
}

impl Graph {
    /// Checks SSA structure: definitions precede uses, every value is defined once and points at
    /// its producer, outputs are defined. Subgraphs are checked recursively and must match their
    /// node's input and output counts.
    pub fn lint(&self) -> Result<(), LintError> {
        let mut defined: HashSet<ValueId> = HashSet::new();
        let mut seen_nodes: HashSet<NodeId> = HashSet::new();

        for &input in self.inputs() {
            let value = self.value(input).ok_or(LintError::UnknownInput(input))?;
            if value.producer.is_some() {
                return Err(LintError::ProducerMismatch {
                    value: value.name.clone(),
                });
            }
            if !defined.insert(input) {
                return Err(LintError::DuplicateDefinition {
                    value: value.name.clone(),
                });
            }
        }

        for &id in self.node_ids() {
            if !seen_nodes.insert(id) {
                return Err(LintError::DuplicateNode(id));
            }
            let node = self.node(id).ok_or(LintError::MissingNode(id))?;
            for &input in &node.inputs {
                let value = self.value(input).ok_or_else(|| LintError::UnknownValue {
                    node: id,
                    kind: node.kind.clone(),
                    value: input,
                })?;
                if !defined.contains(&input) {
                    return Err(LintError::UseBeforeDefinition {
                        value: value.name.clone(),
                        kind: node.kind.clone(),
                    });
                }
            }
            for (offset, &output) in node.outputs.iter().enumerate() {
                let value = self.value(output).ok_or_else(|| LintError::UnknownValue {
                    node: id,
                    kind: node.kind.clone(),
                    value: output,
                })?;
                if value.producer != Some((id, offset)) {
                    return Err(LintError::ProducerMismatch {
                        value: value.name.clone(),
                    });
                }
                if !defined.insert(output) {
                    return Err(LintError::DuplicateDefinition {
                        value: value.name.clone(),
                    });
                }
            }
            if let Some(subgraph) = &node.subgraph {
                for (what, outer, inner) in [
                    ("inputs", node.inputs.len(), subgraph.inputs().len()),
                    ("outputs", node.outputs.len(), subgraph.outputs().len()),
                ] {
                    if outer != inner {
                        return Err(LintError::SubgraphArity {
                            kind: node.kind.clone(),
                            what,
                            node: outer,
                            subgraph: inner,
                        });
                    }
                }
                subgraph.lint().map_err(|source| LintError::Subgraph {
                    kind: node.kind.clone(),
                    source: Box::new(source),
                })?;
            }
        }

        for &output in self.outputs() {
            if !defined.contains(&output) {
                return Err(LintError::UndefinedOutput {
                    value: self.value_name(output).to_string(),
                });
            }
        }
        Ok(())
    }
}
