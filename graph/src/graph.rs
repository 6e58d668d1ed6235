use std::fmt::Display;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use common::id_type;

use crate::data::{DataType, StaticValue};
use crate::function::{Func, FuncId};

id_type!(NodeId);

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum NodeKind {
    /// Produces the caller-provided starting values; never executed.
    GroupInput,
    /// Consumes requested values; never executed.
    GroupOutput,
    #[default]
    Function,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputSocket {
    pub name: String,
    /// `None` marks a control-only socket the evaluator ignores entirely.
    pub data_type: Option<DataType>,
    #[serde(default)]
    pub multi: bool,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub const_value: Option<StaticValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputSocket {
    pub name: String,
    pub data_type: Option<DataType>,
    pub available: bool,
}

/// Internal link of a muted node: values entering `input_idx` leave through
/// `output_idx` unchanged.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Passthrough {
    pub input_idx: usize,
    pub output_idx: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub func_id: FuncId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub muted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputSocket>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputSocket>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passthroughs: Vec<Passthrough>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct InRef {
    pub node: NodeId,
    pub input_idx: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct OutRef {
    pub node: NodeId,
    pub output_idx: usize,
}

/// Either side of a link; origins of an input can be output sockets of other
/// nodes or input sockets whose literal value is read directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum SockRef {
    Input(InRef),
    Output(OutRef),
}

/// A connection between two sockets. The declared order of links defines the
/// fan-in order of multi-inputs; the same origin may be linked several times.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Link {
    pub from: OutRef,
    pub to: InRef,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node has nil id")]
    NilNodeId,
    #[error("Duplicate node id {node_id}")]
    DuplicateNodeId { node_id: NodeId },
    #[error("Function node {node_id} has nil func id")]
    MissingFuncId { node_id: NodeId },
    #[error("Link references unknown node {node_id}")]
    UnknownLinkNode { node_id: NodeId },
    #[error("Link socket index out of range on node {node_id}")]
    LinkSocketOutOfRange { node_id: NodeId },
    #[error("Multiple links into single input {input_idx} of node {node_id}")]
    MultipleLinksToSingleInput { node_id: NodeId, input_idx: usize },
    #[error("Passthrough socket index out of range on node {node_id}")]
    PassthroughOutOfRange { node_id: NodeId },
}

impl SockRef {
    pub fn node(&self) -> NodeId {
        match self {
            SockRef::Input(input) => input.node,
            SockRef::Output(output) => output.node,
        }
    }
}

impl Display for SockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SockRef::Input(input) => write!(f, "{}:in[{}]", input.node, input.input_idx),
            SockRef::Output(output) => write!(f, "{}:out[{}]", output.node, output.output_idx),
        }
    }
}

impl From<InRef> for SockRef {
    fn from(input: InRef) -> SockRef {
        SockRef::Input(input)
    }
}

impl From<OutRef> for SockRef {
    fn from(output: OutRef) -> SockRef {
        SockRef::Output(output)
    }
}

impl Default for Node {
    fn default() -> Self {
        Node {
            id: NodeId::unique(),
            func_id: FuncId::nil(),
            name: "".to_string(),
            kind: NodeKind::Function,
            muted: false,
            inputs: vec![],
            outputs: vec![],
            passthroughs: vec![],
        }
    }
}

impl Node {
    /// Instantiate a node from a func signature, copying its socket
    /// declarations and defaults.
    pub fn from_func(func: &Func) -> Node {
        Node {
            id: NodeId::unique(),
            func_id: func.id,
            name: func.name.clone(),
            kind: NodeKind::Function,
            muted: false,
            inputs: func
                .inputs
                .iter()
                .map(|info| InputSocket {
                    name: info.name.clone(),
                    data_type: info.data_type.clone(),
                    multi: info.multi,
                    available: true,
                    const_value: info.default_value.clone(),
                })
                .collect(),
            outputs: func
                .outputs
                .iter()
                .map(|info| OutputSocket {
                    name: info.name.clone(),
                    data_type: info.data_type.clone(),
                    available: true,
                })
                .collect(),
            passthroughs: vec![],
        }
    }

    pub fn group_input<It>(outputs: It) -> Node
    where
        It: IntoIterator<Item = (&'static str, DataType)>,
    {
        Node {
            name: "group input".to_string(),
            kind: NodeKind::GroupInput,
            outputs: outputs
                .into_iter()
                .map(|(name, data_type)| OutputSocket {
                    name: name.to_string(),
                    data_type: Some(data_type),
                    available: true,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn group_output<It>(inputs: It) -> Node
    where
        It: IntoIterator<Item = (&'static str, DataType)>,
    {
        Node {
            name: "group output".to_string(),
            kind: NodeKind::GroupOutput,
            inputs: inputs
                .into_iter()
                .map(|(name, data_type)| InputSocket {
                    name: name.to_string(),
                    data_type: Some(data_type),
                    multi: false,
                    available: true,
                    const_value: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn in_ref(&self, input_idx: usize) -> InRef {
        assert!(input_idx < self.inputs.len());
        InRef {
            node: self.id,
            input_idx,
        }
    }

    pub fn out_ref(&self, output_idx: usize) -> OutRef {
        assert!(output_idx < self.outputs.len());
        OutRef {
            node: self.id,
            output_idx,
        }
    }
}

impl Graph {
    pub fn add_node(&mut self, node: Node) {
        match self.nodes.iter().position(|n| n.id == node.id) {
            Some(index) => self.nodes[index] = node,
            None => self.nodes.push(node),
        }
    }

    pub fn connect(&mut self, from: OutRef, to: InRef) {
        self.links.push(Link { from, to });
    }

    pub fn node_by_id(&self, id: NodeId) -> Option<&Node> {
        assert!(!id.is_nil());
        self.nodes.iter().find(|node| node.id == id)
    }
    pub fn node_by_id_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        assert!(!id.is_nil());
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }
    pub fn node_by_name_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.name == name)
    }

    pub fn node_index_by_id(&self) -> HashMap<NodeId, usize> {
        let mut map = HashMap::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.iter().enumerate() {
            let prev = map.insert(node.id, index);
            assert!(prev.is_none(), "Duplicate node id detected: {:?}", node.id);
        }
        map
    }

    pub fn links_into(&self, input: InRef) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |link| link.to == input)
    }

    pub fn links_from(&self, output: OutRef) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |link| link.from == output)
    }

    /// Visit the origin sockets that supply `input`, in declared link order,
    /// preserving duplicates. Muted nodes are walked through; an unlinked
    /// muted passthrough yields its own input socket so its literal can be
    /// read directly. An input with no links yields nothing.
    pub fn for_each_origin(&self, input: InRef, mut visit: impl FnMut(SockRef)) {
        for link in self.links_into(input) {
            self.origin_from_output(link.from, &mut visit);
        }
    }

    fn origin_from_output(&self, from: OutRef, visit: &mut dyn FnMut(SockRef)) {
        let node = self
            .node_by_id(from.node)
            .expect("Link references missing node");
        if !node.muted {
            visit(SockRef::Output(from));
            return;
        }
        let Some(passthrough) = node
            .passthroughs
            .iter()
            .find(|p| p.output_idx == from.output_idx)
        else {
            // A muted output without an internal link supplies nothing.
            return;
        };
        let inner = InRef {
            node: node.id,
            input_idx: passthrough.input_idx,
        };
        let mut any_link = false;
        for link in self.links_into(inner) {
            any_link = true;
            self.origin_from_output(link.from, visit);
        }
        if !any_link {
            visit(SockRef::Input(inner));
        }
    }

    /// Visit every final target input reachable from `output` together with
    /// the socket path walked to get there (ending in the target itself).
    /// Muted nodes are passed through along their internal links.
    pub fn for_each_target(&self, output: OutRef, mut visit: impl FnMut(InRef, &[SockRef])) {
        let mut path: Vec<SockRef> = Vec::new();
        self.walk_targets(output, &mut path, &mut visit);
    }

    fn walk_targets(
        &self,
        from: OutRef,
        path: &mut Vec<SockRef>,
        visit: &mut dyn FnMut(InRef, &[SockRef]),
    ) {
        for link in self.links_from(from) {
            let to = link.to;
            let node = self
                .node_by_id(to.node)
                .expect("Link references missing node");
            path.push(SockRef::Input(to));
            if node.muted {
                if let Some(passthrough) = node
                    .passthroughs
                    .iter()
                    .find(|p| p.input_idx == to.input_idx)
                {
                    let inner = OutRef {
                        node: node.id,
                        output_idx: passthrough.output_idx,
                    };
                    path.push(SockRef::Output(inner));
                    self.walk_targets(inner, path, visit);
                    path.pop();
                }
            } else {
                visit(to, path);
            }
            path.pop();
        }
    }

    pub fn to_yaml(&self) -> String {
        serde_yml::to_string(&self).expect("Failed to serialize graph to YAML")
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Graph> {
        let graph: Graph = serde_yml::from_str(yaml)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = hashbrown::HashSet::with_capacity(self.nodes.len());
        for node in self.nodes.iter() {
            if node.id.is_nil() {
                return Err(GraphError::NilNodeId);
            }
            if !seen.insert(node.id) {
                return Err(GraphError::DuplicateNodeId { node_id: node.id });
            }
            if node.kind == NodeKind::Function
                && node.func_id.is_nil()
                && !(node.inputs.is_empty() && node.outputs.is_empty())
            {
                return Err(GraphError::MissingFuncId { node_id: node.id });
            }
            for passthrough in node.passthroughs.iter() {
                if passthrough.input_idx >= node.inputs.len()
                    || passthrough.output_idx >= node.outputs.len()
                {
                    return Err(GraphError::PassthroughOutOfRange { node_id: node.id });
                }
            }
        }

        for link in self.links.iter() {
            let from_node = self
                .node_by_id(link.from.node)
                .ok_or(GraphError::UnknownLinkNode {
                    node_id: link.from.node,
                })?;
            if link.from.output_idx >= from_node.outputs.len() {
                return Err(GraphError::LinkSocketOutOfRange {
                    node_id: from_node.id,
                });
            }
            let to_node = self
                .node_by_id(link.to.node)
                .ok_or(GraphError::UnknownLinkNode {
                    node_id: link.to.node,
                })?;
            if link.to.input_idx >= to_node.inputs.len() {
                return Err(GraphError::LinkSocketOutOfRange {
                    node_id: to_node.id,
                });
            }
            if !to_node.inputs[link.to.input_idx].multi {
                let incoming = self.links_into(link.to).count();
                if incoming > 1 {
                    return Err(GraphError::MultipleLinksToSingleInput {
                        node_id: to_node.id,
                        input_idx: link.to.input_idx,
                    });
                }
            }
        }

        Ok(())
    }
}
