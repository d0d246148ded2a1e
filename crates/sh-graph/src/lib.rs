#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use sh_core::{ConcreteShape, ElementPrecision, ShapeError, SymbolicShape};
use sh_kernel_cpu::{KernelError, dims_to_i32};

pub const INPUT_MEMORY_FORMATS: &str = "InputMemoryFormats";
pub const OUTPUT_MEMORY_FORMATS: &str = "OutputMemoryFormats";
pub const PRIMITIVES_PRIORITY: &str = "PrimitivesPriority";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeOp {
    Parameter {
        precision: ElementPrecision,
        shape: SymbolicShape,
    },
    ShapeOf {
        input: NodeId,
        output_type: ElementPrecision,
    },
}

impl NodeOp {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Parameter { .. } => "Parameter",
            Self::ShapeOf { .. } => "ShapeOf",
        }
    }
}

/// Free-form runtime hints attached to a node, keyed like
/// `InputMemoryFormats -> "cpu:nCw16c"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RtInfo {
    entries: BTreeMap<String, String>,
}

impl RtInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub op: NodeOp,
    pub rt_info: RtInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    UnknownNode(NodeId),
    UnsupportedOutputType(ElementPrecision),
    ScalarInput { node: NodeId },
    ParameterCount { expected: usize, actual: usize },
    NoResult,
    Binding(ShapeError),
    Kernel(KernelError),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "unknown node id {}", node.0),
            Self::UnsupportedOutputType(precision) => {
                write!(f, "shape_of output type must be i32, got {precision}")
            }
            Self::ScalarInput { node } => {
                write!(f, "parameter {} must have rank >= 1", node.0)
            }
            Self::ParameterCount { expected, actual } => write!(
                f,
                "graph parameter count mismatch: expected={expected}, actual={actual}"
            ),
            Self::NoResult => write!(f, "graph has no result node"),
            Self::Binding(error) => write!(f, "input binding rejected: {error}"),
            Self::Kernel(error) => write!(f, "reference evaluation failed: {error}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<ShapeError> for GraphError {
    fn from(value: ShapeError) -> Self {
        Self::Binding(value)
    }
}

impl From<KernelError> for GraphError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    parameters: Vec<NodeId>,
    results: Vec<NodeId>,
}

impl Graph {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            parameters: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Adds a dynamically shaped input. Only rank and fixed dimensions are
    /// needed here.
    pub fn parameter(
        &mut self,
        precision: ElementPrecision,
        shape: SymbolicShape,
    ) -> Result<NodeId, GraphError> {
        let id = NodeId(self.nodes.len());
        if shape.rank() == 0 {
            return Err(GraphError::ScalarInput { node: id });
        }
        self.nodes.push(Node {
            op: NodeOp::Parameter { precision, shape },
            rt_info: RtInfo::new(),
        });
        self.parameters.push(id);
        Ok(id)
    }

    pub fn shape_of(
        &mut self,
        input: NodeId,
        output_type: ElementPrecision,
    ) -> Result<NodeId, GraphError> {
        self.node(input)?;
        if output_type != ElementPrecision::I32 {
            return Err(GraphError::UnsupportedOutputType(output_type));
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            op: NodeOp::ShapeOf { input, output_type },
            rt_info: RtInfo::new(),
        });
        Ok(id)
    }

    pub fn set_rt_info(&mut self, node: NodeId, rt_info: RtInfo) -> Result<(), GraphError> {
        let slot = self
            .nodes
            .get_mut(node.0)
            .ok_or(GraphError::UnknownNode(node))?;
        slot.rt_info = rt_info;
        Ok(())
    }

    pub fn mark_result(&mut self, node: NodeId) -> Result<(), GraphError> {
        self.node(node)?;
        self.results.push(node);
        Ok(())
    }

    pub fn node(&self, node: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(node.0).ok_or(GraphError::UnknownNode(node))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    #[must_use]
    pub fn results(&self) -> &[NodeId] {
        &self.results
    }

    /// The single graph input, as required by the shape-of harness.
    pub fn sole_parameter(&self) -> Result<(NodeId, ElementPrecision, &SymbolicShape), GraphError> {
        if self.parameters.len() != 1 {
            return Err(GraphError::ParameterCount {
                expected: 1,
                actual: self.parameters.len(),
            });
        }
        let id = self.parameters[0];
        match &self.node(id)?.op {
            NodeOp::Parameter { precision, shape } => Ok((id, *precision, shape)),
            NodeOp::ShapeOf { .. } => Err(GraphError::UnknownNode(id)),
        }
    }

    /// Copy with every runtime hint removed and inputs normalised to f32, so
    /// nothing in it can steer a layout or precision choice.
    #[must_use]
    pub fn reference_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.name = format!("{}_ref", self.name);
        for node in &mut clone.nodes {
            node.rt_info = RtInfo::new();
            if let NodeOp::Parameter { precision, .. } = &mut node.op {
                *precision = ElementPrecision::F32;
            }
        }
        clone
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.nodes.hash(&mut hasher);
        self.parameters.hash(&mut hasher);
        self.results.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphPair {
    pub device: Graph,
    pub reference: Graph,
}

/// Builds `Parameter(precision, symbolic) -> ShapeOf(i32)` with `rt_info`
/// attached to the ShapeOf node, plus its hint-free reference copy.
pub fn build_shape_of_graph(
    symbolic: &SymbolicShape,
    precision: ElementPrecision,
    rt_info: RtInfo,
) -> Result<GraphPair, GraphError> {
    let mut graph = Graph::new("ShapeOf");
    let param = graph.parameter(precision, symbolic.clone())?;
    let shape_of = graph.shape_of(param, ElementPrecision::I32)?;
    graph.set_rt_info(shape_of, rt_info)?;
    graph.mark_result(shape_of)?;

    let reference = graph.reference_clone();
    Ok(GraphPair {
        device: graph,
        reference,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RefValue {
    Tensor(Vec<usize>),
    I32Vector(Vec<i32>),
}

impl RefValue {
    fn dims(&self) -> Vec<usize> {
        match self {
            Self::Tensor(dims) => dims.clone(),
            Self::I32Vector(values) => vec![values.len()],
        }
    }
}

/// Layout- and precision-free evaluation of the first graph result for one
/// bound input shape.
pub fn interpret_reference(graph: &Graph, shape: &ConcreteShape) -> Result<Vec<i32>, GraphError> {
    let (param, _, symbolic) = graph.sole_parameter()?;
    symbolic.admits(shape)?;
    let result = *graph.results().first().ok_or(GraphError::NoResult)?;

    let mut values: Vec<Option<RefValue>> = vec![None; graph.nodes().len()];
    for (idx, node) in graph.nodes().iter().enumerate() {
        let value = match &node.op {
            NodeOp::Parameter { .. } if NodeId(idx) == param => {
                RefValue::Tensor(shape.dims().to_vec())
            }
            NodeOp::Parameter { .. } => return Err(GraphError::UnknownNode(NodeId(idx))),
            NodeOp::ShapeOf { input, .. } => {
                let source = values
                    .get(input.0)
                    .and_then(Option::as_ref)
                    .ok_or(GraphError::UnknownNode(*input))?;
                RefValue::I32Vector(dims_to_i32(&source.dims())?)
            }
        };
        values[idx] = Some(value);
    }

    match values.get(result.0).and_then(Option::as_ref) {
        Some(RefValue::I32Vector(out)) => Ok(out.clone()),
        Some(RefValue::Tensor(_)) | None => Err(GraphError::NoResult),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sh_core::{ConcreteShape, ElementPrecision, ShapeError, SymbolicShape};

    use super::{
        Graph, GraphError, INPUT_MEMORY_FORMATS, NodeId, NodeOp, RtInfo, build_shape_of_graph,
        interpret_reference,
    };

    fn hint() -> RtInfo {
        RtInfo::new()
            .with(INPUT_MEMORY_FORMATS, "cpu:nCw16c")
            .with(super::OUTPUT_MEMORY_FORMATS, "cpu:x")
    }

    #[test]
    fn builder_produces_parameter_and_shape_of() {
        let pair = build_shape_of_graph(&SymbolicShape::all_unknown(3), ElementPrecision::BF16, hint())
            .expect("graph should build");
        let graph = &pair.device;
        assert_eq!(graph.nodes().len(), 2);
        assert_eq!(graph.parameters(), &[NodeId(0)]);
        assert_eq!(graph.results(), &[NodeId(1)]);
        assert_eq!(graph.nodes()[1].op.type_name(), "ShapeOf");
        assert_eq!(
            graph.nodes()[1].rt_info.get(INPUT_MEMORY_FORMATS),
            Some("cpu:nCw16c")
        );
        assert!(matches!(
            graph.nodes()[0].op,
            NodeOp::Parameter {
                precision: ElementPrecision::BF16,
                ..
            }
        ));
    }

    #[test]
    fn reference_graph_drops_hints_but_keeps_structure() {
        let pair = build_shape_of_graph(&SymbolicShape::all_unknown(4), ElementPrecision::I8, hint())
            .expect("graph should build");
        assert_eq!(pair.reference.nodes().len(), pair.device.nodes().len());
        assert!(pair.reference.nodes().iter().all(|node| node.rt_info.is_empty()));
        assert_ne!(pair.reference.fingerprint64(), pair.device.fingerprint64());
        assert_eq!(pair.reference.name(), "ShapeOf_ref");
        let (_, precision, shape) = pair.reference.sole_parameter().expect("one input");
        assert_eq!(precision, ElementPrecision::F32);
        assert_eq!(shape, &SymbolicShape::all_unknown(4));
    }

    #[test]
    fn non_i32_output_is_rejected() {
        let mut graph = Graph::new("bad");
        let param = graph
            .parameter(ElementPrecision::F32, SymbolicShape::all_unknown(3))
            .expect("param");
        let err = graph
            .shape_of(param, ElementPrecision::F32)
            .expect_err("f32 output must be rejected");
        assert_eq!(err, GraphError::UnsupportedOutputType(ElementPrecision::F32));
    }

    #[test]
    fn scalar_parameter_is_rejected() {
        let mut graph = Graph::new("scalar");
        let err = graph
            .parameter(ElementPrecision::F32, SymbolicShape::all_unknown(0))
            .expect_err("rank 0 input must be rejected");
        assert_eq!(err, GraphError::ScalarInput { node: NodeId(0) });
    }

    #[test]
    fn unknown_input_node_is_rejected() {
        let mut graph = Graph::new("dangling");
        let err = graph
            .shape_of(NodeId(7), ElementPrecision::I32)
            .expect_err("dangling input must fail");
        assert_eq!(err, GraphError::UnknownNode(NodeId(7)));
    }

    #[test]
    fn reference_interpreter_returns_bound_dims() {
        let pair = build_shape_of_graph(&SymbolicShape::all_unknown(3), ElementPrecision::F32, hint())
            .expect("graph should build");
        for dims in [vec![8, 5, 4], vec![8, 5, 3], vec![8, 5, 2]] {
            let out = interpret_reference(&pair.reference, &ConcreteShape::new(dims.clone()))
                .expect("reference evaluation");
            let expected: Vec<i32> = dims.iter().map(|&d| d as i32).collect();
            assert_eq!(out, expected);
        }
    }

    #[test]
    fn reference_interpreter_rejects_rank_mismatch() {
        let pair = build_shape_of_graph(&SymbolicShape::all_unknown(5), ElementPrecision::F32, hint())
            .expect("graph should build");
        let err = interpret_reference(&pair.reference, &ConcreteShape::new(vec![1, 2, 3]))
            .expect_err("rank 3 binding on rank 5 graph must fail");
        assert_eq!(
            err,
            GraphError::Binding(ShapeError::RankMismatch {
                expected: 5,
                actual: 3
            })
        );
    }

    #[test]
    fn chained_shape_of_reports_vector_length() {
        let mut graph = Graph::new("chain");
        let param = graph
            .parameter(ElementPrecision::F32, SymbolicShape::all_unknown(4))
            .expect("param");
        let first = graph.shape_of(param, ElementPrecision::I32).expect("first");
        let second = graph.shape_of(first, ElementPrecision::I32).expect("second");
        graph.mark_result(second).expect("result");
        let out = interpret_reference(&graph, &ConcreteShape::new(vec![1, 2, 3, 4]))
            .expect("chain evaluates");
        assert_eq!(out, vec![4]);
    }

    proptest! {
        #[test]
        fn prop_reference_matches_dims(dims in prop::collection::vec(0usize..=64, 3..=5)) {
            let pair = build_shape_of_graph(
                &SymbolicShape::all_unknown(dims.len()),
                ElementPrecision::I32,
                RtInfo::new(),
            )
            .expect("graph should build");
            let out = interpret_reference(&pair.reference, &ConcreteShape::new(dims.clone()))
                .expect("reference evaluation");
            let expected: Vec<i32> = dims.iter().map(|&d| d as i32).collect();
            prop_assert_eq!(out, expected);
        }
    }
}
