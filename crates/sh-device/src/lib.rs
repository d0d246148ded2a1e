#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use sh_core::{ConcreteShape, ElementPrecision, MemoryDesc, MemoryFormat, ShapeError, SymbolicShape};
use sh_dispatch::{
    DispatchError, ImplType, SelectionDecision, SelectionHint, SelectionPolicy,
    select_shape_of_primitive,
};
use sh_graph::{
    Graph, GraphError, INPUT_MEMORY_FORMATS, NodeOp, OUTPUT_MEMORY_FORMATS, PRIMITIVES_PRIORITY,
    RtInfo,
};
use sh_kernel_cpu::{KernelError, shape_of_i32};
use sh_runtime::{EvidenceKind, EvidenceLedger, RuntimeContext};

static NEXT_COMPILED_ID: AtomicU64 = AtomicU64::new(1);

fn next_compiled_id() -> u64 {
    NEXT_COMPILED_ID.fetch_add(1, Ordering::Relaxed)
}

const CPU_RT_PREFIX: &str = "cpu:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    UnsupportedPrecision { precision: ElementPrecision },
    InvalidRtInfo { key: String, value: String },
    NoShapeOfResult,
    Graph(GraphError),
    Dispatch(DispatchError),
    Shape(ShapeError),
    Kernel(KernelError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedPrecision { precision } => {
                write!(f, "engine does not support input precision {precision}")
            }
            Self::InvalidRtInfo { key, value } => {
                write!(f, "invalid rt_info entry {key}='{value}'")
            }
            Self::NoShapeOfResult => write!(f, "graph result is not a ShapeOf over the graph input"),
            Self::Graph(error) => write!(f, "graph error: {error}"),
            Self::Dispatch(error) => write!(f, "primitive selection failed: {error}"),
            Self::Shape(error) => write!(f, "shape binding failed: {error}"),
            Self::Kernel(error) => write!(f, "kernel failed: {error}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<GraphError> for EngineError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<DispatchError> for EngineError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<ShapeError> for EngineError {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<KernelError> for EngineError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

/// What one execution produced and which implementation produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: Vec<i32>,
    pub input_format: MemoryFormat,
    pub output_format: MemoryFormat,
    pub selected_type: String,
    pub compiled_id: u64,
}

/// A graph lowered onto one selected primitive. Shapes are rebound on this
/// object; the selection never changes after compile. Selection, bind and
/// execute evidence lives here and is dropped with the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledGraph {
    id: u64,
    input_shape: SymbolicShape,
    precision: ElementPrecision,
    selection: SelectionDecision,
    bound: Option<MemoryDesc>,
    runs: usize,
    ledger: EvidenceLedger,
}

impl CompiledGraph {
    #[must_use]
    pub fn new(
        input_shape: SymbolicShape,
        precision: ElementPrecision,
        selection: SelectionDecision,
    ) -> Self {
        Self {
            id: next_compiled_id(),
            input_shape,
            precision,
            selection,
            bound: None,
            runs: 0,
            ledger: EvidenceLedger::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn input_shape(&self) -> &SymbolicShape {
        &self.input_shape
    }

    #[must_use]
    pub fn precision(&self) -> ElementPrecision {
        self.precision
    }

    #[must_use]
    pub fn selection(&self) -> &SelectionDecision {
        &self.selection
    }

    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.ledger.record(kind, summary);
    }

    /// Validates `shape` against the compiled input and records it as the
    /// current binding.
    pub fn bind(&mut self, shape: &ConcreteShape) -> Result<&MemoryDesc, EngineError> {
        self.input_shape.admits(shape)?;
        let desc = MemoryDesc::new(shape, self.selection.desc.input_format, self.precision)?;
        desc.byte_size()?;
        Ok(&*self.bound.insert(desc))
    }

    /// Builds the result record for `output` and counts the run.
    pub fn finish_run(&mut self, output: Vec<i32>) -> ExecutionResult {
        self.runs += 1;
        ExecutionResult {
            output,
            input_format: self.selection.desc.input_format,
            output_format: self.selection.desc.output_format,
            selected_type: self.selection.selected_type.clone(),
            compiled_id: self.id,
        }
    }
}

/// Device engine contract. `compile` runs once per graph; `bind_and_run` runs
/// once per concrete shape and must not recompile.
pub trait ExecutionEngine: Sync {
    fn name(&self) -> &str;

    fn compile(&self, graph: &Graph) -> Result<CompiledGraph, EngineError>;

    fn bind_and_run(
        &self,
        compiled: &mut CompiledGraph,
        shape: &ConcreteShape,
    ) -> Result<ExecutionResult, EngineError>;
}

fn parse_rt_format(key: &str, value: &str) -> Result<MemoryFormat, EngineError> {
    let invalid = || EngineError::InvalidRtInfo {
        key: key.to_string(),
        value: value.to_string(),
    };
    let first = value
        .strip_prefix(CPU_RT_PREFIX)
        .and_then(|rest| rest.split(',').next())
        .ok_or_else(invalid)?;
    MemoryFormat::from_name(first.trim()).ok_or_else(invalid)
}

/// Translates node runtime hints into a dispatch hint. Unknown keys are
/// ignored; known keys with malformed values are errors.
pub fn hint_from_rt_info(rt_info: &RtInfo) -> Result<SelectionHint, EngineError> {
    let mut hint = SelectionHint::default();
    if let Some(value) = rt_info.get(INPUT_MEMORY_FORMATS) {
        hint.input_format = Some(parse_rt_format(INPUT_MEMORY_FORMATS, value)?);
    }
    if let Some(value) = rt_info.get(OUTPUT_MEMORY_FORMATS) {
        hint.output_format = Some(parse_rt_format(OUTPUT_MEMORY_FORMATS, value)?);
    }
    if let Some(value) = rt_info.get(PRIMITIVES_PRIORITY) {
        let impl_type = value
            .strip_prefix(CPU_RT_PREFIX)
            .and_then(|rest| rest.split(',').next())
            .and_then(|name| ImplType::from_name(name.trim()))
            .ok_or_else(|| EngineError::InvalidRtInfo {
                key: PRIMITIVES_PRIORITY.to_string(),
                value: value.to_string(),
            })?;
        hint.impl_type = Some(impl_type);
    }
    Ok(hint)
}

/// Locates the ShapeOf result fed by the graph's single input.
fn shape_of_target(graph: &Graph) -> Result<(ElementPrecision, SymbolicShape, RtInfo), EngineError> {
    let (param, precision, symbolic) = graph.sole_parameter()?;
    let result = *graph.results().first().ok_or(EngineError::NoShapeOfResult)?;
    let node = graph.node(result)?;
    match node.op {
        NodeOp::ShapeOf { input, .. } if input == param => {
            Ok((precision, symbolic.clone(), node.rt_info.clone()))
        }
        _ => Err(EngineError::NoShapeOfResult),
    }
}

/// Reference CPU engine. Shared across cases; its own ledger only sees policy
/// changes and compile failures, per-graph evidence stays on `CompiledGraph`.
#[derive(Debug)]
pub struct CpuEngine {
    supported: Vec<ElementPrecision>,
    policy: SelectionPolicy,
    runtime: Mutex<RuntimeContext>,
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn policy_label(policy: SelectionPolicy) -> &'static str {
    match policy {
        SelectionPolicy::Strict => "strict",
        SelectionPolicy::Fallback => "fallback",
    }
}

impl CpuEngine {
    #[must_use]
    pub fn new() -> Self {
        let policy = SelectionPolicy::Fallback;
        Self {
            supported: ElementPrecision::all().to_vec(),
            policy,
            runtime: Mutex::new(RuntimeContext::new(policy_label(policy))),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self.runtime_guard().set_policy(policy_label(policy));
        self
    }

    #[must_use]
    pub fn with_supported_precisions(mut self, precisions: &[ElementPrecision]) -> Self {
        self.supported = precisions.to_vec();
        self
    }

    #[must_use]
    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    #[must_use]
    pub fn supports(&self, precision: ElementPrecision) -> bool {
        self.supported.contains(&precision)
    }

    #[must_use]
    pub fn ledger_snapshot(&self) -> EvidenceLedger {
        self.runtime_guard().ledger().clone()
    }

    fn runtime_guard(&self) -> MutexGuard<'_, RuntimeContext> {
        match self.runtime.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }


    fn compile_inner(&self, graph: &Graph) -> Result<CompiledGraph, EngineError> {
        let (precision, symbolic, rt_info) = shape_of_target(graph)?;
        if !self.supports(precision) {
            return Err(EngineError::UnsupportedPrecision { precision });
        }
        let hint = hint_from_rt_info(&rt_info)?;
        let decision = select_shape_of_primitive(symbolic.rank(), precision, hint, self.policy)?;
        let summary = format!(
            "rank={} in={} out={} type={} candidates={} fallback={}",
            symbolic.rank(),
            decision.desc.input_format,
            decision.desc.output_format,
            decision.selected_type,
            decision.candidates,
            decision.fallback_used
        );
        let mut compiled = CompiledGraph::new(symbolic, precision, decision);
        compiled.record(EvidenceKind::Selection, summary);
        compiled.record(
            EvidenceKind::Compile,
            format!(
                "graph={} name={} fingerprint={:016x}",
                compiled.id(),
                graph.name(),
                graph.fingerprint64()
            ),
        );
        Ok(compiled)
    }

    fn run_inner(
        &self,
        compiled: &mut CompiledGraph,
        shape: &ConcreteShape,
    ) -> Result<ExecutionResult, EngineError> {
        let id = compiled.id();
        let desc = compiled.bind(shape)?;
        let bound = format!("graph={id} shape={shape} blocked={:?}", desc.blocked_dims());
        let output = shape_of_i32(desc)?;
        compiled.record(EvidenceKind::Bind, bound);
        MemoryDesc::new(
            &ConcreteShape::new(vec![output.len()]),
            compiled.selection().desc.output_format,
            ElementPrecision::I32,
        )?;
        let result = compiled.finish_run(output);
        compiled.record(
            EvidenceKind::Execute,
            format!("graph={} shape={shape} output={:?}", result.compiled_id, result.output),
        );
        Ok(result)
    }
}

impl ExecutionEngine for CpuEngine {
    fn name(&self) -> &str {
        "cpu"
    }

    fn compile(&self, graph: &Graph) -> Result<CompiledGraph, EngineError> {
        self.compile_inner(graph).inspect_err(|error| {
            self.runtime_guard().record_failure("compile", error);
        })
    }

    fn bind_and_run(
        &self,
        compiled: &mut CompiledGraph,
        shape: &ConcreteShape,
    ) -> Result<ExecutionResult, EngineError> {
        self.run_inner(compiled, shape).inspect_err(|error| {
            compiled.record(EvidenceKind::Failure, format!("bind_and_run failed: {error}"));
        })
    }
}
