use std::fmt;

use sh_core::{ConcreteShape, ShapeError, SymbolicShape};
use sh_device::{CompiledGraph, EngineError, ExecutionEngine, ExecutionResult};
use sh_graph::{Graph, GraphError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uncompiled,
    Compiled,
    Bound,
    Executed,
    Finished,
}

impl DriverState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uncompiled => "uncompiled",
            Self::Compiled => "compiled",
            Self::Bound => "bound",
            Self::Executed => "executed",
            Self::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    NotCompiled,
    InvalidState {
        operation: &'static str,
        state: DriverState,
    },
    RankContract {
        expected: usize,
        actual: usize,
    },
    ShapeContract {
        dim: usize,
        expected: usize,
        actual: usize,
    },
    SequenceExhausted,
    Graph(GraphError),
    Engine(EngineError),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCompiled => write!(f, "graph has not been compiled"),
            Self::InvalidState { operation, state } => {
                write!(f, "{operation} is not allowed in state {}", state.as_str())
            }
            Self::RankContract { expected, actual } => write!(
                f,
                "bound shape rank {actual} does not match graph rank {expected}"
            ),
            Self::ShapeContract {
                dim,
                expected,
                actual,
            } => write!(
                f,
                "bound shape changes fixed dim {dim}: expected={expected}, actual={actual}"
            ),
            Self::SequenceExhausted => write!(f, "shape sequence already finished"),
            Self::Graph(error) => write!(f, "graph error: {error}"),
            Self::Engine(error) => write!(f, "engine error: {error}"),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<GraphError> for DriverError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<EngineError> for DriverError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

fn contract_error(error: ShapeError) -> DriverError {
    match error {
        ShapeError::RankMismatch { expected, actual } => {
            DriverError::RankContract { expected, actual }
        }
        ShapeError::FixedDimMismatch {
            dim,
            expected,
            actual,
        } => DriverError::ShapeContract {
            dim,
            expected,
            actual,
        },
        other => DriverError::Engine(EngineError::Shape(other)),
    }
}

/// Drives one graph through compile, then repeated bind/execute.
///
/// The graph is compiled at most once; every bind reuses that compiled
/// instance. Binding takes `&mut self`, so one driver never runs two shapes at
/// the same time.
#[derive(Debug)]
pub struct ExecutionDriver<'e, E: ExecutionEngine + ?Sized> {
    engine: &'e E,
    graph: Graph,
    symbolic: SymbolicShape,
    compiled: Option<CompiledGraph>,
    state: DriverState,
    bound: Option<ConcreteShape>,
    compile_count: usize,
    results: Vec<ExecutionResult>,
}

impl<'e, E: ExecutionEngine + ?Sized> ExecutionDriver<'e, E> {
    pub fn new(engine: &'e E, graph: Graph) -> Result<Self, DriverError> {
        let symbolic = graph.sole_parameter()?.2.clone();
        Ok(Self {
            engine,
            graph,
            symbolic,
            compiled: None,
            state: DriverState::Uncompiled,
            bound: None,
            compile_count: 0,
            results: Vec::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> DriverState {
        self.state
    }

    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    #[must_use]
    pub fn compiled_id(&self) -> Option<u64> {
        self.compiled.as_ref().map(CompiledGraph::id)
    }

    #[must_use]
    pub fn results(&self) -> &[ExecutionResult] {
        &self.results
    }

    pub fn compile(&mut self) -> Result<(), DriverError> {
        if self.compiled.is_some() {
            return Ok(());
        }
        let compiled = self.engine.compile(&self.graph)?;
        self.compile_count += 1;
        self.compiled = Some(compiled);
        self.state = DriverState::Compiled;
        Ok(())
    }

    pub fn bind(&mut self, shape: &ConcreteShape) -> Result<(), DriverError> {
        match self.state {
            DriverState::Uncompiled => return Err(DriverError::NotCompiled),
            DriverState::Finished => return Err(DriverError::SequenceExhausted),
            DriverState::Bound => {
                return Err(DriverError::InvalidState {
                    operation: "bind",
                    state: self.state,
                });
            }
            DriverState::Compiled | DriverState::Executed => {}
        }
        self.symbolic.admits(shape).map_err(contract_error)?;
        self.bound = Some(shape.clone());
        self.state = DriverState::Bound;
        Ok(())
    }

    /// Runs the bound shape. An engine failure drops the binding and leaves
    /// the driver ready for the next shape.
    pub fn execute(&mut self) -> Result<ExecutionResult, DriverError> {
        if self.state != DriverState::Bound {
            return Err(DriverError::InvalidState {
                operation: "execute",
                state: self.state,
            });
        }
        let shape = self.bound.take().ok_or(DriverError::InvalidState {
            operation: "execute",
            state: self.state,
        })?;
        let compiled = self.compiled.as_mut().ok_or(DriverError::NotCompiled)?;
        match self.engine.bind_and_run(compiled, &shape) {
            Ok(result) => {
                self.results.push(result.clone());
                self.state = DriverState::Executed;
                Ok(result)
            }
            Err(error) => {
                self.state = DriverState::Compiled;
                Err(DriverError::Engine(error))
            }
        }
    }

    pub fn finish(&mut self) -> Result<(), DriverError> {
        match self.state {
            DriverState::Uncompiled => Err(DriverError::NotCompiled),
            DriverState::Bound => Err(DriverError::InvalidState {
                operation: "finish",
                state: self.state,
            }),
            DriverState::Compiled | DriverState::Executed | DriverState::Finished => {
                self.state = DriverState::Finished;
                Ok(())
            }
        }
    }

    /// Compiles once, then binds and executes each shape in order. A compile
    /// failure is returned as the outer error; per-shape failures are kept in
    /// the returned list and do not stop the sequence.
    pub fn run_sequence(
        &mut self,
        shapes: &[ConcreteShape],
    ) -> Result<Vec<Result<ExecutionResult, DriverError>>, DriverError> {
        self.compile()?;
        let mut outcomes = Vec::with_capacity(shapes.len());
        for shape in shapes {
            let outcome = self.bind(shape).and_then(|()| self.execute());
            outcomes.push(outcome);
        }
        self.finish()?;
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sh_core::{ConcreteShape, ElementPrecision, MemoryFormat, SymbolicShape};
    use sh_device::{
        CompiledGraph, CpuEngine, EngineError, ExecutionEngine, ExecutionResult,
    };
    use sh_graph::{Graph, build_shape_of_graph};

    use super::{DriverError, DriverState, ExecutionDriver};
    use crate::cases::LayoutSpec;

    struct CountingEngine {
        inner: CpuEngine,
        compiles: AtomicUsize,
    }

    impl CountingEngine {
        fn new() -> Self {
            Self {
                inner: CpuEngine::new(),
                compiles: AtomicUsize::new(0),
            }
        }
    }

    impl ExecutionEngine for CountingEngine {
        fn name(&self) -> &str {
            "counting"
        }

        fn compile(&self, graph: &Graph) -> Result<CompiledGraph, EngineError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            self.inner.compile(graph)
        }

        fn bind_and_run(
            &self,
            compiled: &mut CompiledGraph,
            shape: &ConcreteShape,
        ) -> Result<ExecutionResult, EngineError> {
            self.inner.bind_and_run(compiled, shape)
        }
    }

    fn graph(partial: &[i64], format: MemoryFormat) -> Graph {
        let symbolic = SymbolicShape::from_partial(partial).expect("valid partial shape");
        build_shape_of_graph(
            &symbolic,
            ElementPrecision::F32,
            LayoutSpec::new(format).rt_info(),
        )
        .expect("graph should build")
        .device
    }

    fn shape(dims: &[usize]) -> ConcreteShape {
        ConcreteShape::new(dims.to_vec())
    }

    #[test]
    fn state_machine_walks_compile_bind_execute_finish() {
        let engine = CpuEngine::new();
        let mut driver =
            ExecutionDriver::new(&engine, graph(&[-1, -1, -1], MemoryFormat::Abc)).expect("driver");
        assert_eq!(driver.state(), DriverState::Uncompiled);
        assert_eq!(driver.bind(&shape(&[8, 5, 4])), Err(DriverError::NotCompiled));

        driver.compile().expect("compile");
        assert_eq!(driver.state(), DriverState::Compiled);
        assert!(matches!(
            driver.execute(),
            Err(DriverError::InvalidState {
                operation: "execute",
                state: DriverState::Compiled
            })
        ));

        driver.bind(&shape(&[8, 5, 4])).expect("bind");
        assert_eq!(driver.state(), DriverState::Bound);
        assert!(matches!(
            driver.bind(&shape(&[8, 5, 3])),
            Err(DriverError::InvalidState { operation: "bind", .. })
        ));

        let result = driver.execute().expect("execute");
        assert_eq!(result.output, vec![8, 5, 4]);
        assert_eq!(driver.state(), DriverState::Executed);

        driver.finish().expect("finish");
        assert_eq!(driver.state(), DriverState::Finished);
        assert_eq!(
            driver.bind(&shape(&[8, 5, 2])),
            Err(DriverError::SequenceExhausted)
        );
    }

    #[test]
    fn compile_is_guarded_against_repeats() {
        let engine = CountingEngine::new();
        let mut driver = ExecutionDriver::new(&engine, graph(&[-1, -1, -1, -1], MemoryFormat::Nhwc))
            .expect("driver");
        driver.compile().expect("first compile");
        let id = driver.compiled_id();
        driver.compile().expect("second compile is a no-op");
        assert_eq!(driver.compile_count(), 1);
        assert_eq!(engine.compiles.load(Ordering::SeqCst), 1);
        assert_eq!(driver.compiled_id(), id);
    }

    #[test]
    fn sequence_runs_on_one_compiled_graph() {
        let engine = CountingEngine::new();
        let mut driver = ExecutionDriver::new(
            &engine,
            graph(&[-1, -1, -1, -1, -1], MemoryFormat::NCdhw16c),
        )
        .expect("driver");
        let shapes = [
            shape(&[1, 2, 3, 4, 4]),
            shape(&[1, 2, 3, 4, 3]),
            shape(&[1, 2, 3, 4, 2]),
        ];
        let outcomes = driver.run_sequence(&shapes).expect("sequence");
        let outputs: Vec<Vec<i32>> = outcomes
            .into_iter()
            .map(|outcome| outcome.expect("each shape runs").output)
            .collect();
        assert_eq!(
            outputs,
            vec![vec![1, 2, 3, 4, 4], vec![1, 2, 3, 4, 3], vec![1, 2, 3, 4, 2]]
        );
        assert_eq!(engine.compiles.load(Ordering::SeqCst), 1);
        assert_eq!(driver.state(), DriverState::Finished);
        let id = driver.compiled_id().expect("compiled");
        assert!(driver.results().iter().all(|result| result.compiled_id == id));
    }

    #[test]
    fn contract_violations_fail_fast_without_changing_state() {
        let engine = CpuEngine::new();
        let mut driver =
            ExecutionDriver::new(&engine, graph(&[8, -1, -1], MemoryFormat::NCw8c)).expect("driver");
        driver.compile().expect("compile");

        assert_eq!(
            driver.bind(&shape(&[8, 5])),
            Err(DriverError::RankContract {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(driver.state(), DriverState::Compiled);

        assert_eq!(
            driver.bind(&shape(&[7, 5, 4])),
            Err(DriverError::ShapeContract {
                dim: 0,
                expected: 8,
                actual: 7
            })
        );
        assert_eq!(driver.state(), DriverState::Compiled);

        driver.bind(&shape(&[8, 5, 4])).expect("valid shape still binds");
    }

    #[test]
    fn per_shape_failure_does_not_stop_the_sequence() {
        let engine = CpuEngine::new();
        let mut driver =
            ExecutionDriver::new(&engine, graph(&[-1, -1, -1], MemoryFormat::Acb)).expect("driver");
        let shapes = [shape(&[2, 3, 3]), shape(&[2, 3]), shape(&[2, 3, 1])];
        let outcomes = driver.run_sequence(&shapes).expect("sequence");
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(DriverError::RankContract { .. })));
        assert_eq!(
            outcomes[2].as_ref().expect("third shape runs").output,
            vec![2, 3, 1]
        );
        assert_eq!(driver.results().len(), 2);
    }

    #[test]
    fn compile_failure_is_reported_once() {
        let engine = CpuEngine::new().with_supported_precisions(&[ElementPrecision::I32]);
        let mut driver =
            ExecutionDriver::new(&engine, graph(&[-1, -1, -1], MemoryFormat::Abc)).expect("driver");
        let err = driver
            .run_sequence(&[shape(&[1, 2, 3])])
            .expect_err("f32 input unsupported");
        assert!(matches!(
            err,
            DriverError::Engine(EngineError::UnsupportedPrecision { .. })
        ));
        assert_eq!(driver.compile_count(), 0);
        assert_eq!(driver.state(), DriverState::Uncompiled);
    }
}
