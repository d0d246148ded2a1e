use std::fmt;

use serde::Serialize;
use sh_core::ConcreteShape;
use sh_device::ExecutionResult;

use crate::cases::TestCase;
use crate::driver::DriverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleError {
    DimOverflow { dim: usize, value: usize },
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimOverflow { dim, value } => {
                write!(f, "dimension {dim} exceeds i32 range: {value}")
            }
        }
    }
}

impl std::error::Error for OracleError {}

/// Expected shape-of output, computed straight from the bound dimensions.
pub fn reference_shape_of(shape: &ConcreteShape) -> Result<Vec<i32>, OracleError> {
    let mut out = Vec::with_capacity(shape.rank());
    for (dim, &value) in shape.dims().iter().enumerate() {
        let cast = i32::try_from(value).map_err(|_| OracleError::DimOverflow { dim, value })?;
        out.push(cast);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    Execution,
    LayoutSelection,
    Reference,
    Recompile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub shape_index: usize,
    pub shape: String,
    pub kind: DivergenceKind,
    pub expected: String,
    pub actual: String,
}

/// Per-shape verdict. Every flag is computed even when an earlier one fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeComparison {
    pub shape_index: usize,
    pub shape: Vec<usize>,
    pub expected: Option<Vec<i32>>,
    pub actual: Option<Vec<i32>>,
    pub output_ok: bool,
    pub layout_ok: bool,
    pub impl_ok: bool,
    pub reference_ok: bool,
    pub recompile_ok: bool,
}

impl ShapeComparison {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.output_ok && self.layout_ok && self.impl_ok && self.reference_ok && self.recompile_ok
    }
}

/// Inputs observed for one shape of one case.
#[derive(Debug)]
pub struct ShapeObservation<'a> {
    pub shape_index: usize,
    pub shape: &'a ConcreteShape,
    pub device: &'a Result<ExecutionResult, DriverError>,
    pub reference: Result<Vec<i32>, String>,
    pub first_compiled_id: Option<u64>,
}

fn render<T: fmt::Debug>(value: &T) -> String {
    format!("{value:?}")
}

pub fn compare_shape(
    case: &TestCase,
    observation: &ShapeObservation<'_>,
) -> (ShapeComparison, Vec<Divergence>) {
    let shape_label = observation.shape.to_string();
    let mut divergences = Vec::new();
    let mut diverge = |kind: DivergenceKind, expected: String, actual: String| {
        divergences.push(Divergence {
            shape_index: observation.shape_index,
            shape: shape_label.clone(),
            kind,
            expected,
            actual,
        });
    };

    let expected = reference_shape_of(observation.shape);

    let (output_ok, layout_ok, impl_ok, recompile_ok, actual) = match observation.device {
        Ok(result) => {
            let output_ok = expected
                .as_ref()
                .is_ok_and(|expected| *expected == result.output);
            if !output_ok {
                diverge(
                    DivergenceKind::Execution,
                    expected
                        .as_ref()
                        .map_or_else(ToString::to_string, render),
                    render(&result.output),
                );
            }

            let layout_ok = result.input_format == case.layout.input_format
                && result.output_format == case.layout.output_format;
            let expected_type = case.expected_type();
            let impl_ok = result.selected_type == expected_type;
            if !layout_ok || !impl_ok {
                diverge(
                    DivergenceKind::LayoutSelection,
                    format!("{}_{expected_type}", case.layout.tag()),
                    format!(
                        "inFmts={}_outFmts={}_{}",
                        result.input_format, result.output_format, result.selected_type
                    ),
                );
            }

            let recompile_ok = observation
                .first_compiled_id
                .is_none_or(|first| first == result.compiled_id);
            if !recompile_ok {
                diverge(
                    DivergenceKind::Recompile,
                    format!("compiled_id={:?}", observation.first_compiled_id),
                    format!("compiled_id={}", result.compiled_id),
                );
            }
            (
                output_ok,
                layout_ok,
                impl_ok,
                recompile_ok,
                Some(result.output.clone()),
            )
        }
        Err(error) => {
            diverge(
                DivergenceKind::Execution,
                expected
                    .as_ref()
                    .map_or_else(ToString::to_string, render),
                format!("error: {error}"),
            );
            (false, false, false, false, None)
        }
    };

    let reference_ok = match (&expected, &observation.reference) {
        (Ok(expected), Ok(reference)) => expected == reference,
        _ => false,
    };
    if !reference_ok {
        diverge(
            DivergenceKind::Reference,
            expected.as_ref().map_or_else(ToString::to_string, render),
            observation
                .reference
                .as_ref()
                .map_or_else(|error| format!("error: {error}"), render),
        );
    }

    let comparison = ShapeComparison {
        shape_index: observation.shape_index,
        shape: observation.shape.dims().to_vec(),
        expected: expected.ok(),
        actual,
        output_ok,
        layout_ok,
        impl_ok,
        reference_ok,
        recompile_ok,
    };
    (comparison, divergences)
}
