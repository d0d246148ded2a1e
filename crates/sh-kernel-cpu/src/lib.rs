#![forbid(unsafe_code)]

use std::fmt;

use sh_core::{MemoryDesc, ShapeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Shape(ShapeError),
    DimOverflow { dim: usize, value: usize },
    PaddingUnderflow { dim: usize, logical: usize, physical: usize },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shape(error) => write!(f, "invalid memory descriptor: {error}"),
            Self::DimOverflow { dim, value } => {
                write!(f, "dimension {dim} does not fit in i32: {value}")
            }
            Self::PaddingUnderflow {
                dim,
                logical,
                physical,
            } => write!(
                f,
                "physical extent smaller than logical at dim={dim}: logical={logical}, physical={physical}"
            ),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<ShapeError> for KernelError {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

/// Shape extraction over a bound buffer descriptor. The result is always the
/// logical extents, never the padded physical ones.
pub fn shape_of_i32(desc: &MemoryDesc) -> Result<Vec<i32>, KernelError> {
    ensure_blocked_covers_logical(desc)?;
    dims_to_i32(desc.logical_dims())
}

/// Casts extents to i32, failing closed on overflow.
pub fn dims_to_i32(dims: &[usize]) -> Result<Vec<i32>, KernelError> {
    dims.iter()
        .copied()
        .enumerate()
        .map(|(dim, value)| {
            i32::try_from(value).map_err(|_| KernelError::DimOverflow { dim, value })
        })
        .collect()
}

fn ensure_blocked_covers_logical(desc: &MemoryDesc) -> Result<(), KernelError> {
    let rank = desc.logical_dims().len();
    let mut physical = vec![1usize; rank];
    for (axis, extent) in desc
        .order()
        .iter()
        .copied()
        .zip(desc.blocked_dims().iter().copied())
    {
        physical[axis] = physical[axis].saturating_mul(extent);
    }

    for (dim, (logical, physical)) in desc
        .logical_dims()
        .iter()
        .copied()
        .zip(physical.iter().copied())
        .enumerate()
    {
        if physical < logical {
            return Err(KernelError::PaddingUnderflow {
                dim,
                logical,
                physical,
            });
        }
    }
    Ok(())
}
