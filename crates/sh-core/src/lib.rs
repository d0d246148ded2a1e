#![forbid(unsafe_code)]

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ElementPrecision {
    F32 = 0,
    BF16 = 1,
    F16 = 2,
    I32 = 3,
    I64 = 4,
    I8 = 5,
    U8 = 6,
}

/// Per-precision behaviour, looked up by discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionTraits {
    pub precision: ElementPrecision,
    /// Lower-case label used in case names and fixtures.
    pub label: &'static str,
    /// Upper-case name used in selected-implementation tags.
    pub canonical_name: &'static str,
    pub size_bytes: usize,
    pub is_float: bool,
}

static PRECISION_TABLE: [PrecisionTraits; 7] = [
    PrecisionTraits {
        precision: ElementPrecision::F32,
        label: "f32",
        canonical_name: "FP32",
        size_bytes: 4,
        is_float: true,
    },
    PrecisionTraits {
        precision: ElementPrecision::BF16,
        label: "bf16",
        canonical_name: "BF16",
        size_bytes: 2,
        is_float: true,
    },
    PrecisionTraits {
        precision: ElementPrecision::F16,
        label: "f16",
        canonical_name: "FP16",
        size_bytes: 2,
        is_float: true,
    },
    PrecisionTraits {
        precision: ElementPrecision::I32,
        label: "i32",
        canonical_name: "I32",
        size_bytes: 4,
        is_float: false,
    },
    PrecisionTraits {
        precision: ElementPrecision::I64,
        label: "i64",
        canonical_name: "I64",
        size_bytes: 8,
        is_float: false,
    },
    PrecisionTraits {
        precision: ElementPrecision::I8,
        label: "i8",
        canonical_name: "I8",
        size_bytes: 1,
        is_float: false,
    },
    PrecisionTraits {
        precision: ElementPrecision::U8,
        label: "u8",
        canonical_name: "U8",
        size_bytes: 1,
        is_float: false,
    },
];

impl ElementPrecision {
    #[must_use]
    pub const fn all() -> &'static [ElementPrecision] {
        &[
            ElementPrecision::F32,
            ElementPrecision::BF16,
            ElementPrecision::F16,
            ElementPrecision::I32,
            ElementPrecision::I64,
            ElementPrecision::I8,
            ElementPrecision::U8,
        ]
    }

    #[must_use]
    pub fn traits(self) -> &'static PrecisionTraits {
        &PRECISION_TABLE[self as usize]
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        self.traits().label
    }

    #[must_use]
    pub fn canonical_name(self) -> &'static str {
        self.traits().canonical_name
    }

    #[must_use]
    pub fn size_bytes(self) -> usize {
        self.traits().size_bytes
    }

    pub fn from_label(raw: &str) -> Result<Self, ShapeError> {
        PRECISION_TABLE
            .iter()
            .find(|entry| entry.label == raw || entry.canonical_name == raw)
            .map(|entry| entry.precision)
            .ok_or_else(|| ShapeError::UnknownPrecision {
                label: raw.to_string(),
            })
    }
}

impl fmt::Display for ElementPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolicDim {
    Fixed(usize),
    Unknown,
}

impl SymbolicDim {
    #[must_use]
    pub fn is_fixed(self) -> bool {
        matches!(self, Self::Fixed(_))
    }

    #[must_use]
    pub fn admits(self, value: usize) -> bool {
        match self {
            Self::Fixed(expected) => expected == value,
            Self::Unknown => true,
        }
    }
}

impl fmt::Display for SymbolicDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => write!(f, "{value}"),
            Self::Unknown => f.write_str("?"),
        }
    }
}

/// A partially known input shape. Only the rank and the fixed dimensions are
/// known when a graph is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicShape {
    dims: Vec<SymbolicDim>,
}

impl SymbolicShape {
    #[must_use]
    pub fn new(dims: Vec<SymbolicDim>) -> Self {
        Self { dims }
    }

    #[must_use]
    pub fn all_unknown(rank: usize) -> Self {
        Self {
            dims: vec![SymbolicDim::Unknown; rank],
        }
    }

    /// Parses the partial-shape notation where `-1` marks an unknown extent.
    pub fn from_partial(raw: &[i64]) -> Result<Self, ShapeError> {
        let mut dims = Vec::with_capacity(raw.len());
        for (dim, value) in raw.iter().copied().enumerate() {
            let parsed = match value {
                -1 => SymbolicDim::Unknown,
                v if v >= 0 => SymbolicDim::Fixed(
                    usize::try_from(v).map_err(|_| ShapeError::InvalidPartialDim { dim, value })?,
                ),
                _ => return Err(ShapeError::InvalidPartialDim { dim, value }),
            };
            dims.push(parsed);
        }
        Ok(Self { dims })
    }

    #[must_use]
    pub fn dims(&self) -> &[SymbolicDim] {
        &self.dims
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|dim| dim.is_fixed())
    }

    /// Checks that `shape` is a valid instantiation of this pattern.
    pub fn admits(&self, shape: &ConcreteShape) -> Result<(), ShapeError> {
        if shape.rank() != self.rank() {
            return Err(ShapeError::RankMismatch {
                expected: self.rank(),
                actual: shape.rank(),
            });
        }
        for (dim, (pattern, value)) in self
            .dims
            .iter()
            .copied()
            .zip(shape.dims().iter().copied())
            .enumerate()
        {
            if let SymbolicDim::Fixed(expected) = pattern {
                if expected != value {
                    return Err(ShapeError::FixedDimMismatch {
                        dim,
                        expected,
                        actual: value,
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for SymbolicShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConcreteShape {
    dims: Vec<usize>,
}

impl ConcreteShape {
    #[must_use]
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn last_dim(&self) -> Option<usize> {
        self.dims.last().copied()
    }

}

impl fmt::Display for ConcreteShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(".")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    Planar,
    ChannelLast,
    Blocked { block: usize },
}

/// Physical memory formats understood by the CPU device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryFormat {
    X,
    Abc,
    Acb,
    NCw8c,
    NCw16c,
    Nchw,
    Nhwc,
    NChw8c,
    NChw16c,
    Ncdhw,
    Ndhwc,
    NCdhw8c,
    NCdhw16c,
}

impl MemoryFormat {
    #[must_use]
    pub const fn all() -> &'static [MemoryFormat] {
        &[
            MemoryFormat::X,
            MemoryFormat::Abc,
            MemoryFormat::Acb,
            MemoryFormat::NCw8c,
            MemoryFormat::NCw16c,
            MemoryFormat::Nchw,
            MemoryFormat::Nhwc,
            MemoryFormat::NChw8c,
            MemoryFormat::NChw16c,
            MemoryFormat::Ncdhw,
            MemoryFormat::Ndhwc,
            MemoryFormat::NCdhw8c,
            MemoryFormat::NCdhw16c,
        ]
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Abc => "abc",
            Self::Acb => "acb",
            Self::NCw8c => "nCw8c",
            Self::NCw16c => "nCw16c",
            Self::Nchw => "nchw",
            Self::Nhwc => "nhwc",
            Self::NChw8c => "nChw8c",
            Self::NChw16c => "nChw16c",
            Self::Ncdhw => "ncdhw",
            Self::Ndhwc => "ndhwc",
            Self::NCdhw8c => "nCdhw8c",
            Self::NCdhw16c => "nCdhw16c",
        }
    }

    #[must_use]
    pub const fn rank(self) -> usize {
        match self {
            Self::X => 1,
            Self::Abc | Self::Acb | Self::NCw8c | Self::NCw16c => 3,
            Self::Nchw | Self::Nhwc | Self::NChw8c | Self::NChw16c => 4,
            Self::Ncdhw | Self::Ndhwc | Self::NCdhw8c | Self::NCdhw16c => 5,
        }
    }

    #[must_use]
    pub const fn kind(self) -> FormatKind {
        match self {
            Self::X | Self::Abc | Self::Nchw | Self::Ncdhw => FormatKind::Planar,
            Self::Acb | Self::Nhwc | Self::Ndhwc => FormatKind::ChannelLast,
            Self::NCw8c | Self::NChw8c | Self::NCdhw8c => FormatKind::Blocked { block: 8 },
            Self::NCw16c | Self::NChw16c | Self::NCdhw16c => FormatKind::Blocked { block: 16 },
        }
    }

    #[must_use]
    pub fn planar_for_rank(rank: usize) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|format| format.rank() == rank && format.kind() == FormatKind::Planar)
    }

    #[must_use]
    pub fn from_name(raw: &str) -> Option<Self> {
        Self::all().iter().copied().find(|format| format.name() == raw)
    }

    /// Physical dimension order and extents for a logical shape in this
    /// format. Blocked formats split the channel axis into an outer count and
    /// an inner block appended last, padding channels up to the block size.
    pub fn blocked_dims(self, logical: &[usize]) -> Result<(Vec<usize>, Vec<usize>), ShapeError> {
        if logical.len() != self.rank() {
            return Err(ShapeError::FormatRankMismatch {
                format: self.name(),
                expected: self.rank(),
                actual: logical.len(),
            });
        }

        let rank = logical.len();
        match self.kind() {
            FormatKind::Planar => Ok(((0..rank).collect(), logical.to_vec())),
            FormatKind::ChannelLast => {
                let mut order = Vec::with_capacity(rank);
                order.push(0);
                order.extend(2..rank);
                order.push(1);
                let dims = order.iter().map(|&axis| logical[axis]).collect();
                Ok((order, dims))
            }
            FormatKind::Blocked { block } => {
                let mut order: Vec<usize> = (0..rank).collect();
                order.push(1);
                let mut dims = logical.to_vec();
                dims[1] = logical[1].div_ceil(block);
                dims.push(block);
                Ok((order, dims))
            }
        }
    }
}

impl fmt::Display for MemoryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Descriptor of one bound buffer: the logical shape, the format it is laid
/// out in and the resulting physical (blocked) extents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDesc {
    logical: Vec<usize>,
    format: MemoryFormat,
    precision: ElementPrecision,
    order: Vec<usize>,
    blocked: Vec<usize>,
    strides: Vec<usize>,
}

impl MemoryDesc {
    pub fn new(
        logical: &ConcreteShape,
        format: MemoryFormat,
        precision: ElementPrecision,
    ) -> Result<Self, ShapeError> {
        let (order, blocked) = format.blocked_dims(logical.dims())?;
        let strides = contiguous_strides(&blocked);
        Ok(Self {
            logical: logical.dims().to_vec(),
            format,
            precision,
            order,
            blocked,
            strides,
        })
    }

    #[must_use]
    pub fn logical_dims(&self) -> &[usize] {
        &self.logical
    }

    #[must_use]
    pub fn blocked_dims(&self) -> &[usize] {
        &self.blocked
    }

    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn format(&self) -> MemoryFormat {
        self.format
    }

    #[must_use]
    pub fn precision(&self) -> ElementPrecision {
        self.precision
    }

    pub fn byte_size(&self) -> Result<usize, ShapeError> {
        self.blocked
            .iter()
            .copied()
            .try_fold(self.precision.size_bytes(), usize::checked_mul)
            .ok_or(ShapeError::ByteSizeOverflow {
                dims: self.blocked.clone(),
                element_bytes: self.precision.size_bytes(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    RankMismatch {
        expected: usize,
        actual: usize,
    },
    FixedDimMismatch {
        dim: usize,
        expected: usize,
        actual: usize,
    },
    InvalidPartialDim {
        dim: usize,
        value: i64,
    },
    FormatRankMismatch {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    ByteSizeOverflow {
        dims: Vec<usize>,
        element_bytes: usize,
    },
    UnknownPrecision {
        label: String,
    },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankMismatch { expected, actual } => {
                write!(f, "rank mismatch: expected={expected}, actual={actual}")
            }
            Self::FixedDimMismatch {
                dim,
                expected,
                actual,
            } => write!(
                f,
                "fixed dimension {dim} changed: expected={expected}, actual={actual}"
            ),
            Self::InvalidPartialDim { dim, value } => {
                write!(f, "invalid partial-shape extent at dim={dim}: {value}")
            }
            Self::FormatRankMismatch {
                format,
                expected,
                actual,
            } => write!(
                f,
                "format {format} requires rank {expected}, got rank {actual}"
            ),
            Self::ByteSizeOverflow {
                dims,
                element_bytes,
            } => write!(
                f,
                "byte size overflow for blocked dims {dims:?} with element_bytes={element_bytes}"
            ),
            Self::UnknownPrecision { label } => write!(f, "unknown element precision '{label}'"),
        }
    }
}

impl std::error::Error for ShapeError {}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        ConcreteShape, ElementPrecision, FormatKind, MemoryDesc, MemoryFormat, ShapeError,
        SymbolicDim, SymbolicShape, contiguous_strides,
    };

    #[test]
    fn precision_table_is_indexed_by_discriminant() {
        for precision in ElementPrecision::all() {
            assert_eq!(precision.traits().precision, *precision);
        }
        assert_eq!(ElementPrecision::BF16.canonical_name(), "BF16");
        assert_eq!(ElementPrecision::I8.size_bytes(), 1);
        assert!(ElementPrecision::F32.traits().is_float);
        assert!(!ElementPrecision::I32.traits().is_float);
    }

    #[test]
    fn precision_parses_label_and_canonical_name() {
        assert_eq!(
            ElementPrecision::from_label("bf16").expect("label"),
            ElementPrecision::BF16
        );
        assert_eq!(
            ElementPrecision::from_label("FP32").expect("canonical"),
            ElementPrecision::F32
        );
        let err = ElementPrecision::from_label("f8").expect_err("unknown label must fail");
        assert!(matches!(err, ShapeError::UnknownPrecision { .. }));
    }

    #[test]
    fn partial_shape_parses_unknown_and_fixed() {
        let shape = SymbolicShape::from_partial(&[-1, 5, -1]).expect("valid partial shape");
        assert_eq!(
            shape.dims(),
            &[SymbolicDim::Unknown, SymbolicDim::Fixed(5), SymbolicDim::Unknown]
        );
        assert_eq!(shape.rank(), 3);
        assert!(!shape.is_static());
        assert_eq!(shape.to_string(), "[?,5,?]");
    }

    #[test]
    fn partial_shape_rejects_other_negative_extents() {
        let err = SymbolicShape::from_partial(&[-1, -2]).expect_err("-2 is not a valid extent");
        assert_eq!(err, ShapeError::InvalidPartialDim { dim: 1, value: -2 });
    }

    #[test]
    fn symbolic_shape_admits_compatible_concrete_shapes() {
        let pattern = SymbolicShape::from_partial(&[8, -1, -1]).expect("valid");
        assert!(pattern.admits(&ConcreteShape::new(vec![8, 5, 4])).is_ok());

        let rank_err = pattern
            .admits(&ConcreteShape::new(vec![8, 5]))
            .expect_err("rank mismatch must fail");
        assert_eq!(
            rank_err,
            ShapeError::RankMismatch {
                expected: 3,
                actual: 2
            }
        );

        let fixed_err = pattern
            .admits(&ConcreteShape::new(vec![7, 5, 4]))
            .expect_err("fixed dim change must fail");
        assert_eq!(
            fixed_err,
            ShapeError::FixedDimMismatch {
                dim: 0,
                expected: 8,
                actual: 7
            }
        );
    }

    #[test]
    fn concrete_shape_display_uses_dotted_form() {
        assert_eq!(ConcreteShape::new(vec![8, 5, 4]).to_string(), "(8.5.4)");
    }

    #[test]
    fn planar_format_keeps_logical_dims() {
        let (order, dims) = MemoryFormat::Nchw
            .blocked_dims(&[8, 5, 3, 4])
            .expect("rank 4 planar");
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(dims, vec![8, 5, 3, 4]);
    }

    #[test]
    fn channel_last_format_moves_channels_innermost() {
        let (order, dims) = MemoryFormat::Ndhwc
            .blocked_dims(&[1, 2, 3, 4, 5])
            .expect("rank 5 channel-last");
        assert_eq!(order, vec![0, 2, 3, 4, 1]);
        assert_eq!(dims, vec![1, 3, 4, 5, 2]);
    }

    #[test]
    fn blocked_format_pads_channels_to_block() {
        let (order, dims) = MemoryFormat::NCw16c
            .blocked_dims(&[8, 5, 4])
            .expect("rank 3 blocked");
        assert_eq!(order, vec![0, 1, 2, 1]);
        assert_eq!(dims, vec![8, 1, 4, 16]);

        let desc = MemoryDesc::new(
            &ConcreteShape::new(vec![8, 5, 4]),
            MemoryFormat::NCw16c,
            ElementPrecision::BF16,
        )
        .expect("desc");
        assert_eq!(desc.logical_dims(), &[8, 5, 4]);
        assert_eq!(desc.byte_size().expect("size"), 8 * 16 * 4 * 2);
        assert_eq!(desc.strides(), &[64, 64, 16, 1]);
    }

    #[test]
    fn format_rank_is_enforced() {
        let err = MemoryFormat::Nchw
            .blocked_dims(&[1, 2, 3])
            .expect_err("rank 3 shape in rank 4 format must fail");
        assert!(matches!(
            err,
            ShapeError::FormatRankMismatch {
                expected: 4,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn planar_lookup_and_name_round_trip() {
        assert_eq!(MemoryFormat::planar_for_rank(3), Some(MemoryFormat::Abc));
        assert_eq!(MemoryFormat::planar_for_rank(5), Some(MemoryFormat::Ncdhw));
        assert_eq!(MemoryFormat::planar_for_rank(6), None);
        assert_eq!(MemoryFormat::from_name("nChw8c"), Some(MemoryFormat::NChw8c));
        assert_eq!(
            MemoryFormat::NCdhw8c.kind(),
            FormatKind::Blocked { block: 8 }
        );
    }

    #[test]
    fn byte_size_overflow_is_reported() {
        let desc = MemoryDesc::new(
            &ConcreteShape::new(vec![usize::MAX, 1, 2]),
            MemoryFormat::Abc,
            ElementPrecision::F32,
        )
        .expect("desc itself does not allocate");
        assert!(matches!(
            desc.byte_size(),
            Err(ShapeError::ByteSizeOverflow { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_blocked_dims_cover_every_channel(
            batch in 1usize..=4,
            channels in 1usize..=40,
            width in 1usize..=6,
        ) {
            for format in [MemoryFormat::NCw8c, MemoryFormat::NCw16c] {
                let FormatKind::Blocked { block } = format.kind() else {
                    unreachable!("blocked formats only");
                };
                let (_, dims) = format.blocked_dims(&[batch, channels, width]).expect("rank 3");
                prop_assert!(dims[1] * block >= channels);
                prop_assert!(dims[1] * block < channels + block);
            }
        }

        #[test]
        fn prop_all_unknown_admits_any_shape_of_same_rank(
            dims in prop::collection::vec(0usize..=16, 3..=5),
        ) {
            let pattern = SymbolicShape::all_unknown(dims.len());
            prop_assert!(pattern.admits(&ConcreteShape::new(dims.clone())).is_ok());
            let strides = contiguous_strides(dims.as_slice());
            prop_assert_eq!(strides.len(), dims.len());
            prop_assert_eq!(strides.last().copied(), Some(1));
        }
    }
}
