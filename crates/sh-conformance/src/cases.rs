use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use sh_core::{ConcreteShape, ElementPrecision, MemoryFormat, ShapeError, SymbolicShape};
use sh_dispatch::{ImplType, selected_type_tag};
use sh_graph::{INPUT_MEMORY_FORMATS, OUTPUT_MEMORY_FORMATS, PRIMITIVES_PRIORITY, RtInfo};

pub const SUPPORTED_RANKS: [usize; 3] = [3, 4, 5];
pub const DEFAULT_PRECISIONS: [ElementPrecision; 4] = [
    ElementPrecision::F32,
    ElementPrecision::BF16,
    ElementPrecision::I32,
    ElementPrecision::I8,
];
pub const MIN_SHAPES_PER_FAMILY: usize = 3;
pub const MIN_FAMILIES_PER_RANK: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnsupportedRank {
        rank: usize,
    },
    UnknownPrecision {
        label: String,
    },
    StaticShapeExcluded {
        family: String,
    },
    Shape {
        family: String,
        shape_index: Option<usize>,
        source: ShapeError,
    },
    TooFewShapes {
        family: String,
        count: usize,
    },
    LeadingDimsChanged {
        family: String,
        shape_index: usize,
    },
    LastDimNotDecreasing {
        family: String,
        shape_index: usize,
        previous: usize,
        actual: usize,
    },
    InsufficientCoverage {
        rank: usize,
        families: usize,
    },
    MissingUnitLastDim {
        rank: usize,
    },
    LayoutRankMismatch {
        family: String,
        rank: usize,
        format: MemoryFormat,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedRank { rank } => {
                write!(f, "rank {rank} is not covered; supported ranks are 3, 4 and 5")
            }
            Self::UnknownPrecision { label } => write!(f, "unknown precision '{label}'"),
            Self::StaticShapeExcluded { family } => write!(
                f,
                "family '{family}' has a fully static input shape; shape_of would be folded away"
            ),
            Self::Shape {
                family,
                shape_index: Some(index),
                source,
            } => write!(f, "family '{family}' shape #{index}: {source}"),
            Self::Shape {
                family,
                shape_index: None,
                source,
            } => write!(f, "family '{family}' partial shape: {source}"),
            Self::TooFewShapes { family, count } => write!(
                f,
                "family '{family}' has {count} shapes, needs at least {MIN_SHAPES_PER_FAMILY}"
            ),
            Self::LeadingDimsChanged {
                family,
                shape_index,
            } => write!(
                f,
                "family '{family}' shape #{shape_index} changes a leading dimension"
            ),
            Self::LastDimNotDecreasing {
                family,
                shape_index,
                previous,
                actual,
            } => write!(
                f,
                "family '{family}' shape #{shape_index}: last dim {actual} does not decrease from {previous}"
            ),
            Self::InsufficientCoverage { rank, families } => write!(
                f,
                "rank {rank} has {families} shape families, needs at least {MIN_FAMILIES_PER_RANK}"
            ),
            Self::MissingUnitLastDim { rank } => {
                write!(f, "no rank {rank} family reaches a last dimension of 1")
            }
            Self::LayoutRankMismatch {
                family,
                rank,
                format,
            } => write!(
                f,
                "family '{family}' is rank {rank} but layout {format} is rank {}",
                format.rank()
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// One symbolic input shape and the concrete shapes bound to it in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeFamily {
    pub name: String,
    pub symbolic: SymbolicShape,
    pub shapes: Vec<ConcreteShape>,
}

impl ShapeFamily {
    /// Builds and validates a family from partial-shape notation.
    pub fn from_partial(
        name: impl Into<String>,
        partial: &[i64],
        shapes: Vec<Vec<usize>>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let symbolic = SymbolicShape::from_partial(partial).map_err(|source| ConfigError::Shape {
            family: name.clone(),
            shape_index: None,
            source,
        })?;
        let family = Self {
            name,
            symbolic,
            shapes: shapes.into_iter().map(ConcreteShape::new).collect(),
        };
        validate_family(&family)?;
        Ok(family)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.symbolic.rank()
    }

    #[must_use]
    pub fn reaches_unit_last_dim(&self) -> bool {
        self.shapes.iter().any(|shape| shape.last_dim() == Some(1))
    }
}

pub fn validate_family(family: &ShapeFamily) -> Result<(), ConfigError> {
    validate_shapes(&family.name, &family.symbolic, &family.shapes)
}

fn validate_shapes(
    family: &str,
    symbolic: &SymbolicShape,
    shapes: &[ConcreteShape],
) -> Result<(), ConfigError> {
    let rank = symbolic.rank();
    if !SUPPORTED_RANKS.contains(&rank) {
        return Err(ConfigError::UnsupportedRank { rank });
    }
    if symbolic.is_static() {
        return Err(ConfigError::StaticShapeExcluded {
            family: family.to_string(),
        });
    }
    if shapes.len() < MIN_SHAPES_PER_FAMILY {
        return Err(ConfigError::TooFewShapes {
            family: family.to_string(),
            count: shapes.len(),
        });
    }

    for (index, shape) in shapes.iter().enumerate() {
        symbolic
            .admits(shape)
            .map_err(|source| ConfigError::Shape {
                family: family.to_string(),
                shape_index: Some(index),
                source,
            })?;
    }

    for (index, pair) in shapes.windows(2).enumerate() {
        let (previous, current) = (&pair[0], &pair[1]);
        let leading = rank - 1;
        if previous.dims()[..leading] != current.dims()[..leading] {
            return Err(ConfigError::LeadingDimsChanged {
                family: family.to_string(),
                shape_index: index + 1,
            });
        }
        let (before, after) = (previous.dims()[leading], current.dims()[leading]);
        if after >= before {
            return Err(ConfigError::LastDimNotDecreasing {
                family: family.to_string(),
                shape_index: index + 1,
                previous: before,
                actual: after,
            });
        }
    }
    Ok(())
}

/// Every supported rank needs enough families, and one of them must end on a
/// unit last dimension.
pub fn validate_suite_coverage(families: &[ShapeFamily]) -> Result<(), ConfigError> {
    match coverage_gaps(families).into_iter().next() {
        Some((_, error)) => Err(error),
        None => Ok(()),
    }
}

fn coverage_gaps(families: &[ShapeFamily]) -> Vec<(usize, ConfigError)> {
    let mut by_rank: BTreeMap<usize, Vec<&ShapeFamily>> = BTreeMap::new();
    for family in families {
        by_rank.entry(family.rank()).or_default().push(family);
    }
    let mut gaps = Vec::new();
    for rank in SUPPORTED_RANKS {
        let ranked = by_rank.get(&rank).map_or(&[][..], Vec::as_slice);
        if ranked.len() < MIN_FAMILIES_PER_RANK {
            gaps.push((
                rank,
                ConfigError::InsufficientCoverage {
                    rank,
                    families: ranked.len(),
                },
            ));
        } else if !ranked.iter().any(|family| family.reaches_unit_last_dim()) {
            gaps.push((rank, ConfigError::MissingUnitLastDim { rank }));
        }
    }
    gaps
}

/// A requested physical layout for one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutSpec {
    pub input_format: MemoryFormat,
    pub output_format: MemoryFormat,
    pub primitive: ImplType,
}

impl LayoutSpec {
    #[must_use]
    pub fn new(input_format: MemoryFormat) -> Self {
        Self {
            input_format,
            output_format: MemoryFormat::X,
            primitive: ImplType::Ref,
        }
    }

    #[must_use]
    pub fn tag(&self) -> String {
        format!(
            "inFmts={}_outFmts={}",
            self.input_format, self.output_format
        )
    }

    #[must_use]
    pub fn expected_type(&self, precision: ElementPrecision) -> String {
        selected_type_tag(self.primitive, precision)
    }

    #[must_use]
    pub fn rt_info(&self) -> RtInfo {
        RtInfo::new()
            .with(INPUT_MEMORY_FORMATS, format!("cpu:{}", self.input_format))
            .with(OUTPUT_MEMORY_FORMATS, format!("cpu:{}", self.output_format))
            .with(PRIMITIVES_PRIORITY, format!("cpu:{}", self.primitive.name()))
    }
}

pub fn layouts_for_rank(rank: usize) -> Result<Vec<LayoutSpec>, ConfigError> {
    let formats: &[MemoryFormat] = match rank {
        3 => &[
            MemoryFormat::NCw16c,
            MemoryFormat::NCw8c,
            MemoryFormat::Abc,
            MemoryFormat::Acb,
        ],
        4 => &[
            MemoryFormat::NChw16c,
            MemoryFormat::NChw8c,
            MemoryFormat::Nchw,
            MemoryFormat::Nhwc,
        ],
        5 => &[
            MemoryFormat::NCdhw16c,
            MemoryFormat::NCdhw8c,
            MemoryFormat::Ncdhw,
            MemoryFormat::Ndhwc,
        ],
        _ => return Err(ConfigError::UnsupportedRank { rank }),
    };
    Ok(formats.iter().copied().map(LayoutSpec::new).collect())
}

pub fn parse_precision(label: &str) -> Result<ElementPrecision, ConfigError> {
    ElementPrecision::from_label(label).map_err(|_| ConfigError::UnknownPrecision {
        label: label.to_string(),
    })
}

/// Everything needed to build, compile and drive one graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub index: usize,
    pub family: String,
    pub symbolic: SymbolicShape,
    pub shapes: Vec<ConcreteShape>,
    pub precision: ElementPrecision,
    pub layout: LayoutSpec,
}

impl TestCase {
    #[must_use]
    pub fn rank(&self) -> usize {
        self.symbolic.rank()
    }

    #[must_use]
    pub fn name(&self) -> String {
        let shapes: String = self.shapes.iter().map(ToString::to_string).collect();
        format!(
            "ShapeOfTest_{}_Prec={}_{}_IS={shapes}",
            self.index,
            self.precision,
            self.layout.tag()
        )
    }

    #[must_use]
    pub fn expected_type(&self) -> String {
        self.layout.expected_type(self.precision)
    }

    /// Re-checks the family contract and the layout rank. Cases are plain data,
    /// so a hand-built one can break either.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_shapes(&self.family, &self.symbolic, &self.shapes)?;
        let format = self.layout.input_format;
        if format.rank() != self.rank() {
            return Err(ConfigError::LayoutRankMismatch {
                family: self.family.clone(),
                rank: self.rank(),
                format,
            });
        }
        Ok(())
    }
}

/// Flattens families x precisions x layouts into indexed cases. Families are
/// re-validated so hand-built input fails the same way fixture input does.
pub fn enumerate_test_cases(
    families: &[ShapeFamily],
    precisions: &[ElementPrecision],
) -> Result<Vec<TestCase>, ConfigError> {
    let mut cases = Vec::new();
    for family in families {
        validate_family(family)?;
        let layouts = layouts_for_rank(family.rank())?;
        for &precision in precisions {
            for layout in &layouts {
                cases.push(TestCase {
                    index: cases.len(),
                    family: family.name.clone(),
                    symbolic: family.symbolic.clone(),
                    shapes: family.shapes.clone(),
                    precision,
                    layout: *layout,
                });
            }
        }
    }
    Ok(cases)
}

/// What a fixture entry was rejected as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectedSubject {
    Family {
        name: String,
        rank: usize,
        shapes: Vec<Vec<usize>>,
    },
    Precision {
        label: String,
    },
    Coverage {
        rank: usize,
    },
}

/// A fixture entry that failed validation. Only the cases it would have
/// produced are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    pub subject: RejectedSubject,
    pub error: ConfigError,
}

impl RejectedEntry {
    #[must_use]
    pub fn rank(&self) -> Option<usize> {
        match &self.subject {
            RejectedSubject::Family { rank, .. } | RejectedSubject::Coverage { rank } => {
                Some(*rank)
            }
            RejectedSubject::Precision { .. } => None,
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        match &self.subject {
            RejectedSubject::Family { name, .. } => format!("Family={name}"),
            RejectedSubject::Precision { label } => format!("Prec={label}"),
            RejectedSubject::Coverage { rank } => format!("Rank={rank}_coverage"),
        }
    }
}

/// Validated families and precisions, plus whatever the fixture had that
/// could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeOfSuite {
    pub families: Vec<ShapeFamily>,
    pub precisions: Vec<ElementPrecision>,
    pub rejected: Vec<RejectedEntry>,
}

impl ShapeOfSuite {
    pub fn test_cases(&self) -> Result<Vec<TestCase>, ConfigError> {
        enumerate_test_cases(&self.families, &self.precisions)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ShapeOfFixtureFile {
    pub(crate) precisions: Vec<String>,
    pub(crate) families: Vec<ShapeFamilyFixture>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ShapeFamilyFixture {
    pub(crate) name: String,
    pub(crate) partial_shape: Vec<i64>,
    pub(crate) shapes: Vec<Vec<usize>>,
}

impl ShapeOfFixtureFile {
    /// Validates every entry on its own; bad entries are set aside.
    pub(crate) fn into_suite(self) -> ShapeOfSuite {
        let mut rejected = Vec::new();

        let mut precisions = Vec::with_capacity(self.precisions.len());
        for label in self.precisions {
            match parse_precision(label.as_str()) {
                Ok(precision) => precisions.push(precision),
                Err(error) => rejected.push(RejectedEntry {
                    subject: RejectedSubject::Precision { label },
                    error,
                }),
            }
        }

        let mut families = Vec::with_capacity(self.families.len());
        for entry in self.families {
            let rank = entry.partial_shape.len();
            match ShapeFamily::from_partial(
                entry.name.as_str(),
                &entry.partial_shape,
                entry.shapes.clone(),
            ) {
                Ok(family) => families.push(family),
                Err(error) => rejected.push(RejectedEntry {
                    subject: RejectedSubject::Family {
                        name: entry.name,
                        rank,
                        shapes: entry.shapes,
                    },
                    error,
                }),
            }
        }

        for (rank, error) in coverage_gaps(&families) {
            rejected.push(RejectedEntry {
                subject: RejectedSubject::Coverage { rank },
                error,
            });
        }

        ShapeOfSuite {
            families,
            precisions,
            rejected,
        }
    }
}
