#![forbid(unsafe_code)]

use std::fmt;

use sh_core::{ElementPrecision, FormatKind, MemoryFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImplType {
    Ref,
}

impl ImplType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ref => "ref",
        }
    }

    #[must_use]
    pub fn from_name(raw: &str) -> Option<Self> {
        match raw {
            "ref" => Some(Self::Ref),
            _ => None,
        }
    }
}

/// One way the engine can run ShapeOf: input layout, output layout, kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrimitiveDesc {
    pub input_format: MemoryFormat,
    pub output_format: MemoryFormat,
    pub impl_type: ImplType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// An unsatisfiable hint is an error.
    Strict,
    /// An unsatisfiable hint falls back to the highest-priority descriptor.
    Fallback,
}

/// Layout steering attached to a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectionHint {
    pub input_format: Option<MemoryFormat>,
    pub output_format: Option<MemoryFormat>,
    pub impl_type: Option<ImplType>,
}

impl SelectionHint {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_format.is_none() && self.output_format.is_none() && self.impl_type.is_none()
    }

    fn accepts(&self, desc: &PrimitiveDesc) -> bool {
        self.input_format
            .is_none_or(|format| format == desc.input_format)
            && self
                .output_format
                .is_none_or(|format| format == desc.output_format)
            && self.impl_type.is_none_or(|kind| kind == desc.impl_type)
    }
}

const fn format_priority(kind: FormatKind) -> u8 {
    match kind {
        FormatKind::Planar => 0,
        FormatKind::ChannelLast => 1,
        FormatKind::Blocked { block: 16 } => 2,
        FormatKind::Blocked { .. } => 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    UnsupportedRank { rank: usize },
    NoCandidates { rank: usize },
    HintUnsatisfied { rank: usize, hint: SelectionHint },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedRank { rank } => {
                write!(f, "shape_of has no primitive descriptors for rank {rank}")
            }
            Self::NoCandidates { rank } => {
                write!(f, "primitive descriptor table is empty for rank {rank}")
            }
            Self::HintUnsatisfied { rank, hint } => write!(
                f,
                "layout hint cannot be satisfied for rank {rank}: in={:?} out={:?} impl={:?}",
                hint.input_format.map(MemoryFormat::name),
                hint.output_format.map(MemoryFormat::name),
                hint.impl_type.map(ImplType::name)
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

/// ShapeOf accepts any input layout of its rank and always writes a planar
/// 1-D output. Descriptors are returned in priority order.
pub fn shape_of_descriptors(rank: usize) -> Result<Vec<PrimitiveDesc>, DispatchError> {
    if rank == 0 || rank > 5 {
        return Err(DispatchError::UnsupportedRank { rank });
    }

    let mut descs: Vec<PrimitiveDesc> = MemoryFormat::all()
        .iter()
        .copied()
        .filter(|format| format.rank() == rank)
        .map(|format| PrimitiveDesc {
            input_format: format,
            output_format: MemoryFormat::X,
            impl_type: ImplType::Ref,
        })
        .collect();
    descs.sort_by_key(|desc| format_priority(desc.input_format.kind()));

    if descs.is_empty() {
        return Err(DispatchError::NoCandidates { rank });
    }
    Ok(descs)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionDecision {
    pub desc: PrimitiveDesc,
    pub precision: ElementPrecision,
    pub selected_type: String,
    pub candidates: usize,
    pub fallback_used: bool,
}

#[must_use]
pub fn selected_type_tag(impl_type: ImplType, precision: ElementPrecision) -> String {
    format!("{}_{}", impl_type.name(), precision.canonical_name())
}

pub fn select_shape_of_primitive(
    rank: usize,
    precision: ElementPrecision,
    hint: SelectionHint,
    policy: SelectionPolicy,
) -> Result<SelectionDecision, DispatchError> {
    let descs = shape_of_descriptors(rank)?;
    let candidates = descs.len();

    let (desc, fallback_used) = match descs.iter().find(|desc| hint.accepts(desc)) {
        Some(desc) => (*desc, false),
        None => match policy {
            SelectionPolicy::Strict => {
                return Err(DispatchError::HintUnsatisfied { rank, hint });
            }
            SelectionPolicy::Fallback => {
                let first = descs.first().ok_or(DispatchError::NoCandidates { rank })?;
                (*first, true)
            }
        },
    };

    Ok(SelectionDecision {
        desc,
        precision,
        selected_type: selected_type_tag(desc.impl_type, precision),
        candidates,
        fallback_used,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sh_core::{ElementPrecision, MemoryFormat};

    use super::{
        DispatchError, ImplType, SelectionHint, SelectionPolicy, select_shape_of_primitive,
        selected_type_tag, shape_of_descriptors,
    };

    #[test]
    fn descriptors_are_priority_ordered() {
        let descs = shape_of_descriptors(4).expect("rank 4 supported");
        let formats: Vec<_> = descs.iter().map(|desc| desc.input_format).collect();
        assert_eq!(
            formats,
            vec![
                MemoryFormat::Nchw,
                MemoryFormat::Nhwc,
                MemoryFormat::NChw16c,
                MemoryFormat::NChw8c
            ]
        );
        assert!(descs.iter().all(|desc| desc.output_format == MemoryFormat::X));
    }

    #[test]
    fn unsupported_rank_is_rejected() {
        assert_eq!(
            shape_of_descriptors(6),
            Err(DispatchError::UnsupportedRank { rank: 6 })
        );
        assert_eq!(
            shape_of_descriptors(0),
            Err(DispatchError::UnsupportedRank { rank: 0 })
        );
    }

    #[test]
    fn rank_one_has_only_x_and_rank_two_has_no_formats() {
        let descs = shape_of_descriptors(1).expect("rank 1 supported");
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].input_format, MemoryFormat::X);
        assert_eq!(
            shape_of_descriptors(2),
            Err(DispatchError::NoCandidates { rank: 2 })
        );
    }

    #[test]
    fn empty_hint_selects_planar() {
        let decision = select_shape_of_primitive(
            3,
            ElementPrecision::F32,
            SelectionHint::default(),
            SelectionPolicy::Strict,
        )
        .expect("planar available");
        assert_eq!(decision.desc.input_format, MemoryFormat::Abc);
        assert_eq!(decision.selected_type, "ref_FP32");
        assert!(!decision.fallback_used);
        assert_eq!(decision.candidates, 4);
    }

    #[test]
    fn hint_steers_to_blocked_layout() {
        let hint = SelectionHint {
            input_format: Some(MemoryFormat::NCdhw8c),
            output_format: Some(MemoryFormat::X),
            impl_type: Some(ImplType::Ref),
        };
        let decision =
            select_shape_of_primitive(5, ElementPrecision::BF16, hint, SelectionPolicy::Strict)
                .expect("blocked layout available");
        assert_eq!(decision.desc.input_format, MemoryFormat::NCdhw8c);
        assert_eq!(decision.selected_type, "ref_BF16");
    }

    #[test]
    fn wrong_rank_hint_fails_closed_in_strict_policy() {
        let hint = SelectionHint {
            input_format: Some(MemoryFormat::Nchw),
            ..SelectionHint::default()
        };
        let err = select_shape_of_primitive(3, ElementPrecision::I8, hint, SelectionPolicy::Strict)
            .expect_err("rank 4 format cannot serve rank 3 input");
        assert!(matches!(err, DispatchError::HintUnsatisfied { rank: 3, .. }));
    }

    #[test]
    fn wrong_rank_hint_falls_back_to_planar() {
        let hint = SelectionHint {
            input_format: Some(MemoryFormat::Nchw),
            ..SelectionHint::default()
        };
        let decision =
            select_shape_of_primitive(3, ElementPrecision::I8, hint, SelectionPolicy::Fallback)
                .expect("fallback always succeeds for supported ranks");
        assert_eq!(decision.desc.input_format, MemoryFormat::Abc);
        assert!(decision.fallback_used);
        assert_eq!(decision.selected_type, "ref_I8");
    }

    #[test]
    fn selected_type_uses_canonical_precision_name() {
        assert_eq!(
            selected_type_tag(ImplType::Ref, ElementPrecision::I32),
            "ref_I32"
        );
        assert_eq!(ImplType::from_name("ref"), Some(ImplType::Ref));
        assert_eq!(ImplType::from_name("jit"), None);
    }

    proptest! {
        #[test]
        fn prop_every_same_rank_hint_is_honoured(
            rank in 3usize..=5,
            pick in 0usize..4,
            precision_idx in 0usize..4,
        ) {
            let precision = [
                ElementPrecision::F32,
                ElementPrecision::BF16,
                ElementPrecision::I32,
                ElementPrecision::I8,
            ][precision_idx];
            let descs = shape_of_descriptors(rank).expect("supported rank");
            let wanted = descs[pick % descs.len()];
            let hint = SelectionHint {
                input_format: Some(wanted.input_format),
                output_format: Some(wanted.output_format),
                impl_type: Some(wanted.impl_type),
            };
            let decision = select_shape_of_primitive(rank, precision, hint, SelectionPolicy::Strict)
                .expect("same-rank hint is satisfiable");
            prop_assert_eq!(decision.desc, wanted);
            prop_assert!(!decision.fallback_used);
        }
    }
}
