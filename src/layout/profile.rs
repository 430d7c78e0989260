//! Platform ABI policy: alignment rules, aggregate passing and return
//! thresholds, selected per target triple.

use serde::{Deserialize, Serialize};

use crate::target::{Target, TargetArch, TargetOs};

use super::{Layout, ScalarKind, MIN_ALIGN};

/// How a group positions its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldRule {
    /// Each member at its natural alignment.
    Natural,
    /// Member alignment capped at `limit` bytes.
    Packed { limit: usize },
    /// The AIX/PPC rule: an 8-byte float member aligns to 4 unless it is
    /// the first member of its group.
    PowerOpen,
}

/// When a by-value aggregate argument degrades to a pointer to a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateRule {
    /// Aggregates up to `bytes` travel directly; larger ones indirectly.
    SizeAtMost { bytes: usize },
    /// Only aggregates of exactly 1, 2, 4 or 8 bytes travel directly
    /// (the Windows convention).
    ExactRegisterSizes,
}

/// A target platform's layout and call-boundary policy.
///
/// Identical field lists produce different sizes and offsets under
/// different profiles; callers select one per target instead of the layout
/// logic hardcoding any platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiProfile {
    field_rule: FieldRule,
    aggregate_rule: AggregateRule,
    return_threshold: usize,
    strict_alignment: bool,
}

impl AbiProfile {
    /// Natural C alignment with the SysV aggregate conventions.
    #[must_use]
    pub fn natural() -> Self {
        Self {
            field_rule: FieldRule::Natural,
            aggregate_rule: AggregateRule::SizeAtMost { bytes: 16 },
            return_threshold: 16,
            strict_alignment: false,
        }
    }

    /// No implicit padding beyond `limit`-byte member alignment.
    #[must_use]
    pub fn packed(limit: usize) -> Self {
        Self {
            field_rule: FieldRule::Packed {
                limit: limit.max(MIN_ALIGN),
            },
            ..Self::natural()
        }
    }

    /// The AIX/PPC policy: PowerOpen member alignment, every aggregate
    /// returned through a caller-supplied buffer.
    #[must_use]
    pub fn power_open() -> Self {
        Self {
            field_rule: FieldRule::PowerOpen,
            aggregate_rule: AggregateRule::SizeAtMost { bytes: 16 },
            return_threshold: 0,
            strict_alignment: false,
        }
    }

    /// Select the profile for a target triple.
    #[must_use]
    pub fn for_target(target: &Target) -> Self {
        match (target.arch(), target.os()) {
            (TargetArch::Ppc64, TargetOs::Aix) => Self::power_open(),
            (_, TargetOs::Windows) => Self {
                field_rule: FieldRule::Natural,
                aggregate_rule: AggregateRule::ExactRegisterSizes,
                return_threshold: 8,
                strict_alignment: false,
            },
            _ => Self::natural(),
        }
    }

    /// The profile of the machine this process runs on.
    #[must_use]
    pub fn host() -> Self {
        Self::for_target(&Target::host())
    }

    /// Return a copy that fails misaligned accesses instead of tolerating
    /// them.
    #[must_use]
    pub fn with_strict_alignment(mut self, strict: bool) -> Self {
        self.strict_alignment = strict;
        self
    }

    #[must_use]
    pub fn field_rule(&self) -> FieldRule {
        self.field_rule
    }

    #[must_use]
    pub fn aggregate_rule(&self) -> AggregateRule {
        self.aggregate_rule
    }

    /// Largest aggregate return that stays in registers; anything bigger
    /// travels through a caller-allocated buffer passed as a hidden
    /// argument.
    #[must_use]
    pub fn return_threshold(&self) -> usize {
        self.return_threshold
    }

    #[must_use]
    pub fn strict_alignment(&self) -> bool {
        self.strict_alignment
    }

    /// Effective alignment of a group member under this profile's rule.
    pub(crate) fn field_alignment(&self, layout: &Layout, is_first: bool) -> usize {
        let natural = layout.alignment(self);
        match self.field_rule {
            FieldRule::Natural => natural,
            FieldRule::Packed { limit } => natural.min(limit).max(MIN_ALIGN),
            FieldRule::PowerOpen => match layout {
                Layout::Scalar {
                    kind: ScalarKind::Float,
                    width: 8,
                } if !is_first => 4,
                _ => natural,
            },
        }
    }
}

impl Default for AbiProfile {
    fn default() -> Self {
        Self::natural()
    }
}
