//! In-memory shape descriptions: byte size, alignment and field offsets.
//!
//! A [`Layout`] is a closed tagged variant over the finite set of shapes a
//! native value can take. Descriptors carry no offsets of their own; size,
//! alignment and field offsets are always computed against an
//! [`AbiProfile`], so the same descriptor serves every platform policy.

mod profile;

pub use profile::{AbiProfile, AggregateRule, FieldRule};

use std::fmt::Write as _;
use std::mem;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub(crate) const MIN_ALIGN: usize = 1;

pub(crate) fn align_to(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// The finite set of scalar value categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Int,
    Float,
    Bool,
    Char,
    Pointer,
}

impl ScalarKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Bool => "bool",
            ScalarKind::Char => "char",
            ScalarKind::Pointer => "pointer",
        }
    }
}

pub(crate) fn scalar_name(kind: ScalarKind, width: usize) -> String {
    match kind {
        ScalarKind::Bool => "bool".to_string(),
        ScalarKind::Pointer => "pointer".to_string(),
        ScalarKind::Int | ScalarKind::Float | ScalarKind::Char => {
            format!("{}{}", kind.label(), width * 8)
        }
    }
}

/// A named or anonymous member of a [`Layout::Group`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub name: Option<String>,
    pub layout: Layout,
}

impl Member {
    #[must_use]
    pub fn named(name: impl Into<String>, layout: Layout) -> Self {
        Self {
            name: Some(name.into()),
            layout,
        }
    }

    #[must_use]
    pub fn anon(layout: Layout) -> Self {
        Self { name: None, layout }
    }
}

/// Description of how a value occupies memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// A primitive value of a fixed width.
    Scalar { kind: ScalarKind, width: usize },
    /// An ordered sequence of members laid out per the profile's field rule.
    Group { members: Vec<Member> },
    /// `count` adjacent copies of the same element layout.
    Sequence { element: Box<Layout>, count: usize },
    /// Reserved bytes carrying no logical value. Alignment 1.
    Padding { width: usize },
}

impl Layout {
    #[must_use]
    pub fn scalar(kind: ScalarKind, width: usize) -> Self {
        Layout::Scalar { kind, width }
    }

    #[must_use]
    pub fn int8() -> Self {
        Self::scalar(ScalarKind::Int, 1)
    }

    #[must_use]
    pub fn int16() -> Self {
        Self::scalar(ScalarKind::Int, 2)
    }

    #[must_use]
    pub fn int32() -> Self {
        Self::scalar(ScalarKind::Int, 4)
    }

    #[must_use]
    pub fn int64() -> Self {
        Self::scalar(ScalarKind::Int, 8)
    }

    #[must_use]
    pub fn float32() -> Self {
        Self::scalar(ScalarKind::Float, 4)
    }

    #[must_use]
    pub fn float64() -> Self {
        Self::scalar(ScalarKind::Float, 8)
    }

    #[must_use]
    pub fn boolean() -> Self {
        Self::scalar(ScalarKind::Bool, 1)
    }

    #[must_use]
    pub fn char8() -> Self {
        Self::scalar(ScalarKind::Char, 1)
    }

    #[must_use]
    pub fn char16() -> Self {
        Self::scalar(ScalarKind::Char, 2)
    }

    #[must_use]
    pub fn pointer() -> Self {
        Self::scalar(ScalarKind::Pointer, mem::size_of::<usize>())
    }

    #[must_use]
    pub fn group(members: Vec<Member>) -> Self {
        Layout::Group { members }
    }

    #[must_use]
    pub fn sequence(element: Layout, count: usize) -> Self {
        Layout::Sequence {
            element: Box::new(element),
            count,
        }
    }

    #[must_use]
    pub fn padding(width: usize) -> Self {
        Layout::Padding { width }
    }

    /// Total byte size of a value of this shape under `profile`.
    ///
    /// Group sizes include inserted and trailing padding, so arrays of the
    /// group stride correctly.
    #[must_use]
    pub fn byte_size(&self, profile: &AbiProfile) -> usize {
        match self {
            Layout::Scalar { width, .. } | Layout::Padding { width } => *width,
            Layout::Sequence { element, count } => element.byte_size(profile) * count,
            Layout::Group { members } => group_metrics(members, profile).0,
        }
    }

    /// Required alignment of a value of this shape under `profile`.
    #[must_use]
    pub fn alignment(&self, profile: &AbiProfile) -> usize {
        match self {
            Layout::Scalar { width, .. } => (*width).max(MIN_ALIGN),
            Layout::Padding { .. } => MIN_ALIGN,
            Layout::Sequence { element, .. } => element.alignment(profile),
            Layout::Group { members } => group_metrics(members, profile).1,
        }
    }

    /// Byte offset of the field at a dotted `path` (e.g. `"inner.elem2"`).
    ///
    /// # Errors
    ///
    /// Fails with [`Error::FieldNotFound`] when a segment does not name a
    /// member at its nesting level. Padding members are never traversed.
    pub fn offset_of(&self, path: &str, profile: &AbiProfile) -> Result<usize> {
        self.resolve(path, profile).map(|(offset, _)| offset)
    }

    /// The layout of the field at a dotted `path`.
    pub fn field(&self, path: &str, profile: &AbiProfile) -> Result<&Layout> {
        self.resolve(path, profile).map(|(_, layout)| layout)
    }

    /// Resolve a dotted path to `(offset, layout)` in one walk.
    pub(crate) fn resolve(&self, path: &str, profile: &AbiProfile) -> Result<(usize, &Layout)> {
        let mut current = self;
        let mut base = 0usize;
        for segment in path.split('.') {
            let Layout::Group { members } = current else {
                return Err(Error::FieldNotFound {
                    path: path.to_string(),
                    segment: segment.to_string(),
                });
            };
            let offsets = member_offsets(members, profile);
            let found = members
                .iter()
                .zip(offsets)
                .find(|(member, _)| member.name.as_deref() == Some(segment));
            let Some((member, offset)) = found else {
                return Err(Error::FieldNotFound {
                    path: path.to_string(),
                    segment: segment.to_string(),
                });
            };
            base += offset;
            current = &member.layout;
        }
        Ok((base, current))
    }

    /// Human-readable field/offset table for diagnostics.
    #[must_use]
    pub fn describe(&self, profile: &AbiProfile) -> String {
        let mut out = String::new();
        describe_into(&mut out, self, profile, 0, 0);
        out
    }
}

/// `(size, alignment)` of a group's members under the profile's field rule.
fn group_metrics(members: &[Member], profile: &AbiProfile) -> (usize, usize) {
    let mut cursor = 0usize;
    let mut align = MIN_ALIGN;
    for (index, member) in members.iter().enumerate() {
        let member_align = profile.field_alignment(&member.layout, index == 0);
        align = align.max(member_align);
        cursor = align_to(cursor, member_align);
        cursor += member.layout.byte_size(profile);
    }
    (align_to(cursor, align), align)
}

/// Offset of each member, in declaration order, under the profile's rule.
pub(crate) fn member_offsets(members: &[Member], profile: &AbiProfile) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(members.len());
    let mut cursor = 0usize;
    for (index, member) in members.iter().enumerate() {
        let member_align = profile.field_alignment(&member.layout, index == 0);
        cursor = align_to(cursor, member_align);
        offsets.push(cursor);
        cursor += member.layout.byte_size(profile);
    }
    offsets
}

fn describe_into(out: &mut String, layout: &Layout, profile: &AbiProfile, indent: usize, at: usize) {
    let pad = "  ".repeat(indent);
    match layout {
        Layout::Scalar { kind, width } => {
            let _ = writeln!(out, "{pad}{} @{at}", scalar_name(*kind, *width));
        }
        Layout::Padding { width } => {
            let _ = writeln!(out, "{pad}<padding {width}> @{at}");
        }
        Layout::Sequence { element, count } => {
            let _ = writeln!(
                out,
                "{pad}sequence x{count} (stride {}) @{at}",
                element.byte_size(profile)
            );
            describe_into(out, element, profile, indent + 1, at);
        }
        Layout::Group { members } => {
            let _ = writeln!(
                out,
                "{pad}group size={} align={} @{at}",
                layout.byte_size(profile),
                layout.alignment(profile)
            );
            let offsets = member_offsets(members, profile);
            for (member, offset) in members.iter().zip(offsets) {
                if let Some(name) = &member.name {
                    let _ = writeln!(out, "{pad}  {name}:");
                    describe_into(out, &member.layout, profile, indent + 2, at + offset);
                } else {
                    describe_into(out, &member.layout, profile, indent + 1, at + offset);
                }
            }
        }
    }
}
