use std::error::Error as StdError;
use std::fmt;

/// Unified error type for the marshalling layer.
///
/// Every variant is raised before the native boundary is crossed and names
/// enough context (field path, expected vs actual size or alignment) to
/// diagnose the failure without inspecting the native side. A fault raised
/// inside a native callee is process-fatal and deliberately has no variant
/// here: nothing in this layer catches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An access would run past the end of a memory region.
    OutOfBounds {
        field: Option<String>,
        offset: usize,
        len: usize,
        region_len: usize,
    },
    /// The profile mandates aligned access and the offset violates it.
    MisalignedAccess {
        field: Option<String>,
        offset: usize,
        align: usize,
    },
    /// A value's shape does not match the layout it is bound to.
    TypeMismatch {
        field: Option<String>,
        expected: String,
        actual: String,
    },
    /// A named segment of a field path does not exist at its nesting level.
    FieldNotFound { path: String, segment: String },
    /// A by-value composite argument is smaller than its declared layout.
    ArgumentSizeMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    /// A call received the wrong number of arguments.
    ArgumentCountMismatch { expected: usize, actual: usize },
    /// The operation cannot be expressed for this layout or entry point.
    Unsupported { detail: String },
    /// A region or trampoline was used after its owning scope ended.
    UseAfterScopeEnd { what: &'static str },
}

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn unsupported(detail: impl Into<String>) -> Self {
        Self::Unsupported {
            detail: detail.into(),
        }
    }

    pub(crate) fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeMismatch {
            field: None,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Attach a field path to an error that does not carry one yet.
    pub(crate) fn with_field(self, name: impl Into<String>) -> Self {
        match self {
            Error::OutOfBounds {
                field: None,
                offset,
                len,
                region_len,
            } => Error::OutOfBounds {
                field: Some(name.into()),
                offset,
                len,
                region_len,
            },
            Error::MisalignedAccess {
                field: None,
                offset,
                align,
            } => Error::MisalignedAccess {
                field: Some(name.into()),
                offset,
                align,
            },
            Error::TypeMismatch {
                field: None,
                expected,
                actual,
            } => Error::TypeMismatch {
                field: Some(name.into()),
                expected,
                actual,
            },
            other => other,
        }
    }
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(name) => format!(" for `{name}`"),
        None => String::new(),
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfBounds {
                field,
                offset,
                len,
                region_len,
            } => write!(
                f,
                "access of {len} bytes at offset {offset} exceeds region of {region_len} bytes{}",
                field_suffix(field)
            ),
            Error::MisalignedAccess {
                field,
                offset,
                align,
            } => write!(
                f,
                "offset {offset} is not a multiple of the required alignment {align}{}",
                field_suffix(field)
            ),
            Error::TypeMismatch {
                field,
                expected,
                actual,
            } => write!(
                f,
                "expected {expected}, found {actual}{}",
                field_suffix(field)
            ),
            Error::FieldNotFound { path, segment } => {
                write!(f, "no field named `{segment}` along path `{path}`")
            }
            Error::ArgumentSizeMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "argument {index} provides {actual} bytes where its layout requires {expected}"
            ),
            Error::ArgumentCountMismatch { expected, actual } => {
                write!(f, "call expects {expected} arguments, received {actual}")
            }
            Error::Unsupported { detail } => f.write_str(detail),
            Error::UseAfterScopeEnd { what } => {
                write!(f, "{what} used after its owning scope ended")
            }
        }
    }
}

impl StdError for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_variants() {
        let oob = Error::OutOfBounds {
            field: Some("elem2".to_string()),
            offset: 6,
            len: 4,
            region_len: 8,
        };
        assert_eq!(
            oob.to_string(),
            "access of 4 bytes at offset 6 exceeds region of 8 bytes for `elem2`"
        );

        let misaligned = Error::MisalignedAccess {
            field: None,
            offset: 3,
            align: 4,
        };
        assert_eq!(
            misaligned.to_string(),
            "offset 3 is not a multiple of the required alignment 4"
        );

        let mismatch = Error::type_mismatch("int32 value", "float value");
        assert_eq!(
            mismatch.to_string(),
            "expected int32 value, found float value"
        );

        let not_found = Error::FieldNotFound {
            path: "outer.missing".to_string(),
            segment: "missing".to_string(),
        };
        assert_eq!(
            not_found.to_string(),
            "no field named `missing` along path `outer.missing`"
        );

        let size = Error::ArgumentSizeMismatch {
            index: 0,
            expected: 8,
            actual: 4,
        };
        assert_eq!(
            size.to_string(),
            "argument 0 provides 4 bytes where its layout requires 8"
        );

        let count = Error::ArgumentCountMismatch {
            expected: 2,
            actual: 1,
        };
        assert_eq!(count.to_string(), "call expects 2 arguments, received 1");

        let dead = Error::UseAfterScopeEnd {
            what: "memory region",
        };
        assert_eq!(
            dead.to_string(),
            "memory region used after its owning scope ended"
        );
    }

    #[test]
    fn with_field_fills_empty_slot_only() {
        let filled = Error::type_mismatch("a", "b").with_field("x");
        assert!(matches!(
            &filled,
            Error::TypeMismatch { field: Some(name), .. } if name == "x"
        ));

        let kept = filled.with_field("y");
        assert!(matches!(
            &kept,
            Error::TypeMismatch { field: Some(name), .. } if name == "x"
        ));
    }
}
