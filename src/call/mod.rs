//! Call descriptors and the two directions across the native boundary.

mod cif;
mod classify;
mod downcall;
mod upcall;

pub use classify::{classify_call, ArgPass, ClassifiedCall, RetPass};
pub use downcall::DowncallHandle;
pub use upcall::UpcallTrampoline;

use serde::{Deserialize, Serialize};

use crate::access::Value;
use crate::error::{Error, Result};
use crate::layout::{AbiProfile, Layout};
use crate::memory::MemoryRegion;

/// Immutable record of a function signature's marshalling shape.
///
/// Parameter order is the native calling-convention order, fixed at
/// creation. A `void` return is the absent layout, never a zero-size one.
/// Equality and hashing are structural: two descriptors with identical
/// ordered layouts are interchangeable for caching call handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallDescriptor {
    params: Vec<Layout>,
    ret: Option<Layout>,
}

impl CallDescriptor {
    /// # Errors
    ///
    /// Rejects padding and zero-size layouts in parameter or return
    /// position.
    pub fn new(params: Vec<Layout>, ret: Option<Layout>) -> Result<Self> {
        for (index, layout) in params.iter().enumerate() {
            validate_boundary_layout(layout)
                .map_err(|err| err.with_field(format!("argument {index}")))?;
        }
        if let Some(layout) = &ret {
            validate_boundary_layout(layout).map_err(|err| err.with_field("return"))?;
        }
        Ok(Self { params, ret })
    }

    #[must_use]
    pub fn params(&self) -> &[Layout] {
        &self.params
    }

    #[must_use]
    pub fn ret(&self) -> Option<&Layout> {
        self.ret.as_ref()
    }
}

fn validate_boundary_layout(layout: &Layout) -> Result<()> {
    if matches!(layout, Layout::Padding { .. }) {
        return Err(Error::type_mismatch("value layout", "padding"));
    }
    if layout.byte_size(&AbiProfile::natural()) == 0 {
        return Err(Error::unsupported(
            "zero-size layouts cannot cross the call boundary",
        ));
    }
    Ok(())
}

/// One downcall argument.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    /// A scalar passed by value.
    Value(Value),
    /// A composite copied by value out of a region.
    Struct(&'a MemoryRegion),
    /// The region's base address, passed as a pointer argument.
    Region(&'a MemoryRegion),
}

/// The outcome of a completed call in either direction.
#[derive(Debug, Clone)]
pub enum CallResult {
    Void,
    Scalar(Value),
    /// An aggregate result, unpacked into a region of the caller's scope.
    Struct(MemoryRegion),
}

impl CallResult {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            CallResult::Void => "void result",
            CallResult::Scalar(_) => "scalar result",
            CallResult::Struct(_) => "composite result",
        }
    }
}

/// One upcall argument, as seen by the managed callback.
#[derive(Debug, Clone)]
pub enum UpcallValue {
    Scalar(Value),
    /// A composite argument, copied into a region of the invocation's
    /// fresh scope.
    Struct(MemoryRegion),
}
