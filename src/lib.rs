#![deny(clippy::all, clippy::pedantic, clippy::perf, clippy::suspicious)]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

//! Data-layout descriptions and call-boundary marshalling for native
//! interop.
//!
//! The crate models four things: how a value is shaped in memory
//! ([`Layout`] measured against a pluggable [`AbiProfile`]), where it
//! lives ([`MemoryRegion`]s owned by an explicit [`Scope`]), how a
//! function signature marshals ([`CallDescriptor`]), and the two
//! directions across the boundary — [`DowncallHandle`] for invoking
//! native entry points and [`UpcallTrampoline`] for handing native code a
//! callable address that lands in a managed callback.

pub mod access;
pub mod call;
pub mod error;
pub mod layout;
pub mod memory;
pub mod target;

pub use access::{BoundValue, Value};
pub use call::{
    classify_call, Arg, ArgPass, CallDescriptor, CallResult, ClassifiedCall, DowncallHandle,
    RetPass, UpcallTrampoline, UpcallValue,
};
pub use error::{Error, Result};
pub use layout::{AbiProfile, AggregateRule, FieldRule, Layout, Member, ScalarKind};
pub use memory::{MemoryRegion, Scope};
pub use target::Target;
