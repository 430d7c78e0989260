//! Lowering of layout descriptors to libffi call interfaces.
//!
//! Call interfaces are cached per thread, keyed by the descriptor's
//! structural identity. Before a handle is published, the aggregate sizes
//! libffi computes for the host are checked against the profile's: a
//! profile that disagrees with the host ABI can describe layouts but must
//! never carry a call.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use libffi::middle::{Cif, Type};
use libffi::raw;

use crate::error::{Error, Result};
use crate::layout::{AbiProfile, Layout, ScalarKind};

use super::CallDescriptor;

thread_local! {
    static CIF_CACHE: RefCell<HashMap<CallDescriptor, Cif>> = RefCell::new(HashMap::new());
}

/// Run `use_cif` against the cached call interface for `descriptor`,
/// building it on first use.
pub(crate) fn with_cached_cif<R>(
    descriptor: &CallDescriptor,
    use_cif: impl FnOnce(&Cif) -> R,
) -> Result<R> {
    CIF_CACHE.with(|cache| {
        let mut map = cache.borrow_mut();
        let cif = match map.entry(descriptor.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => slot.insert(build_cif(descriptor)?),
        };
        Ok(use_cif(cif))
    })
}

/// Build an owned call interface for `descriptor`.
pub(crate) fn build_cif(descriptor: &CallDescriptor) -> Result<Cif> {
    let mut args = Vec::with_capacity(descriptor.params().len());
    for (index, layout) in descriptor.params().iter().enumerate() {
        args.push(ffi_type(layout).map_err(|err| err.with_field(format!("argument {index}")))?);
    }
    let ret = match descriptor.ret() {
        Some(layout) => ffi_type(layout).map_err(|err| err.with_field("return"))?,
        None => Type::void(),
    };
    Ok(Cif::new(args, ret))
}

fn ffi_scalar_type(kind: ScalarKind, width: usize) -> Result<Type> {
    let ty = match (kind, width) {
        (ScalarKind::Int, 1) => Type::i8(),
        (ScalarKind::Int, 2) => Type::i16(),
        (ScalarKind::Int, 4) => Type::i32(),
        (ScalarKind::Int, 8) => Type::i64(),
        (ScalarKind::Float, 4) => Type::f32(),
        (ScalarKind::Float, 8) => Type::f64(),
        (ScalarKind::Bool | ScalarKind::Char, 1) => Type::u8(),
        (ScalarKind::Char, 2) => Type::u16(),
        (ScalarKind::Char, 4) => Type::u32(),
        (ScalarKind::Pointer, _) if width == std::mem::size_of::<usize>() => Type::pointer(),
        _ => {
            return Err(Error::unsupported(format!(
                "unsupported scalar width {width} for kind {}",
                kind.label()
            )));
        }
    };
    Ok(ty)
}

fn ffi_type(layout: &Layout) -> Result<Type> {
    match layout {
        Layout::Scalar { kind, width } => ffi_scalar_type(*kind, *width),
        Layout::Padding { .. } => Err(Error::type_mismatch("value layout", "padding")),
        Layout::Group { .. } | Layout::Sequence { .. } => {
            let mut elements = Vec::new();
            flatten(layout, &mut elements)?;
            Ok(Type::structure(elements))
        }
    }
}

/// Flatten an aggregate into libffi structure elements. libffi has no
/// array or padding types: sequences repeat their element, padding is
/// recreated by libffi's own layout computation and must agree with the
/// profile (checked by [`verify_descriptor`]).
fn flatten(layout: &Layout, out: &mut Vec<Type>) -> Result<()> {
    match layout {
        Layout::Scalar { kind, width } => out.push(ffi_scalar_type(*kind, *width)?),
        Layout::Padding { .. } => {}
        Layout::Sequence { element, count } => {
            let ty = ffi_type(element)?;
            out.extend(std::iter::repeat_with(|| ty.clone()).take(*count));
        }
        Layout::Group { members } => {
            for member in members {
                match &member.layout {
                    Layout::Group { .. } => out.push(ffi_type(&member.layout)?),
                    other => flatten(other, out)?,
                }
            }
        }
    }
    Ok(())
}

fn flat_count(layout: &Layout) -> usize {
    match layout {
        Layout::Scalar { .. } => 1,
        Layout::Padding { .. } => 0,
        // A sequence always flattens to one element type per repetition.
        Layout::Sequence { count, .. } => *count,
        Layout::Group { members } => members
            .iter()
            .map(|member| match &member.layout {
                Layout::Group { .. } => 1,
                other => flat_count(other),
            })
            .sum(),
    }
}

/// Check that libffi's host layout of every aggregate in `descriptor`
/// agrees with `profile`. Only profiles that agree may carry a call.
pub(crate) fn verify_descriptor(descriptor: &CallDescriptor, profile: &AbiProfile) -> Result<()> {
    for (index, layout) in descriptor.params().iter().enumerate() {
        verify_layout(layout, profile).map_err(|err| err.with_field(format!("argument {index}")))?;
    }
    if let Some(layout) = descriptor.ret() {
        verify_layout(layout, profile).map_err(|err| err.with_field("return"))?;
    }
    Ok(())
}

fn verify_layout(layout: &Layout, profile: &AbiProfile) -> Result<()> {
    if !matches!(layout, Layout::Group { .. } | Layout::Sequence { .. }) {
        return Ok(());
    }
    let ty = ffi_type(layout)?;
    let raw_ty = ty.as_raw_ptr();
    let mut offsets = vec![0usize; flat_count(layout)];
    let status = unsafe {
        raw::ffi_get_struct_offsets(raw::ffi_abi_FFI_DEFAULT_ABI, raw_ty, offsets.as_mut_ptr())
    };
    if status != raw::ffi_status_FFI_OK {
        return Err(Error::unsupported(
            "the host ABI rejected this aggregate shape",
        ));
    }
    let host_size = unsafe { (*raw_ty).size };
    let host_align = usize::from(unsafe { (*raw_ty).alignment });
    let size = layout.byte_size(profile);
    let align = layout.alignment(profile);
    if host_size != size || host_align != align {
        return Err(Error::unsupported(format!(
            "profile computes size {size} align {align} where the host ABI computes \
             size {host_size} align {host_align}; only host-compatible profiles can \
             carry a call"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Member;

    fn descriptor(params: Vec<Layout>, ret: Option<Layout>) -> CallDescriptor {
        match CallDescriptor::new(params, ret) {
            Ok(descriptor) => descriptor,
            Err(err) => panic!("descriptor should build: {err}"),
        }
    }

    #[test]
    fn natural_groups_agree_with_the_host_abi() {
        let natural = AbiProfile::natural();
        let shape = Layout::group(vec![
            Member::named("elem1", Layout::int32()),
            Member::named("elem2", Layout::int16()),
            Member::anon(Layout::padding(2)),
        ]);
        let descriptor = descriptor(vec![shape], Some(Layout::int32()));
        assert_eq!(verify_descriptor(&descriptor, &natural), Ok(()));
    }

    #[test]
    fn packed_groups_cannot_carry_a_call() {
        let packed = AbiProfile::packed(1);
        let shape = Layout::group(vec![
            Member::named("tag", Layout::int8()),
            Member::named("value", Layout::int32()),
        ]);
        let descriptor = descriptor(vec![shape], None);
        let err = match verify_descriptor(&descriptor, &packed) {
            Ok(()) => panic!("packed layout should not verify against the host ABI"),
            Err(err) => err,
        };
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn cif_cache_reuses_structurally_equal_descriptors() {
        let first = descriptor(vec![Layout::int64(), Layout::int64()], Some(Layout::int64()));
        let second = descriptor(vec![Layout::int64(), Layout::int64()], Some(Layout::int64()));

        let built = with_cached_cif(&first, |_| ());
        assert!(built.is_ok());
        let reused = with_cached_cif(&second, |_| ());
        assert!(reused.is_ok());
    }
}
