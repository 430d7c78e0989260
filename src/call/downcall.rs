//! Invocation of native functions through resolved entry points.

#![allow(unsafe_code)]

use libc::c_void;
use libffi::middle::CodePtr;
use libffi::raw;
use tracing::debug;

use crate::access::{self, Value};
use crate::error::{Error, Result};
use crate::layout::{align_to, AbiProfile, Layout, ScalarKind};
use crate::memory::Scope;

use super::cif::{verify_descriptor, with_cached_cif};
use super::classify::{classify_call, ClassifiedCall};
use super::{Arg, CallDescriptor, CallResult};

/// Result holders must cover a full return register slot.
const RETURN_SLOT: usize = 8;

/// A resolved native entry point paired with its call descriptor.
///
/// Created once per distinct (entry point, descriptor) pair and reusable
/// across any number of invocations. The call interface is built eagerly
/// so every layout problem surfaces here, never mid-call.
pub struct DowncallHandle {
    address: usize,
    descriptor: CallDescriptor,
    profile: AbiProfile,
    classified: ClassifiedCall,
    slot_offsets: Vec<usize>,
    scratch_len: usize,
    ret_size: usize,
}

impl DowncallHandle {
    /// # Errors
    ///
    /// Fails on a null entry point, on layouts libffi cannot express, and
    /// on profiles whose aggregate layout disagrees with the host ABI.
    pub fn new(address: usize, descriptor: CallDescriptor, profile: AbiProfile) -> Result<Self> {
        if address == 0 {
            return Err(Error::unsupported("null native entry point"));
        }
        verify_descriptor(&descriptor, &profile)?;
        with_cached_cif(&descriptor, |_| ())?;

        let classified = classify_call(&descriptor, &profile);
        let mut slot_offsets = Vec::with_capacity(descriptor.params().len());
        let mut cursor = 0usize;
        for layout in descriptor.params() {
            cursor = align_to(cursor, layout.alignment(&profile));
            slot_offsets.push(cursor);
            cursor += layout.byte_size(&profile);
        }
        let ret_size = descriptor.ret().map_or(0, |l| l.byte_size(&profile));

        debug!(
            address,
            params = descriptor.params().len(),
            ret_size,
            "downcall handle created"
        );
        Ok(Self {
            address,
            descriptor,
            profile,
            classified,
            slot_offsets,
            scratch_len: cursor,
            ret_size,
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn classification(&self) -> &ClassifiedCall {
        &self.classified
    }

    /// Pack `args`, invoke the native function and unpack the result.
    ///
    /// Arguments are validated and copied into an ephemeral scratch region
    /// in descriptor order before the call; any failure aborts before the
    /// native function runs. Aggregate results are unpacked into a fresh
    /// region of `scope`. A fault inside the callee itself is fatal to the
    /// process and is not caught here.
    pub fn invoke(&self, scope: &Scope, args: &[Arg<'_>]) -> Result<CallResult> {
        let params = self.descriptor.params();
        if args.len() != params.len() {
            return Err(Error::ArgumentCountMismatch {
                expected: params.len(),
                actual: args.len(),
            });
        }

        let scratch_scope = Scope::new();
        let scratch = scratch_scope.allocate_bytes(self.scratch_len)?;
        for (index, (arg, layout)) in args.iter().zip(params).enumerate() {
            let slot = self.slot_offsets[index];
            match (arg, layout) {
                (Arg::Value(value), Layout::Scalar { .. }) => {
                    access::write(&scratch, layout, slot, &self.profile, *value)
                        .map_err(|err| err.with_field(format!("argument {index}")))?;
                }
                (Arg::Value(value), _) => {
                    return Err(Error::type_mismatch(
                        "composite argument region",
                        value.kind_label(),
                    )
                    .with_field(format!("argument {index}")));
                }
                (Arg::Struct(region), Layout::Group { .. } | Layout::Sequence { .. }) => {
                    let expected = layout.byte_size(&self.profile);
                    if region.len() < expected {
                        return Err(Error::ArgumentSizeMismatch {
                            index,
                            expected,
                            actual: region.len(),
                        });
                    }
                    let mut bytes = vec![0u8; expected];
                    region.read_bytes(0, &mut bytes)?;
                    scratch.write_bytes(slot, &bytes)?;
                }
                (Arg::Struct(_), _) => {
                    return Err(Error::type_mismatch("scalar value", "composite argument")
                        .with_field(format!("argument {index}")));
                }
                (
                    Arg::Region(region),
                    Layout::Scalar {
                        kind: ScalarKind::Pointer,
                        ..
                    },
                ) => {
                    let address = region.base_address()?;
                    access::write(&scratch, layout, slot, &self.profile, Value::Pointer(address))
                        .map_err(|err| err.with_field(format!("argument {index}")))?;
                }
                (Arg::Region(_), _) => {
                    return Err(Error::type_mismatch("pointer parameter", "region address")
                        .with_field(format!("argument {index}")));
                }
            }
        }

        let mut avalue: Vec<*mut c_void> = Vec::with_capacity(params.len());
        for slot in &self.slot_offsets {
            avalue.push(scratch.check(*slot, 0, None)?.cast::<c_void>());
        }

        let holder = match self.descriptor.ret() {
            Some(_) => Some(scratch_scope.allocate_bytes(self.ret_size.max(RETURN_SLOT))?),
            None => None,
        };
        let rvalue: *mut c_void = match &holder {
            Some(region) => region.check(0, 0, None)?.cast::<c_void>(),
            None => std::ptr::null_mut(),
        };

        let code = CodePtr(self.address as *mut c_void);
        with_cached_cif(&self.descriptor, |cif| unsafe {
            raw::ffi_call(
                cif.as_raw_ptr(),
                Some(*code.as_safe_fun()),
                rvalue,
                avalue.as_mut_ptr(),
            );
        })?;

        match (self.descriptor.ret(), holder) {
            (None, _) => Ok(CallResult::Void),
            (Some(Layout::Scalar { kind, width }), Some(region)) => {
                let ptr = region.check(0, *width, None)?.cast_const();
                let value = unsafe { access::read_scalar_at(ptr, *kind, *width) }
                    .map_err(|err| err.with_field("return"))?;
                Ok(CallResult::Scalar(value))
            }
            (Some(layout), Some(region)) => {
                let out = scope.allocate(layout, &self.profile)?;
                let mut bytes = vec![0u8; self.ret_size];
                region.read_bytes(0, &mut bytes)?;
                out.write_bytes(0, &bytes)?;
                Ok(CallResult::Struct(out))
            }
            (Some(_), None) => Err(Error::unsupported("missing result holder")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_entry_points_are_rejected() {
        let descriptor = match CallDescriptor::new(vec![Layout::int32()], None) {
            Ok(descriptor) => descriptor,
            Err(err) => panic!("descriptor should build: {err}"),
        };
        assert!(matches!(
            DowncallHandle::new(0, descriptor, AbiProfile::natural()),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn arity_is_checked_before_anything_runs() {
        extern "C" fn nop(_x: i32) {}

        let descriptor = match CallDescriptor::new(vec![Layout::int32()], None) {
            Ok(descriptor) => descriptor,
            Err(err) => panic!("descriptor should build: {err}"),
        };
        let handle = match DowncallHandle::new(
            nop as extern "C" fn(i32) as usize,
            descriptor,
            AbiProfile::natural(),
        ) {
            Ok(handle) => handle,
            Err(err) => panic!("handle should build: {err}"),
        };
        let scope = Scope::new();
        assert_eq!(
            handle.invoke(&scope, &[]).err(),
            Some(Error::ArgumentCountMismatch {
                expected: 1,
                actual: 0,
            })
        );
    }
}
