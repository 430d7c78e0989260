//! Native-callable trampolines bridging into managed callbacks.

#![allow(unsafe_code)]

use std::panic::{self, AssertUnwindSafe};

use libc::c_void;
use libffi::low;
use libffi::middle::Cif;
use tracing::{debug, error};

use crate::access::{self, Value};
use crate::error::{Error, Result};
use crate::layout::{AbiProfile, Layout, ScalarKind};
use crate::memory::{Scope, ScopeLiveness};

use super::cif::{build_cif, verify_descriptor};
use super::classify::{classify_call, ClassifiedCall, RetPass};
use super::{CallDescriptor, CallResult, UpcallValue};

type UpcallFn = dyn Fn(&Scope, &[UpcallValue]) -> Result<CallResult> + Send + Sync;

struct UpcallState {
    descriptor: CallDescriptor,
    profile: AbiProfile,
    ret_size: usize,
    liveness: ScopeLiveness,
    callback: Box<UpcallFn>,
}

/// A generated native-callable address bound to a managed callback.
///
/// The trampoline is owned by the scope it was created under: once that
/// scope ends, the address must not be called again. An entry through a
/// stale address is detected by the liveness flag and answered with a
/// zero-filled result rather than touching dead state, but prevention
/// remains the caller's scope discipline.
pub struct UpcallTrampoline {
    state: Box<UpcallState>,
    _cif: Box<Cif>,
    closure: *mut low::ffi_closure,
    code: usize,
    classified: ClassifiedCall,
}

impl UpcallTrampoline {
    /// Bind `callback` behind a fresh native entry point described by
    /// `descriptor`.
    ///
    /// # Errors
    ///
    /// Fails when the scope already ended, when the descriptor cannot be
    /// expressed for the host, or when closure allocation fails.
    pub fn new<F>(
        scope: &Scope,
        descriptor: CallDescriptor,
        profile: AbiProfile,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(&Scope, &[UpcallValue]) -> Result<CallResult> + Send + Sync + 'static,
    {
        if !scope.is_alive() {
            return Err(Error::UseAfterScopeEnd { what: "scope" });
        }
        verify_descriptor(&descriptor, &profile)?;
        let cif = Box::new(build_cif(&descriptor)?);
        let classified = classify_call(&descriptor, &profile);
        if matches!(classified.ret, RetPass::IndirectSret { .. }) {
            debug!("upcall returns through a caller-allocated buffer");
        }

        let ret_size = descriptor.ret().map_or(0, |l| l.byte_size(&profile));
        let state = Box::new(UpcallState {
            descriptor,
            profile,
            ret_size,
            liveness: scope.liveness(),
            callback: Box::new(callback),
        });

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(Error::unsupported("closure allocation failed"));
        }
        let prepared = unsafe {
            low::prep_closure(
                closure,
                cif.as_raw_ptr(),
                upcall_entry,
                std::ptr::from_ref::<UpcallState>(state.as_ref()),
                code,
            )
        };
        if prepared.is_err() {
            unsafe { low::closure_free(closure) };
            return Err(Error::unsupported("closure preparation failed"));
        }

        let code = code.0 as usize;
        debug!(code, "upcall trampoline armed");
        Ok(Self {
            state,
            _cif: cif,
            closure,
            code,
            classified,
        })
    }

    /// The native-callable address of this trampoline.
    #[must_use]
    pub fn code_ptr(&self) -> usize {
        self.code
    }

    #[must_use]
    pub fn descriptor(&self) -> &CallDescriptor {
        &self.state.descriptor
    }

    #[must_use]
    pub fn classification(&self) -> &ClassifiedCall {
        &self.classified
    }

    /// Whether the owning scope has ended, invalidating the address.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        !self.state.liveness.is_alive()
    }
}

impl Drop for UpcallTrampoline {
    fn drop(&mut self) {
        unsafe { low::closure_free(self.closure) };
    }
}

unsafe extern "C" fn upcall_entry(
    _cif: &low::ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    state: &UpcallState,
) {
    let result_ptr = std::ptr::from_mut(result).cast::<u8>();
    if !state.liveness.is_alive() {
        error!("upcall trampoline entered after its owning scope ended");
        zero_result(result_ptr, state);
        return;
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(state, args, result_ptr)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(%err, "upcall callback failed");
            zero_result(result_ptr, state);
        }
        Err(_) => {
            error!("upcall callback panicked");
            zero_result(result_ptr, state);
        }
    }
}

fn zero_result(out: *mut u8, state: &UpcallState) {
    // Scalar slots cover at least one return register; aggregates are
    // exactly their own size (the caller's buffer for indirect returns).
    let len = match state.descriptor.ret() {
        None => 0,
        Some(Layout::Scalar { .. }) => state.ret_size.max(std::mem::size_of::<usize>()),
        Some(_) => state.ret_size,
    };
    if len > 0 {
        unsafe { std::ptr::write_bytes(out, 0, len) };
    }
}

/// Unpack the incoming native arguments, run the callback on the calling
/// native thread, and pack its result. Every invocation unpacks into a
/// fresh scope, so reentrant and concurrent entries never share a buffer.
fn dispatch(state: &UpcallState, args: *const *const c_void, out: *mut u8) -> Result<()> {
    let scope = Scope::new();
    let params = state.descriptor.params();
    let mut values = Vec::with_capacity(params.len());
    for (index, layout) in params.iter().enumerate() {
        let slot = unsafe { *args.add(index) }.cast::<u8>();
        match layout {
            Layout::Scalar { kind, width } => {
                let value = unsafe { access::read_scalar_at(slot, *kind, *width) }
                    .map_err(|err| err.with_field(format!("argument {index}")))?;
                values.push(UpcallValue::Scalar(value));
            }
            _ => {
                let size = layout.byte_size(&state.profile);
                let region = scope.allocate(layout, &state.profile)?;
                let bytes = unsafe { std::slice::from_raw_parts(slot, size) };
                region.write_bytes(0, bytes)?;
                values.push(UpcallValue::Struct(region));
            }
        }
    }

    let result = (state.callback)(&scope, &values)?;
    write_result(state, &result, out)
}

fn write_result(state: &UpcallState, result: &CallResult, out: *mut u8) -> Result<()> {
    match (state.descriptor.ret(), result) {
        (None, CallResult::Void) => Ok(()),
        (Some(Layout::Scalar { kind, width }), CallResult::Scalar(value)) => {
            write_widened(out, *kind, *width, *value).map_err(|err| err.with_field("return"))
        }
        (Some(Layout::Group { .. } | Layout::Sequence { .. }), CallResult::Struct(region)) => {
            let expected = state.ret_size;
            if region.len() < expected {
                return Err(Error::ArgumentSizeMismatch {
                    index: 0,
                    expected,
                    actual: region.len(),
                });
            }
            let mut bytes = vec![0u8; expected];
            region.read_bytes(0, &mut bytes)?;
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, expected) };
            Ok(())
        }
        (None, other) => Err(Error::type_mismatch("void result", other.label())),
        (Some(layout), other) => Err(Error::type_mismatch(
            match layout {
                Layout::Scalar { .. } => "scalar result",
                _ => "composite result",
            },
            other.label(),
        )),
    }
}

/// Store a scalar result using the return-register convention: integral
/// values are widened to the full slot, floats keep their own width.
fn write_widened(out: *mut u8, kind: ScalarKind, width: usize, value: Value) -> Result<()> {
    let mismatch = || {
        Error::type_mismatch(
            format!("{} value", crate::layout::scalar_name(kind, width)),
            value.kind_label(),
        )
    };
    unsafe {
        match (kind, value) {
            (ScalarKind::Int, Value::Int(v)) => {
                if !access::int_fits(v, width) {
                    return Err(mismatch());
                }
                if width == 8 {
                    out.cast::<i64>().write_unaligned(v);
                } else {
                    out.cast::<isize>().write_unaligned(v as isize);
                }
            }
            (ScalarKind::Float, Value::Float(v)) => match width {
                4 => out.cast::<f32>().write_unaligned(v as f32),
                _ => out.cast::<f64>().write_unaligned(v),
            },
            (ScalarKind::Bool, Value::Bool(v)) => {
                out.cast::<usize>().write_unaligned(usize::from(v));
            }
            (ScalarKind::Char, Value::Char(v)) => {
                if !access::char_fits(v, width) {
                    return Err(mismatch());
                }
                out.cast::<usize>().write_unaligned(v as usize);
            }
            (ScalarKind::Pointer, Value::Pointer(v)) => {
                out.cast::<usize>().write_unaligned(v);
            }
            _ => return Err(mismatch()),
        }
    }
    Ok(())
}
