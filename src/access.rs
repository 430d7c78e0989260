//! Typed reads and writes at byte offsets inside memory regions.
//!
//! Accesses use the host's native byte order; no conversion is performed.

#![allow(unsafe_code)]

use std::mem;

use crate::error::{Error, Result};
use crate::layout::{scalar_name, AbiProfile, Layout, ScalarKind};
use crate::memory::MemoryRegion;

/// A managed scalar value crossing the boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Char(u32),
    Float(f64),
    Pointer(usize),
}

impl Value {
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool value",
            Value::Int(_) => "int value",
            Value::Char(_) => "char value",
            Value::Float(_) => "float value",
            Value::Pointer(_) => "pointer value",
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_pointer(&self) -> Option<usize> {
        match self {
            Value::Pointer(v) => Some(*v),
            _ => None,
        }
    }
}

fn scalar_width_supported(kind: ScalarKind, width: usize) -> bool {
    match kind {
        ScalarKind::Int => matches!(width, 1 | 2 | 4 | 8),
        ScalarKind::Float => matches!(width, 4 | 8),
        ScalarKind::Bool => width == 1,
        ScalarKind::Char => matches!(width, 1 | 2 | 4),
        ScalarKind::Pointer => width == mem::size_of::<usize>(),
    }
}

fn require_scalar(layout: &Layout) -> Result<(ScalarKind, usize)> {
    match layout {
        Layout::Scalar { kind, width } => {
            if scalar_width_supported(*kind, *width) {
                Ok((*kind, *width))
            } else {
                Err(Error::unsupported(format!(
                    "unsupported scalar width {width} for kind {}",
                    kind.label()
                )))
            }
        }
        Layout::Group { .. } => Err(Error::type_mismatch(
            "scalar layout",
            "group layout; resolve a field first",
        )),
        Layout::Sequence { .. } => Err(Error::type_mismatch(
            "scalar layout",
            "sequence layout; resolve an element first",
        )),
        Layout::Padding { .. } => Err(Error::type_mismatch("scalar layout", "padding")),
    }
}

fn check_alignment(layout: &Layout, offset: usize, profile: &AbiProfile) -> Result<()> {
    if profile.strict_alignment() {
        let align = layout.alignment(profile);
        if align > 1 && offset % align != 0 {
            return Err(Error::MisalignedAccess {
                field: None,
                offset,
                align,
            });
        }
    }
    Ok(())
}

/// Read the scalar `layout` at `offset` inside `region`.
///
/// # Errors
///
/// `OutOfBounds` when `offset + size` exceeds the region, `MisalignedAccess`
/// under strict-alignment profiles, `TypeMismatch` for composite layouts.
pub fn read(
    region: &MemoryRegion,
    layout: &Layout,
    offset: usize,
    profile: &AbiProfile,
) -> Result<Value> {
    let (kind, width) = require_scalar(layout)?;
    check_alignment(layout, offset, profile)?;
    let ptr = region.check(offset, width, None)?;
    unsafe { read_scalar_at(ptr.cast_const(), kind, width) }
}

/// Write `value` as the scalar `layout` at `offset` inside `region`.
///
/// The value's shape must match the layout's kind and fit its width.
pub fn write(
    region: &MemoryRegion,
    layout: &Layout,
    offset: usize,
    profile: &AbiProfile,
    value: Value,
) -> Result<()> {
    let (kind, width) = require_scalar(layout)?;
    check_alignment(layout, offset, profile)?;
    let ptr = region.check(offset, width, None)?;
    unsafe { write_scalar_at(ptr, kind, width, value) }
}

pub(crate) fn int_fits(value: i64, width: usize) -> bool {
    match width {
        1 => i8::try_from(value).is_ok(),
        2 => i16::try_from(value).is_ok(),
        4 => i32::try_from(value).is_ok(),
        _ => true,
    }
}

pub(crate) fn char_fits(value: u32, width: usize) -> bool {
    match width {
        1 => value <= u32::from(u8::MAX),
        2 => value <= u32::from(u16::MAX),
        _ => true,
    }
}

/// Read a scalar from a raw slot. Width must already be validated.
///
/// # Safety
///
/// `ptr` must point to at least `width` readable bytes.
pub(crate) unsafe fn read_scalar_at(
    ptr: *const u8,
    kind: ScalarKind,
    width: usize,
) -> Result<Value> {
    let value = unsafe {
        match kind {
            ScalarKind::Int => Value::Int(match width {
                1 => i64::from(ptr.cast::<i8>().read_unaligned()),
                2 => i64::from(ptr.cast::<i16>().read_unaligned()),
                4 => i64::from(ptr.cast::<i32>().read_unaligned()),
                _ => ptr.cast::<i64>().read_unaligned(),
            }),
            ScalarKind::Float => Value::Float(match width {
                4 => f64::from(ptr.cast::<f32>().read_unaligned()),
                _ => ptr.cast::<f64>().read_unaligned(),
            }),
            ScalarKind::Bool => Value::Bool(ptr.read_unaligned() != 0),
            ScalarKind::Char => Value::Char(match width {
                1 => u32::from(ptr.read_unaligned()),
                2 => u32::from(ptr.cast::<u16>().read_unaligned()),
                _ => ptr.cast::<u32>().read_unaligned(),
            }),
            ScalarKind::Pointer => Value::Pointer(ptr.cast::<usize>().read_unaligned()),
        }
    };
    Ok(value)
}

/// Write a scalar into a raw slot. Width must already be validated.
///
/// # Safety
///
/// `ptr` must point to at least `width` writable bytes.
pub(crate) unsafe fn write_scalar_at(
    ptr: *mut u8,
    kind: ScalarKind,
    width: usize,
    value: Value,
) -> Result<()> {
    let mismatch = || Error::type_mismatch(format!("{} value", scalar_name(kind, width)), value.kind_label());
    unsafe {
        match (kind, value) {
            (ScalarKind::Int, Value::Int(v)) => {
                if !int_fits(v, width) {
                    return Err(mismatch());
                }
                match width {
                    1 => ptr.cast::<i8>().write_unaligned(v as i8),
                    2 => ptr.cast::<i16>().write_unaligned(v as i16),
                    4 => ptr.cast::<i32>().write_unaligned(v as i32),
                    _ => ptr.cast::<i64>().write_unaligned(v),
                }
            }
            (ScalarKind::Float, Value::Float(v)) => match width {
                4 => ptr.cast::<f32>().write_unaligned(v as f32),
                _ => ptr.cast::<f64>().write_unaligned(v),
            },
            (ScalarKind::Bool, Value::Bool(v)) => ptr.write_unaligned(u8::from(v)),
            (ScalarKind::Char, Value::Char(v)) => {
                if !char_fits(v, width) {
                    return Err(mismatch());
                }
                match width {
                    1 => ptr.write_unaligned(v as u8),
                    2 => ptr.cast::<u16>().write_unaligned(v as u16),
                    _ => ptr.cast::<u32>().write_unaligned(v),
                }
            }
            (ScalarKind::Pointer, Value::Pointer(v)) => ptr.cast::<usize>().write_unaligned(v),
            _ => return Err(mismatch()),
        }
    }
    Ok(())
}

/// A `(layout, region, offset)` triple identifying where a value lives.
///
/// Never owns memory; always a view into its region. Field resolution
/// carries the accumulated path so failures name the offending field.
pub struct BoundValue<'a> {
    region: &'a MemoryRegion,
    layout: &'a Layout,
    offset: usize,
    path: Option<String>,
}

impl<'a> BoundValue<'a> {
    #[must_use]
    pub fn new(region: &'a MemoryRegion, layout: &'a Layout) -> Self {
        Self {
            region,
            layout,
            offset: 0,
            path: None,
        }
    }

    /// Narrow the view to the field at a dotted `path`.
    pub fn field(&self, path: &str, profile: &AbiProfile) -> Result<BoundValue<'a>> {
        let (offset, layout) = self.layout.resolve(path, profile)?;
        let full_path = match &self.path {
            Some(prefix) => format!("{prefix}.{path}"),
            None => path.to_string(),
        };
        Ok(BoundValue {
            region: self.region,
            layout,
            offset: self.offset + offset,
            path: Some(full_path),
        })
    }

    pub fn get(&self, profile: &AbiProfile) -> Result<Value> {
        read(self.region, self.layout, self.offset, profile).map_err(|err| self.contextualise(err))
    }

    pub fn set(&self, profile: &AbiProfile, value: Value) -> Result<()> {
        write(self.region, self.layout, self.offset, profile, value)
            .map_err(|err| self.contextualise(err))
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn layout(&self) -> &'a Layout {
        self.layout
    }

    fn contextualise(&self, err: Error) -> Error {
        match &self.path {
            Some(path) => err.with_field(path.clone()),
            None => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Member;
    use crate::memory::Scope;

    fn region_of(len: usize) -> (Scope, MemoryRegion) {
        let scope = Scope::new();
        let region = match scope.allocate_bytes(len) {
            Ok(region) => region,
            Err(err) => panic!("allocation failed: {err}"),
        };
        (scope, region)
    }

    #[test]
    fn scalar_values_round_trip() {
        let profile = AbiProfile::natural();
        let (_scope, region) = region_of(16);

        let cases = [
            (Layout::int8(), Value::Int(-7)),
            (Layout::int16(), Value::Int(32766)),
            (Layout::int32(), Value::Int(11_223_344)),
            (Layout::int64(), Value::Int(22_222_222_222_222)),
            (Layout::float32(), Value::Float(1.5)),
            (Layout::float64(), Value::Float(33333.444)),
            (Layout::boolean(), Value::Bool(true)),
            (Layout::char16(), Value::Char(0x2764)),
            (Layout::pointer(), Value::Pointer(0xDEAD_B000)),
        ];
        for (layout, value) in cases {
            assert_eq!(write(&region, &layout, 0, &profile, value), Ok(()));
            assert_eq!(read(&region, &layout, 0, &profile), Ok(value));
            // Reading twice without an intervening write yields the same value.
            assert_eq!(read(&region, &layout, 0, &profile), Ok(value));
        }
    }

    #[test]
    fn narrow_int_reads_sign_extend() {
        let profile = AbiProfile::natural();
        let (_scope, region) = region_of(4);
        assert_eq!(
            write(&region, &Layout::int16(), 0, &profile, Value::Int(-2)),
            Ok(())
        );
        assert_eq!(
            read(&region, &Layout::int16(), 0, &profile),
            Ok(Value::Int(-2))
        );
    }

    #[test]
    fn read_one_past_the_last_valid_offset_is_out_of_bounds() {
        let profile = AbiProfile::natural();
        let (_scope, region) = region_of(8);
        let layout = Layout::int32();
        // offset = len - size is the last valid slot.
        assert!(read(&region, &layout, 4, &profile).is_ok());
        let err = match read(&region, &layout, 5, &profile) {
            Ok(value) => panic!("expected out-of-bounds, read {value:?}"),
            Err(err) => err,
        };
        assert!(matches!(err, Error::OutOfBounds { offset: 5, len: 4, region_len: 8, .. }));
    }

    #[test]
    fn strict_profiles_reject_misaligned_access() {
        let tolerant = AbiProfile::natural();
        let strict = AbiProfile::natural().with_strict_alignment(true);
        let (_scope, region) = region_of(8);
        let layout = Layout::int32();

        assert!(write(&region, &layout, 2, &tolerant, Value::Int(5)).is_ok());
        let err = match read(&region, &layout, 2, &strict) {
            Ok(value) => panic!("expected misaligned access, read {value:?}"),
            Err(err) => err,
        };
        assert_eq!(
            err,
            Error::MisalignedAccess {
                field: None,
                offset: 2,
                align: 4,
            }
        );
    }

    #[test]
    fn kind_and_range_mismatches_are_rejected() {
        let profile = AbiProfile::natural();
        let (_scope, region) = region_of(8);

        let err = match write(&region, &Layout::int32(), 0, &profile, Value::Float(1.0)) {
            Ok(()) => panic!("float into int32 should fail"),
            Err(err) => err,
        };
        assert_eq!(err, Error::type_mismatch("int32 value", "float value"));

        let err = match write(
            &region,
            &Layout::int16(),
            0,
            &profile,
            Value::Int(1 << 20),
        ) {
            Ok(()) => panic!("out-of-range int16 should fail"),
            Err(err) => err,
        };
        assert_eq!(err, Error::type_mismatch("int16 value", "int value"));
    }

    #[test]
    fn bound_values_resolve_fields_and_name_them_in_errors() {
        let profile = AbiProfile::natural();
        let layout = Layout::group(vec![
            Member::named("elem1", Layout::int32()),
            Member::named("elem2", Layout::int16()),
            Member::anon(Layout::padding(2)),
        ]);
        let scope = Scope::new();
        let region = match scope.allocate(&layout, &profile) {
            Ok(region) => region,
            Err(err) => panic!("allocation failed: {err}"),
        };

        let root = BoundValue::new(&region, &layout);
        let elem1 = match root.field("elem1", &profile) {
            Ok(view) => view,
            Err(err) => panic!("elem1 should resolve: {err}"),
        };
        let elem2 = match root.field("elem2", &profile) {
            Ok(view) => view,
            Err(err) => panic!("elem2 should resolve: {err}"),
        };
        assert_eq!(elem2.offset(), 4);

        assert_eq!(elem1.set(&profile, Value::Int(11_223_344)), Ok(()));
        assert_eq!(elem2.set(&profile, Value::Int(32766)), Ok(()));
        assert_eq!(elem1.get(&profile), Ok(Value::Int(11_223_344)));
        assert_eq!(elem2.get(&profile), Ok(Value::Int(32766)));

        let err = match elem2.set(&profile, Value::Bool(false)) {
            Ok(()) => panic!("bool into int16 should fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err,
            Error::TypeMismatch { field: Some(ref name), .. } if name == "elem2"
        ));

        // Reading the whole group without resolving a field is a mismatch.
        assert!(matches!(
            root.get(&profile),
            Err(Error::TypeMismatch { .. })
        ));
    }
}
