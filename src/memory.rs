//! Scope-owned memory regions with liveness checking.
//!
//! A [`Scope`] is an explicit lifetime boundary: every [`MemoryRegion`]
//! allocated under it (and every upcall trampoline registered against it)
//! becomes unusable the moment the scope ends. Accesses check a shared
//! liveness flag rather than relying on collection to catch use-after-end;
//! the backing buffers are reference counted so a stale handle can never
//! touch freed memory.

#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout as AllocLayout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::layout::{AbiProfile, Layout, MIN_ALIGN};

const DEFAULT_REGION_ALIGN: usize = 16;

struct ScopeCore {
    alive: AtomicBool,
}

/// Cheap handle onto a scope's liveness flag.
#[derive(Clone)]
pub(crate) struct ScopeLiveness {
    core: Arc<ScopeCore>,
}

impl ScopeLiveness {
    pub(crate) fn is_alive(&self) -> bool {
        self.core.alive.load(Ordering::Acquire)
    }
}

struct RegionBuf {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
    owned: bool,
}

// The buffer pointer is stable for the buffer's lifetime; concurrent writes
// to the same region require external synchronization, which is the caller's
// contract for shared native memory.
unsafe impl Send for RegionBuf {}
unsafe impl Sync for RegionBuf {}

impl Drop for RegionBuf {
    fn drop(&mut self) {
        if self.owned && self.len > 0 {
            if let Ok(alloc_layout) = AllocLayout::from_size_align(self.len, self.align) {
                unsafe { dealloc(self.ptr.as_ptr(), alloc_layout) };
            }
        }
    }
}

/// Lifetime boundary owning memory regions and trampolines.
pub struct Scope {
    core: Arc<ScopeCore>,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(ScopeCore {
                alive: AtomicBool::new(true),
            }),
        }
    }

    /// Allocate a zeroed region sized and aligned for `layout`.
    pub fn allocate(&self, layout: &Layout, profile: &AbiProfile) -> Result<MemoryRegion> {
        self.allocate_raw(
            layout.byte_size(profile),
            layout.alignment(profile).max(MIN_ALIGN),
        )
    }

    /// Allocate a zeroed region of `len` bytes at the default alignment.
    pub fn allocate_bytes(&self, len: usize) -> Result<MemoryRegion> {
        self.allocate_raw(len, DEFAULT_REGION_ALIGN)
    }

    fn allocate_raw(&self, len: usize, align: usize) -> Result<MemoryRegion> {
        if !self.is_alive() {
            return Err(Error::UseAfterScopeEnd { what: "scope" });
        }
        let buf = if len == 0 {
            RegionBuf {
                ptr: NonNull::dangling(),
                len: 0,
                align,
                owned: false,
            }
        } else {
            let alloc_layout = AllocLayout::from_size_align(len, align).map_err(|_| {
                Error::unsupported(format!(
                    "cannot allocate region of {len} bytes with alignment {align}"
                ))
            })?;
            let raw = unsafe { alloc_zeroed(alloc_layout) };
            let ptr = NonNull::new(raw).ok_or_else(|| {
                Error::unsupported(format!("allocation of {len} bytes failed"))
            })?;
            RegionBuf {
                ptr,
                len,
                align,
                owned: true,
            }
        };
        Ok(MemoryRegion {
            buf: Arc::new(buf),
            scope: Arc::clone(&self.core),
        })
    }

    /// End the scope: all regions and trampolines it owns become invalid.
    pub fn close(&self) {
        if self.core.alive.swap(false, Ordering::AcqRel) {
            debug!("scope closed");
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.core.alive.load(Ordering::Acquire)
    }

    pub(crate) fn liveness(&self) -> ScopeLiveness {
        ScopeLiveness {
            core: Arc::clone(&self.core),
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}

/// A bounded, contiguous byte range owned by a [`Scope`].
///
/// Clones are views of the same bytes. Concurrent reads are safe; concurrent
/// writes to the same region require external synchronization.
#[derive(Clone)]
pub struct MemoryRegion {
    buf: Arc<RegionBuf>,
    scope: Arc<ScopeCore>,
}

impl MemoryRegion {
    /// View memory the caller owns (a native address handed back across the
    /// boundary) as a region of `len` bytes under `scope`.
    ///
    /// # Safety
    ///
    /// `address` must point to at least `len` bytes that stay valid and
    /// unmoved for as long as any clone of the returned region is used.
    pub unsafe fn adopt_external(scope: &Scope, address: usize, len: usize) -> Result<Self> {
        if !scope.is_alive() {
            return Err(Error::UseAfterScopeEnd { what: "scope" });
        }
        let ptr = NonNull::new(address as *mut u8)
            .ok_or_else(|| Error::unsupported("cannot adopt a null address"))?;
        Ok(Self {
            buf: Arc::new(RegionBuf {
                ptr,
                len,
                align: MIN_ALIGN,
                owned: false,
            }),
            scope: Arc::clone(&scope.core),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.len == 0
    }

    /// The region's base address, for passing as a pointer argument.
    pub fn base_address(&self) -> Result<usize> {
        self.check(0, 0, None)?;
        Ok(self.buf.ptr.as_ptr() as usize)
    }

    /// Liveness- and bounds-checked pointer to `len` bytes at `offset`.
    pub(crate) fn check(&self, offset: usize, len: usize, field: Option<&str>) -> Result<*mut u8> {
        if !self.scope.alive.load(Ordering::Acquire) {
            return Err(Error::UseAfterScopeEnd {
                what: "memory region",
            });
        }
        let end = offset.checked_add(len);
        if end.is_none() || end.is_some_and(|end| end > self.buf.len) {
            return Err(Error::OutOfBounds {
                field: field.map(str::to_string),
                offset,
                len,
                region_len: self.buf.len,
            });
        }
        Ok(unsafe { self.buf.ptr.as_ptr().add(offset) })
    }

    /// Copy `out.len()` bytes starting at `offset` out of the region.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let src = self.check(offset, out.len(), None)?;
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.check(offset, data.len(), None)?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("len", &self.buf.len)
            .field("alive", &self.scope.alive.load(Ordering::Acquire))
            .finish()
    }
}
