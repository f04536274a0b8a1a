//! Rewrites import address slots of a module that is already mapped.

use std::{
    ffi::c_void,
    io,
    mem::size_of,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicUsize, Ordering},
};

use bink_shim_pe::{ImageError, ImportTable, ThunkWidth, mapped_len};
use thiserror::Error;

use crate::protect::Unprotected;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("image thunks are {image} bytes wide but this process uses {native}")]
    Width { image: usize, native: usize },
    #[error("import slot cannot be made writable")]
    Protect(#[source] io::Error),
}

/// Base address of a mapped image (what `HMODULE` points at).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleBase(NonNull<u8>);

impl ModuleBase {
    /// # Safety
    /// `base` must point at an image laid out the way the loader maps it, and
    /// the mapping must outlive every use of the returned value.
    pub const unsafe fn from_ptr(base: NonNull<u8>) -> Self {
        Self(base)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

#[cfg(windows)]
impl ModuleBase {
    /// The executable that started the process.
    pub fn current_process() -> Option<Self> {
        Self::from_handle(unsafe {
            winapi::um::libloaderapi::GetModuleHandleA(std::ptr::null())
        })
    }

    /// A module that is already loaded. Never loads anything.
    pub fn loaded(name: &std::ffi::CStr) -> Option<Self> {
        Self::from_handle(unsafe { winapi::um::libloaderapi::GetModuleHandleA(name.as_ptr()) })
    }

    fn from_handle(handle: winapi::shared::minwindef::HMODULE) -> Option<Self> {
        // Loaded modules stay mapped until FreeLibrary, which nothing here calls.
        NonNull::new(handle.cast()).map(|base| unsafe { Self::from_ptr(base) })
    }
}

/// A located import slot: where it lives and what it held when looked up.
#[derive(Debug)]
pub struct SlotRef {
    addr: *mut usize,
    current: usize,
}

impl SlotRef {
    /// The slot's value at lookup time.
    pub fn current(&self) -> *const c_void {
        self.current as *const c_void
    }

    pub fn address(&self) -> *mut c_void {
        self.addr.cast()
    }

    /// Stores `redirect` into the slot and returns what the slot held at the
    /// moment of the write.
    ///
    /// # Safety
    /// The image the slot was located in must still be mapped, and `redirect`
    /// must be callable with the signature of the import it replaces.
    pub unsafe fn replace(self, redirect: *const c_void) -> Result<*const c_void, PatchError> {
        let _writable = unsafe { Unprotected::new(self.addr.cast(), size_of::<usize>()) }
            .map_err(PatchError::Protect)?;
        let previous = if self.addr.is_aligned() {
            unsafe { AtomicUsize::from_ptr(self.addr) }.swap(redirect as usize, Ordering::AcqRel)
        } else {
            let previous = unsafe { self.addr.read_unaligned() };
            unsafe { self.addr.write_unaligned(redirect as usize) };
            previous
        };
        Ok(previous as *const c_void)
    }
}

/// Finds the slot through which `module` calls `symbol` from `import_module`.
/// Reads only.
///
/// # Safety
/// `module` must describe a mapped image whose `SizeOfImage` bytes are all
/// readable.
pub unsafe fn locate(
    module: ModuleBase,
    import_module: &str,
    symbol: &str,
) -> Result<SlotRef, PatchError> {
    let base = module.as_ptr();
    let len = unsafe { mapped_len(base) }?;
    // The view must be gone before anything writes through `base`.
    let slot = {
        let image = unsafe { slice::from_raw_parts(base.cast_const(), len) };
        let table = ImportTable::parse(image)?;
        let native = ThunkWidth::native();
        if table.width() != native {
            return Err(PatchError::Width {
                image: table.width().size(),
                native: native.size(),
            });
        }
        table.locate(import_module, symbol)?
    };
    Ok(SlotRef {
        addr: unsafe { base.add(slot.rva as usize) }.cast(),
        current: slot.value as usize,
    })
}

/// Points `module`'s import of `symbol` from `import_module` at `redirect`
/// and returns the address the slot held before.
///
/// # Safety
/// See [`locate`] and [`SlotRef::replace`].
pub unsafe fn patch(
    module: ModuleBase,
    import_module: &str,
    symbol: &str,
    redirect: *const c_void,
) -> Result<*const c_void, PatchError> {
    let slot = unsafe { locate(module, import_module, symbol) }?;
    unsafe { slot.replace(redirect) }
}
