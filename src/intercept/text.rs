//! Reading caller-supplied, possibly bogus, NUL-terminated strings.
//!
//! At most [`MAX_UNITS`] units are read, and (on Windows) only from committed,
//! readable pages. A null, empty or unreadable string yields `None`.

use std::{ffi::c_char, mem::size_of};

use arrayvec::ArrayVec;
use widestring::U16Str;

pub const MAX_UNITS: usize = 1024;

unsafe fn bounded<T: Copy + Default + PartialEq>(ptr: *const T) -> Option<ArrayVec<T, MAX_UNITS>> {
    if ptr.is_null() {
        return None;
    }
    let readable = readable_units(ptr);
    let mut units = ArrayVec::new();
    for index in 0..readable {
        let unit = unsafe { ptr.add(index).read_unaligned() };
        if unit == T::default() {
            break;
        }
        units.push(unit);
    }
    (!units.is_empty()).then_some(units)
}

/// Reads a narrow (ANSI) string. Invalid UTF-8 is replaced.
///
/// # Safety
/// `ptr` must be null or point into this process's address space.
pub unsafe fn narrow(ptr: *const c_char) -> Option<String> {
    let bytes = unsafe { bounded(ptr.cast::<u8>()) }?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads a UTF-16 string. Unpaired surrogates are replaced.
///
/// # Safety
/// `ptr` must be null or point into this process's address space.
pub unsafe fn wide(ptr: *const u16) -> Option<String> {
    let units = unsafe { bounded(ptr) }?;
    Some(U16Str::from_slice(&units).to_string_lossy())
}

/// How many `T`s starting at `ptr`, up to [`MAX_UNITS`], lie in readable
/// memory.
#[cfg(windows)]
fn readable_units<T>(ptr: *const T) -> usize {
    use std::mem::MaybeUninit;

    use winapi::um::{
        memoryapi::VirtualQuery,
        winnt::{
            MEM_COMMIT, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
            PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
            PAGE_WRITECOPY,
        },
    };

    const READABLE: u32 = PAGE_READONLY
        | PAGE_READWRITE
        | PAGE_WRITECOPY
        | PAGE_EXECUTE_READ
        | PAGE_EXECUTE_READWRITE
        | PAGE_EXECUTE_WRITECOPY;

    let start = ptr as usize;
    let end = start.saturating_add(MAX_UNITS * size_of::<T>());
    let mut cursor = start;
    while cursor < end {
        let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::zeroed();
        let written = unsafe {
            VirtualQuery(
                cursor as *const _,
                info.as_mut_ptr(),
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            break;
        }
        let info = unsafe { info.assume_init() };
        let readable = info.State == MEM_COMMIT
            && info.Protect & (PAGE_GUARD | PAGE_NOACCESS) == 0
            && info.Protect & READABLE != 0;
        if !readable {
            break;
        }
        cursor = (info.BaseAddress as usize).saturating_add(info.RegionSize);
    }
    (cursor.min(end) - start) / size_of::<T>()
}

/// Elsewhere nothing calls in with foreign pointers; trust the bound alone.
#[cfg(not(windows))]
fn readable_units<T>(_ptr: *const T) -> usize {
    MAX_UNITS
}
