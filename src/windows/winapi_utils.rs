use std::ffi::{CStr, c_void};

use winapi::{
    shared::minwindef::{BOOL, FALSE},
    um::libloaderapi::GetProcAddress,
};
use winsafe::GetLastError;

use crate::patch::ModuleBase;

pub fn ck(b: BOOL) -> winsafe::SysResult<()> {
    if b == FALSE {
        Err(GetLastError())
    } else {
        Ok(())
    }
}

/// Null when `module` does not export `name`.
pub fn proc_address(module: ModuleBase, name: &CStr) -> *const c_void {
    unsafe { GetProcAddress(module.as_ptr().cast(), name.as_ptr()) }
        .cast_const()
        .cast()
}
