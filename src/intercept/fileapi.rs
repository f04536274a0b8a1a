use std::borrow::Cow;

use tracing::{info, warn};
use winapi::{
    shared::{
        minwindef::DWORD,
        ntdef::{HANDLE, LPCSTR, LPCWSTR},
    },
    um::{handleapi::INVALID_HANDLE_VALUE, minwinbase::LPSECURITY_ATTRIBUTES},
};

use super::{AnyHook, Hook, OpenRequest, install_all, observe, text};
use crate::{last_error, patch::ModuleBase, windows::winapi_utils::proc_address};

/// The name the host's import table uses; matched case-insensitively.
const IMPORT_MODULE: &str = "KERNEL32.dll";

const ERROR_INVALID_FUNCTION: u32 = 1;

type CreateFileA = unsafe extern "system" fn(
    file_name: LPCSTR,
    desired_access: DWORD,
    share_mode: DWORD,
    security_attributes: LPSECURITY_ATTRIBUTES,
    creation_disposition: DWORD,
    flags_and_attributes: DWORD,
    template_file: HANDLE,
) -> HANDLE;

type CreateFileW = unsafe extern "system" fn(
    file_name: LPCWSTR,
    desired_access: DWORD,
    share_mode: DWORD,
    security_attributes: LPSECURITY_ATTRIBUTES,
    creation_disposition: DWORD,
    flags_and_attributes: DWORD,
    template_file: HANDLE,
) -> HANDLE;

const _: CreateFileA = winapi::um::fileapi::CreateFileA;
const _: CreateFileW = winapi::um::fileapi::CreateFileW;

pub static CREATE_FILE_A: Hook<CreateFileA> = Hook::new(IMPORT_MODULE, c"CreateFileA", {
    unsafe extern "system" fn create_file_a(
        file_name: LPCSTR,
        desired_access: DWORD,
        share_mode: DWORD,
        security_attributes: LPSECURITY_ATTRIBUTES,
        creation_disposition: DWORD,
        flags_and_attributes: DWORD,
        template_file: HANDLE,
    ) -> HANDLE {
        observe(
            || OpenRequest {
                api: "CreateFileA",
                path: unsafe { text::narrow(file_name) }.map(Cow::Owned),
                address: file_name.cast(),
                flags: flags_and_attributes,
                disposition: creation_disposition,
            },
            || {
                let Some(original) = CREATE_FILE_A.original() else {
                    last_error::set(ERROR_INVALID_FUNCTION);
                    return INVALID_HANDLE_VALUE;
                };
                unsafe {
                    original(
                        file_name,
                        desired_access,
                        share_mode,
                        security_attributes,
                        creation_disposition,
                        flags_and_attributes,
                        template_file,
                    )
                }
            },
            |handle| *handle == INVALID_HANDLE_VALUE,
        )
    }
    create_file_a
});

pub static CREATE_FILE_W: Hook<CreateFileW> = Hook::new(IMPORT_MODULE, c"CreateFileW", {
    unsafe extern "system" fn create_file_w(
        file_name: LPCWSTR,
        desired_access: DWORD,
        share_mode: DWORD,
        security_attributes: LPSECURITY_ATTRIBUTES,
        creation_disposition: DWORD,
        flags_and_attributes: DWORD,
        template_file: HANDLE,
    ) -> HANDLE {
        observe(
            || OpenRequest {
                api: "CreateFileW",
                path: unsafe { text::wide(file_name) }.map(Cow::Owned),
                address: file_name.cast(),
                flags: flags_and_attributes,
                disposition: creation_disposition,
            },
            || {
                let Some(original) = CREATE_FILE_W.original() else {
                    last_error::set(ERROR_INVALID_FUNCTION);
                    return INVALID_HANDLE_VALUE;
                };
                unsafe {
                    original(
                        file_name,
                        desired_access,
                        share_mode,
                        security_attributes,
                        creation_disposition,
                        flags_and_attributes,
                        template_file,
                    )
                }
            },
            |handle| *handle == INVALID_HANDLE_VALUE,
        )
    }
    create_file_w
});

pub static HOOKS: &[&dyn AnyHook] = &[&CREATE_FILE_A, &CREATE_FILE_W];

/// Hooks the executable's own `CreateFileA`/`CreateFileW` imports. Returns how
/// many hooks were installed.
pub fn install() -> usize {
    let Some(host) = ModuleBase::current_process() else {
        warn!("process image not found");
        return 0;
    };
    info!(base = ?host.as_ptr(), "process image");
    let Some(kernel32) = ModuleBase::loaded(c"kernel32.dll") else {
        warn!("kernel32.dll is not loaded");
        return 0;
    };
    // The real addresses come from the module the host imports them from.
    let installed = unsafe { install_all(host, HOOKS, |symbol| proc_address(kernel32, symbol)) };
    info!(installed, "file open hooks done");
    installed
}
