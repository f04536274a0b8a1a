pub mod winapi_utils;

use winapi::{
    shared::minwindef::{BOOL, HINSTANCE, LPVOID, TRUE},
    um::winnt,
};

use crate::{config::Config, logging};

/// Everything here degrades to "not hooked" or "not forwarded" with a log
/// line; the host never sees a failed load because of it.
fn attach() {
    let config = Config::from_env();
    logging::init(&config);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "attached");

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    crate::forward::bink::BINK.resolve(crate::config::BINK_CANDIDATES);

    if config.trace_file_opens {
        crate::intercept::fileapi::install();
    } else {
        tracing::info!("file open tracing disabled");
    }
}

fn detach(process_exiting: bool) {
    // On process exit other modules may already be gone; leave them be.
    if process_exiting {
        return;
    }
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    crate::forward::bink::BINK.unload();
}

#[unsafe(no_mangle)]
#[allow(non_snake_case)]
extern "system" fn DllMain(_hinstance: HINSTANCE, reason: u32, reserved: LPVOID) -> BOOL {
    match reason {
        winnt::DLL_PROCESS_ATTACH => attach(),
        winnt::DLL_PROCESS_DETACH => detach(!reserved.is_null()),
        _ => {}
    }
    TRUE
}
