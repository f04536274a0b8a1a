//! Import hooks on the host executable: redirect functions that log what the
//! host asked for, call the preserved original, and hand back its result.

#[cfg(windows)]
pub mod fileapi;
pub mod text;

use std::{
    borrow::Cow,
    ffi::{CStr, c_void},
    fmt,
    mem::{size_of, transmute_copy},
    ptr::null_mut,
    sync::atomic::{AtomicPtr, AtomicU8, Ordering},
};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    last_error::Preserved,
    patch::{self, ModuleBase, PatchError},
    reentry::reentry_token,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HookState {
    Uninitialized = 0,
    /// The slot held the real function; calls pass through to it.
    Hooked = 1,
    /// The slot already held someone else's redirect; calls pass through to
    /// that instead.
    Chained = 2,
}

impl HookState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Hooked,
            2 => Self::Chained,
            _ => Self::Uninitialized,
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{0:?} is not exported by the system module")]
    Unresolved(&'static CStr),
    #[error("{0:?} is already hooked")]
    AlreadyInstalled(&'static CStr),
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// A redirect for one import of the host, plus the original it passes
/// through to. `F` must be an `unsafe extern "system" fn` type.
pub struct Hook<F> {
    import_module: &'static str,
    symbol: &'static CStr,
    redirect: F,
    original: AtomicPtr<c_void>,
    state: AtomicU8,
}

impl<F: Copy> Hook<F> {
    pub const fn new(import_module: &'static str, symbol: &'static CStr, redirect: F) -> Self {
        assert!(size_of::<F>() == size_of::<*const c_void>());
        Self {
            import_module,
            symbol,
            redirect,
            original: AtomicPtr::new(null_mut()),
            state: AtomicU8::new(HookState::Uninitialized as u8),
        }
    }

    /// What the redirect calls through to. Set before the slot is patched, so
    /// it is always present once the redirect can be reached, and cleared
    /// again if the patch fails.
    pub fn original(&self) -> Option<F> {
        let address = self.original.load(Ordering::Acquire);
        (!address.is_null()).then(|| unsafe { transmute_copy::<*mut c_void, F>(&address) })
    }

    fn address_of(function: &F) -> *const c_void {
        unsafe { transmute_copy(function) }
    }

    /// Points the host's import slot at the redirect.
    ///
    /// `real` is the implementation as exported by the system module. If the
    /// slot holds anything else, an earlier hook owns it and this one chains
    /// through that value instead.
    ///
    /// # Safety
    /// `host` must be a mapped image, and `real` must have the signature `F`.
    pub unsafe fn install(
        &self,
        host: ModuleBase,
        real: *const c_void,
    ) -> Result<HookState, InstallError> {
        if real.is_null() {
            return Err(InstallError::Unresolved(self.symbol));
        }
        if self.state() != HookState::Uninitialized {
            return Err(InstallError::AlreadyInstalled(self.symbol));
        }
        let symbol = self.symbol.to_string_lossy();
        let slot = unsafe { patch::locate(host, self.import_module, &symbol) }?;
        let current = slot.current();
        let (original, state) = if current.is_null() || current == real {
            (real, HookState::Hooked)
        } else {
            (current, HookState::Chained)
        };
        self.original.store(original.cast_mut(), Ordering::Release);
        let previous = match unsafe { slot.replace(Self::address_of(&self.redirect)) } {
            Ok(previous) => previous,
            Err(err) => {
                self.original.store(null_mut(), Ordering::Release);
                return Err(err.into());
            }
        };
        if previous != current {
            warn!(symbol = %symbol, ?previous, ?current, "import slot changed while hooking");
        }
        self.state.store(state as u8, Ordering::Release);
        Ok(state)
    }
}

impl<F> Hook<F> {
    pub fn state(&self) -> HookState {
        HookState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn symbol(&self) -> &'static CStr {
        self.symbol
    }
}

/// Object-safe view of a [`Hook`], so hooks of different signatures can be
/// installed from one list.
pub trait AnyHook: Sync {
    fn import_module(&self) -> &'static str;

    fn symbol(&self) -> &'static CStr;

    fn state(&self) -> HookState;

    fn original_address(&self) -> Option<*const c_void>;

    /// # Safety
    /// See [`Hook::install`].
    unsafe fn install(&self, host: ModuleBase, real: *const c_void)
    -> Result<HookState, InstallError>;
}

impl<F: Copy + Send + Sync> AnyHook for Hook<F> {
    fn import_module(&self) -> &'static str {
        self.import_module
    }

    fn symbol(&self) -> &'static CStr {
        self.symbol
    }

    fn state(&self) -> HookState {
        Hook::state(self)
    }

    fn original_address(&self) -> Option<*const c_void> {
        self.original().map(|original| Self::address_of(&original))
    }

    unsafe fn install(
        &self,
        host: ModuleBase,
        real: *const c_void,
    ) -> Result<HookState, InstallError> {
        unsafe { Hook::install(self, host, real) }
    }
}

/// Installs every hook, logging each outcome. Returns how many were
/// installed; failures leave the host calling its import directly.
///
/// # Safety
/// `host` must be a mapped image and `resolve_real` must return addresses
/// matching each hook's signature (or null).
pub unsafe fn install_all(
    host: ModuleBase,
    hooks: &[&dyn AnyHook],
    mut resolve_real: impl FnMut(&CStr) -> *const c_void,
) -> usize {
    let mut installed = 0;
    for hook in hooks {
        let real = resolve_real(hook.symbol());
        match unsafe { hook.install(host, real) } {
            Ok(state) => {
                installed += 1;
                info!(
                    symbol = ?hook.symbol(),
                    ?state,
                    original = ?hook.original_address(),
                    "import hooked"
                );
            }
            Err(err) => {
                warn!(
                    symbol = ?hook.symbol(),
                    module = hook.import_module(),
                    %err,
                    "import not hooked"
                );
            }
        }
    }
    if installed == 0 && !hooks.is_empty() {
        warn!("no import hooks installed");
    }
    installed
}

/// What an intercepted open call was asked to do.
#[derive(Debug)]
pub struct OpenRequest<'a> {
    pub api: &'static str,
    pub path: Option<Cow<'a, str>>,
    /// The raw path argument, logged when it could not be read.
    pub address: *const c_void,
    pub flags: u32,
    pub disposition: u32,
}

struct Hex(u32);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

const UNKNOWN_PATH: &str = "<unknown>";

reentry_token!(OBSERVING);

/// Runs `call` with an entry line before it and an outcome line after it.
///
/// The last-error code the caller had is put back before `call` runs, and
/// the one `call` leaves is read right after it returns and put back after
/// logging, so logging never shows through to the host. Re-entered on
/// the same thread (the log sink opening a file, say), it only runs `call`.
pub fn observe<'a, R>(
    describe: impl FnOnce() -> OpenRequest<'a>,
    call: impl FnOnce() -> R,
    failed: impl FnOnce(&R) -> bool,
) -> R {
    let Some(guard) = OBSERVING.try_enter() else {
        return call();
    };
    let entry_error = Preserved::capture();
    let request = describe();
    let flags = Hex(request.flags);
    match &request.path {
        Some(path) => info!(
            api = request.api,
            path = %path,
            %flags,
            disposition = request.disposition,
            "open request"
        ),
        None => info!(
            api = request.api,
            path = "<empty-or-null>",
            address = ?request.address,
            %flags,
            disposition = request.disposition,
            "open request"
        ),
    }

    // The original may succeed without touching last-error.
    drop(entry_error);
    let result = call();
    let last_error = Preserved::capture();

    let path = request.path.as_deref().unwrap_or(UNKNOWN_PATH);
    if failed(&result) {
        warn!(
            api = request.api,
            path = %path,
            error = last_error.code(),
            %flags,
            disposition = request.disposition,
            "open failed"
        );
    } else {
        info!(api = request.api, path = %path, "open ok");
    }
    drop(guard);
    drop(last_error);
    result
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::c_char,
        io,
        ptr::{NonNull, null},
        sync::atomic::AtomicUsize,
    };

    use bink_shim_pe::{ThunkWidth, builder::ImageBuilder};

    use super::*;
    use crate::{
        last_error,
        logging::{subscriber, test_support::Capture},
    };

    type Open = unsafe extern "system" fn(path: *const c_char, flags: u32) -> isize;

    const NOT_FOUND: u32 = 2;

    unsafe extern "system" fn real_open(path: *const c_char, _flags: u32) -> isize {
        if !path.is_null() && unsafe { CStr::from_ptr(path) }.to_bytes() == b"present" {
            7
        } else {
            last_error::set(NOT_FOUND);
            -1
        }
    }

    /// Someone else's redirect that got to the slot first.
    unsafe extern "system" fn earlier_hook(path: *const c_char, flags: u32) -> isize {
        match unsafe { real_open(path, flags) } {
            -1 => -1,
            handle => handle + 100,
        }
    }

    unsafe fn observed_open(hook: &Hook<Open>, path: *const c_char, flags: u32) -> isize {
        observe(
            || OpenRequest {
                api: "OpenThing",
                path: unsafe { text::narrow(path) }.map(Cow::Owned),
                address: path.cast(),
                flags,
                disposition: 3,
            },
            || match hook.original() {
                Some(original) => unsafe { original(path, flags) },
                None => -1,
            },
            |handle| *handle == -1,
        )
    }

    static HOOKED: Hook<Open> = Hook::new("KERNEL32.dll", c"OpenThing", {
        unsafe extern "system" fn open(path: *const c_char, flags: u32) -> isize {
            unsafe { observed_open(&HOOKED, path, flags) }
        }
        open
    });

    static CHAINED: Hook<Open> = Hook::new("KERNEL32.dll", c"OpenThing", {
        unsafe extern "system" fn open(path: *const c_char, flags: u32) -> isize {
            unsafe { observed_open(&CHAINED, path, flags) }
        }
        open
    });

    static UNRESOLVED: Hook<Open> = Hook::new("KERNEL32.dll", c"CloseThing", {
        unsafe extern "system" fn open(path: *const c_char, flags: u32) -> isize {
            unsafe { observed_open(&UNRESOLVED, path, flags) }
        }
        open
    });

    static NOT_IMPORTED: Hook<Open> = Hook::new("KERNEL32.dll", c"DeleteThing", {
        unsafe extern "system" fn open(path: *const c_char, flags: u32) -> isize {
            unsafe { observed_open(&NOT_IMPORTED, path, flags) }
        }
        open
    });

    fn host_importing(open: usize) -> bink_shim_pe::builder::BuiltImage {
        ImageBuilder::native()
            .module("KERNEL32.dll")
            .import("CloseThing", 0x10)
            .import("OpenThing", open as u64)
            .build()
    }

    fn base_of(bytes: &mut [u8]) -> ModuleBase {
        unsafe { ModuleBase::from_ptr(NonNull::new(bytes.as_mut_ptr()).unwrap()) }
    }

    fn slot_function(image: &bink_shim_pe::builder::BuiltImage) -> Open {
        let address = image.slot_value(0, 1, ThunkWidth::native()) as usize;
        unsafe { std::mem::transmute::<usize, Open>(address) }
    }

    #[test]
    fn hooked_slot_passes_through() {
        let mut image = host_importing(real_open as usize);
        let host = base_of(&mut image.bytes);
        let state = unsafe { HOOKED.install(host, real_open as *const c_void) }.unwrap();
        assert_eq!(state, HookState::Hooked);
        assert_eq!(HOOKED.state(), HookState::Hooked);
        assert_eq!(
            HOOKED.original().map(|f| f as usize),
            Some(real_open as usize)
        );

        let through_slot = slot_function(&image);
        assert_ne!(through_slot as usize, real_open as usize);

        let capture = Capture::default();
        tracing::subscriber::with_default(subscriber("info", capture.clone()), || {
            assert_eq!(unsafe { through_slot(c"present".as_ptr(), 1) }, unsafe {
                real_open(c"present".as_ptr(), 1)
            });
            last_error::set(0);
            assert_eq!(unsafe { through_slot(c"absent".as_ptr(), 1) }, -1);
            assert_eq!(last_error::get(), NOT_FOUND);
        });
        let log = capture.contents();
        assert!(log.contains("open ok"));
        assert!(log.contains("path=present"));
        assert!(log.contains("open failed"));
        assert!(log.contains("error=2"));

        let again = unsafe { HOOKED.install(host, real_open as *const c_void) };
        assert!(matches!(again, Err(InstallError::AlreadyInstalled(_))));
    }

    #[test]
    fn existing_redirect_is_chained() {
        let mut image = host_importing(earlier_hook as usize);
        let host = base_of(&mut image.bytes);
        let state = unsafe { CHAINED.install(host, real_open as *const c_void) }.unwrap();
        assert_eq!(state, HookState::Chained);
        assert_eq!(
            CHAINED.original().map(|f| f as usize),
            Some(earlier_hook as usize)
        );
        let through_slot = slot_function(&image);
        assert_eq!(unsafe { through_slot(c"present".as_ptr(), 0) }, 107);
    }

    #[test]
    fn failed_installs_leave_hook_uninitialized() {
        let mut image = host_importing(real_open as usize);
        let pristine = image.bytes.clone();
        let host = base_of(&mut image.bytes);

        let unresolved = unsafe { UNRESOLVED.install(host, null()) };
        assert!(matches!(unresolved, Err(InstallError::Unresolved(_))));
        assert_eq!(UNRESOLVED.state(), HookState::Uninitialized);

        let missing = unsafe { NOT_IMPORTED.install(host, real_open as *const c_void) };
        assert!(matches!(missing, Err(InstallError::Patch(_))));
        assert_eq!(NOT_IMPORTED.state(), HookState::Uninitialized);
        assert!(NOT_IMPORTED.original().is_none());
        assert_eq!(image.bytes, pristine);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn refused_patch_keeps_no_original() {
        use crate::patch::test_support::Straddling;

        static RETRIED: Hook<Open> = Hook::new("KERNEL32.dll", c"OpenThing", {
            unsafe extern "system" fn open(path: *const c_char, flags: u32) -> isize {
                unsafe { observed_open(&RETRIED, path, flags) }
            }
            open
        });

        let image = host_importing(earlier_hook as usize);
        let host = Straddling::new(&image.bytes, image.slots[0][1]);
        let refused = unsafe { RETRIED.install(host.base(), real_open as *const c_void) };
        assert!(matches!(
            refused,
            Err(InstallError::Patch(PatchError::Protect(_)))
        ));
        assert_eq!(RETRIED.state(), HookState::Uninitialized);
        assert!(RETRIED.original().is_none());
        assert_eq!(host.bytes(), &image.bytes[..]);

        // A later attempt records what that slot holds, not the earlier one.
        let mut image = host_importing(real_open as usize);
        let host = base_of(&mut image.bytes);
        let state = unsafe { RETRIED.install(host, real_open as *const c_void) }.unwrap();
        assert_eq!(state, HookState::Hooked);
        assert_eq!(
            RETRIED.original().map(|f| f as usize),
            Some(real_open as usize)
        );
        assert_eq!(unsafe { slot_function(&image)(c"present".as_ptr(), 0) }, 7);
    }

    #[test]
    fn install_all_counts_successes() {
        static FIRST: Hook<Open> = Hook::new("KERNEL32.dll", c"OpenThing", real_open);
        static SECOND: Hook<Open> = Hook::new("KERNEL32.dll", c"CloseThing", real_open);

        let mut image = host_importing(real_open as usize);
        let host = base_of(&mut image.bytes);
        let capture = Capture::default();
        let installed = tracing::subscriber::with_default(subscriber("info", capture.clone()), || {
            unsafe {
                install_all(host, &[&FIRST, &SECOND], |symbol| {
                    if symbol == c"OpenThing" {
                        real_open as *const c_void
                    } else {
                        null()
                    }
                })
            }
        });
        assert_eq!(installed, 1);
        assert_eq!(FIRST.state(), HookState::Hooked);
        assert_eq!(SECOND.state(), HookState::Uninitialized);
        let log = capture.contents();
        assert!(log.contains("import hooked"));
        assert!(log.contains("import not hooked"));
    }

    #[test]
    fn null_and_empty_paths_still_pass_through() {
        let calls = AtomicUsize::new(0);
        let capture = Capture::default();
        tracing::subscriber::with_default(subscriber("info", capture.clone()), || {
            for path in [null(), c"".as_ptr()] {
                let result = observe(
                    || OpenRequest {
                        api: "OpenThing",
                        path: unsafe { text::narrow(path) }.map(Cow::Owned),
                        address: path.cast(),
                        flags: 0x80,
                        disposition: 3,
                    },
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        unsafe { real_open(path, 0) }
                    },
                    |handle| *handle == -1,
                );
                assert_eq!(result, -1);
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let log = capture.contents();
        assert!(log.contains("<empty-or-null>"));
        assert!(log.contains("flags=0x00000080"));
        assert!(log.contains("path=<unknown>"));
    }

    /// A sink whose writes clobber the last-error code, as real file writes do.
    #[derive(Clone, Default)]
    struct Clobbering(Capture);

    impl io::Write for Clobbering {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            last_error::set(0xDEAD);
            io::Write::write(&mut self.0, buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Clobbering {
        type Writer = Clobbering;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn logging_does_not_change_last_error() {
        tracing::subscriber::with_default(subscriber("info", Clobbering::default()), || {
            let result = observe(
                || OpenRequest {
                    api: "OpenThing",
                    path: Some(Cow::Borrowed("absent")),
                    address: null(),
                    flags: 0,
                    disposition: 3,
                },
                || unsafe { real_open(c"absent".as_ptr(), 0) },
                |handle| *handle == -1,
            );
            assert_eq!(result, -1);
            assert_eq!(last_error::get(), NOT_FOUND);
        });
    }

    #[test]
    fn entry_logging_does_not_reach_a_successful_call() {
        tracing::subscriber::with_default(subscriber("info", Clobbering::default()), || {
            last_error::set(183);
            let result = observe(
                || OpenRequest {
                    api: "OpenThing",
                    path: Some(Cow::Borrowed("present")),
                    address: null(),
                    flags: 0,
                    disposition: 3,
                },
                || {
                    assert_eq!(last_error::get(), 183);
                    7isize
                },
                |handle| *handle == -1,
            );
            assert_eq!(result, 7);
            assert_eq!(last_error::get(), 183);
        });
    }

    #[test]
    fn reentered_observer_only_passes_through() {
        let capture = Capture::default();
        let describe = |api| {
            move || OpenRequest {
                api,
                path: Some(Cow::Borrowed("nested")),
                address: null(),
                flags: 0,
                disposition: 0,
            }
        };
        tracing::subscriber::with_default(subscriber("info", capture.clone()), || {
            let outer = observe(
                describe("Outer"),
                || observe(describe("Inner"), || 5, |_| false) + 1,
                |_| false,
            );
            assert_eq!(outer, 6);
        });
        let log = capture.contents();
        assert!(log.contains("api=\"Outer\"") || log.contains("api=Outer"));
        assert!(!log.contains("Inner"));
    }
}
