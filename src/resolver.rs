//! Loads the real implementation from a list of candidate modules and fills a
//! table of raw export addresses, one slot per forwarded operation.

use std::{
    any::Any,
    ffi::{CStr, c_void},
    fmt::Display,
    ptr::null_mut,
    sync::{
        Mutex, OnceLock, PoisonError,
        atomic::{AtomicPtr, Ordering},
    },
};

use tracing::{debug, info, warn};

/// One resolved export address. Layout-compatible with a bare pointer, which
/// is what the forwarding stubs load.
#[repr(transparent)]
#[derive(Debug)]
pub struct Slot(AtomicPtr<c_void>);

impl Slot {
    pub const fn null() -> Self {
        Self(AtomicPtr::new(null_mut()))
    }

    pub fn get(&self) -> *mut c_void {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, address: *mut c_void) {
        self.0.store(address, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Export {
    /// Name of the forwarding stub.
    pub stub: &'static str,
    /// Exact (decorated) name looked up in the real module.
    pub name: &'static CStr,
}

/// A `#[repr(C)]` struct of [`Slot`]s, one per entry of `EXPORTS`, in the
/// same order. Generated by [`export_table!`].
pub trait ExportTable: Sync + 'static {
    const EXPORTS: &'static [Export];

    fn slots(&self) -> Vec<&Slot>;
}

pub trait ModuleLoader {
    type Module: Send + 'static;
    type Error: Display;

    fn load(&mut self, name: &str) -> Result<Self::Module, Self::Error>;

    /// Null when the module does not export `name`.
    fn symbol(&mut self, module: &Self::Module, name: &CStr) -> *mut c_void;
}

/// The process loader, through `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLoader;

impl ModuleLoader for DynamicLoader {
    type Module = libloading::Library;
    type Error = libloading::Error;

    fn load(&mut self, name: &str) -> Result<Self::Module, Self::Error> {
        // Running a candidate's initializers is the point of loading it.
        unsafe { libloading::Library::new(name) }
    }

    fn symbol(&mut self, module: &Self::Module, name: &CStr) -> *mut c_void {
        match unsafe { module.get::<*mut c_void>(name.to_bytes_with_nul()) } {
            Ok(symbol) => *symbol,
            Err(_) => null_mut(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    /// Candidate that loaded, if any.
    pub module: Option<&'static str>,
    pub resolved: usize,
    pub missing: Vec<&'static str>,
}

impl Resolution {
    pub fn is_loaded(&self) -> bool {
        self.module.is_some()
    }
}

/// Process-wide forwarding state: the export table the stubs jump through,
/// plus the module that backs it.
///
/// `table` must stay the first field; the stubs address it by offset.
#[repr(C)]
pub struct Forwarder<T> {
    table: T,
    resolution: OnceLock<Resolution>,
    module: Mutex<Option<Box<dyn Any + Send>>>,
}

impl<T> Forwarder<T> {
    #[doc(hidden)]
    pub const TABLE_OFFSET: usize = std::mem::offset_of!(Self, table);
}

impl<T: ExportTable> Forwarder<T> {
    pub const fn new(table: T) -> Self {
        Self {
            table,
            resolution: OnceLock::new(),
            module: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn resolve(&self, candidates: &[&'static str]) -> &Resolution {
        self.resolve_with(&mut DynamicLoader, candidates)
    }

    /// Loads the first candidate that loads and fills every slot from it.
    /// Runs once; later calls return the first outcome.
    pub fn resolve_with<L: ModuleLoader>(
        &self,
        loader: &mut L,
        candidates: &[&'static str],
    ) -> &Resolution {
        self.resolution
            .get_or_init(|| self.load_first(loader, candidates))
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.get()
    }

    fn load_first<L: ModuleLoader>(
        &self,
        loader: &mut L,
        candidates: &[&'static str],
    ) -> Resolution {
        for &candidate in candidates {
            let module = match loader.load(candidate) {
                Ok(module) => module,
                Err(err) => {
                    debug!(candidate, %err, "candidate did not load");
                    continue;
                }
            };
            let mut resolution = Resolution {
                module: Some(candidate),
                ..Resolution::default()
            };
            for (export, slot) in T::EXPORTS.iter().zip(self.table.slots()) {
                let address = loader.symbol(&module, export.name);
                if address.is_null() {
                    debug!(export = ?export.name, "export missing");
                    resolution.missing.push(export.stub);
                } else {
                    resolution.resolved += 1;
                }
                slot.set(address);
            }
            *self.module.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(module));
            info!(
                module = candidate,
                resolved = resolution.resolved,
                missing = ?resolution.missing,
                "forwarding target loaded"
            );
            return resolution;
        }
        warn!(?candidates, "no candidate module loaded; forwarded calls will fault");
        Resolution::default()
    }

    /// Address currently stored for `stub`.
    pub fn address(&self, stub: &str) -> Option<*mut c_void> {
        T::EXPORTS
            .iter()
            .zip(self.table.slots())
            .find(|(export, _)| export.stub == stub)
            .map(|(_, slot)| slot.get())
    }

    /// Clears every slot and releases the module. Terminal: the table is not
    /// resolved again.
    pub fn unload(&self) {
        let Some(module) = self
            .module
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        for slot in self.table.slots() {
            slot.set(null_mut());
        }
        drop(module);
        info!("forwarding target unloaded");
    }
}

/// Declares an export table: a `#[repr(C)]` struct of [`Slot`]s plus its
/// [`ExportTable`] impl.
///
/// ```ignore
/// export_table! {
///     pub struct CodecTable {
///         CodecOpen = c"_CodecOpen@8",
///     }
/// }
/// ```
#[macro_export]
macro_rules! export_table {
    (
        $(#[$attr:meta])*
        $vis:vis struct $table:ident {
            $($stub:ident = $export:literal),* $(,)?
        }
    ) => {
        $(#[$attr])*
        #[repr(C)]
        #[allow(non_snake_case)]
        $vis struct $table {
            $(pub $stub: $crate::resolver::Slot,)*
        }

        impl $table {
            #[allow(clippy::new_without_default)]
            pub const fn new() -> Self {
                Self { $($stub: $crate::resolver::Slot::null(),)* }
            }
        }

        impl $crate::resolver::ExportTable for $table {
            const EXPORTS: &'static [$crate::resolver::Export] = &[
                $($crate::resolver::Export { stub: stringify!($stub), name: $export },)*
            ];

            fn slots(&self) -> ::std::vec::Vec<&$crate::resolver::Slot> {
                ::std::vec![$(&self.$stub,)*]
            }
        }
    };
}
