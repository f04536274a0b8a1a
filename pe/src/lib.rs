//! Read-only views over the import metadata of a PE image.
//!
//! Everything here works on a plain byte slice so it can be exercised without
//! a loaded module. Writing a slot is the caller's business.

mod header;
mod import;

#[cfg(any(test, feature = "builder"))]
pub mod builder;

pub use header::{ImageError, ThunkWidth, mapped_len};
pub use import::{Descriptors, ImportDescriptor, ImportName, ImportSlot, ImportTable, ImportThunk, Thunks};
