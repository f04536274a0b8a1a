//! A drop-in proxy for the Bink video codec.
//!
//! Loaded in place of `binkw32.dll`, it forwards every Bink export to the real
//! codec (the first of [`config::BINK_CANDIDATES`] that loads), and hooks the
//! host executable's `CreateFileA`/`CreateFileW` imports to log which files it
//! opens.

mod reentry;

pub mod config;
pub mod intercept;
pub mod last_error;
pub mod logging;
pub mod patch;
pub mod protect;
pub mod resolver;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod forward;

#[cfg(windows)]
mod windows;
