use std::{
    env,
    ffi::OsString,
    path::PathBuf,
};

/// Modules that may supply the real codec, in the order they are tried.
pub const BINK_CANDIDATES: &[&str] = &[
    "binkw32.dll",
    "bink2w32.dll",
    "bink2winrt_x86.uni10.dll",
];

/// `EnvFilter` directives for the log file. `off` disables logging.
pub const LOG_ENV_NAME: &str = "BINK_SHIM_LOG";
pub const LOG_FILE_ENV_NAME: &str = "BINK_SHIM_LOG_FILE";
/// `0` or `false` leaves the host's file APIs unhooked.
pub const TRACE_FILES_ENV_NAME: &str = "BINK_SHIM_TRACE_FILES";

const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_LOG_FILE: &str = "bink_shim.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_filter: String,
    pub log_file: PathBuf,
    pub trace_file_opens: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            trace_file_opens: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var_os(name))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let mut config = Self::default();
        if let Some(filter) = lookup(LOG_ENV_NAME) {
            let filter = filter.to_string_lossy();
            if !filter.trim().is_empty() {
                config.log_filter = filter.trim().to_owned();
            }
        }
        if let Some(file) = lookup(LOG_FILE_ENV_NAME).filter(|file| !file.is_empty()) {
            config.log_file = PathBuf::from(file);
        }
        if let Some(flag) = lookup(TRACE_FILES_ENV_NAME) {
            let flag = flag.to_string_lossy();
            config.trace_file_opens =
                !matches!(flag.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no");
        }
        config
    }

    pub fn logging_enabled(&self) -> bool {
        !self.log_filter.eq_ignore_ascii_case("off")
    }
}
