//! The calling thread's last-error code (`GetLastError` on Windows, `errno`
//! elsewhere).

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        pub fn get() -> u32 {
            winsafe::GetLastError().raw()
        }

        pub fn set(code: u32) {
            winsafe::SetLastError(unsafe { winsafe::co::ERROR::from_raw(code) })
        }
    } else if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub fn get() -> u32 {
            unsafe { *libc::__errno_location() as u32 }
        }

        pub fn set(code: u32) {
            unsafe { *libc::__errno_location() = code as libc::c_int }
        }
    } else if #[cfg(target_vendor = "apple")] {
        pub fn get() -> u32 {
            unsafe { *libc::__error() as u32 }
        }

        pub fn set(code: u32) {
            unsafe { *libc::__error() = code as libc::c_int }
        }
    } else {
        pub fn get() -> u32 {
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32
        }

        pub fn set(_code: u32) {}
    }
}

/// Puts a captured code back when dropped, so that anything run in between
/// (logging, mostly) cannot change what the host observes.
pub struct Preserved(u32);

impl Preserved {
    pub fn capture() -> Self {
        Self(get())
    }

    pub fn code(&self) -> u32 {
        self.0
    }
}

impl Drop for Preserved {
    fn drop(&mut self) {
        set(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        set(2);
        assert_eq!(get(), 2);
        set(0);
        assert_eq!(get(), 0);
    }

    #[test]
    fn preserved_restores() {
        set(13);
        {
            let saved = Preserved::capture();
            assert_eq!(saved.code(), 13);
            set(5);
        }
        assert_eq!(get(), 13);
    }
}
