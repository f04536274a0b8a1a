//! Scoped write access to memory that is normally read-only (import address
//! tables live in `.rdata` or `.idata`).

use std::{ffi::c_void, io};

use tracing::debug;

pub use os_impl::page_size;

/// Makes `[addr, addr + len)` writable until dropped, then puts back whatever
/// protection the pages had before. Restoring is best effort.
#[must_use = "protection is restored as soon as the guard is dropped"]
pub struct Unprotected {
    addr: *mut c_void,
    len: usize,
    previous: os_impl::Protection,
}

impl Unprotected {
    /// # Safety
    /// The range must be mapped, and nothing may rely on it being read-only
    /// while the guard lives.
    pub unsafe fn new(addr: *mut c_void, len: usize) -> io::Result<Self> {
        let previous = unsafe { os_impl::make_writable(addr, len) }?;
        Ok(Self {
            addr,
            len,
            previous,
        })
    }
}

impl Drop for Unprotected {
    fn drop(&mut self) {
        if let Err(err) = unsafe { os_impl::restore(self.addr, self.len, self.previous) } {
            debug!(addr = ?self.addr, len = self.len, %err, "restoring page protection failed");
        }
    }
}

#[cfg(windows)]
mod os_impl {
    use std::{ffi::c_void, io, mem::MaybeUninit};

    use winapi::{
        shared::minwindef::DWORD,
        um::{memoryapi::VirtualProtect, sysinfoapi::GetSystemInfo, winnt::PAGE_EXECUTE_READWRITE},
    };

    use crate::windows::winapi_utils::ck;

    pub type Protection = DWORD;

    pub fn page_size() -> usize {
        let mut info = MaybeUninit::uninit();
        unsafe { GetSystemInfo(info.as_mut_ptr()) };
        unsafe { info.assume_init() }.dwPageSize as usize
    }

    pub unsafe fn make_writable(addr: *mut c_void, len: usize) -> io::Result<Protection> {
        let mut previous: DWORD = 0;
        // The slot may share its page with code in hand-linked images.
        ck(unsafe { VirtualProtect(addr, len, PAGE_EXECUTE_READWRITE, &mut previous) })
            .map_err(|err| io::Error::from_raw_os_error(err.raw() as i32))?;
        Ok(previous)
    }

    pub unsafe fn restore(addr: *mut c_void, len: usize, previous: Protection) -> io::Result<()> {
        let mut replaced: DWORD = 0;
        ck(unsafe { VirtualProtect(addr, len, previous, &mut replaced) })
            .map_err(|err| io::Error::from_raw_os_error(err.raw() as i32))
    }
}

#[cfg(target_os = "linux")]
mod os_impl {
    use std::{ffi::c_void, io};

    use libc::c_int;

    pub type Protection = c_int;

    pub fn page_size() -> usize {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => 4096,
        }
    }

    fn page_span(addr: *mut c_void, len: usize) -> (usize, usize) {
        let page = page_size();
        let start = addr as usize & !(page - 1);
        let end = (addr as usize + len.max(1)).div_ceil(page) * page;
        (start, end - start)
    }

    /// Current rights of the mapping containing the whole range, from
    /// /proc/self/maps (there is no direct query).
    fn current_protection(start: usize, len: usize) -> io::Result<Protection> {
        let maps = proc_maps::get_process_maps(std::process::id() as proc_maps::Pid)?;
        let map = maps
            .iter()
            .find(|map| map.start() <= start && start + len <= map.start() + map.size())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{start:#x}+{len:#x} is not inside a single mapping"),
                )
            })?;
        let mut protection = libc::PROT_NONE;
        if map.is_read() {
            protection |= libc::PROT_READ;
        }
        if map.is_write() {
            protection |= libc::PROT_WRITE;
        }
        if map.is_exec() {
            protection |= libc::PROT_EXEC;
        }
        Ok(protection)
    }

    unsafe fn mprotect(start: usize, len: usize, protection: Protection) -> io::Result<()> {
        if unsafe { libc::mprotect(start as *mut c_void, len, protection) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub unsafe fn make_writable(addr: *mut c_void, len: usize) -> io::Result<Protection> {
        let (start, span) = page_span(addr, len);
        let previous = current_protection(start, span)?;
        if previous & libc::PROT_WRITE == 0 {
            unsafe { mprotect(start, span, previous | libc::PROT_READ | libc::PROT_WRITE) }?;
        }
        Ok(previous)
    }

    pub unsafe fn restore(addr: *mut c_void, len: usize, previous: Protection) -> io::Result<()> {
        if previous & libc::PROT_WRITE != 0 {
            return Ok(());
        }
        let (start, span) = page_span(addr, len);
        unsafe { mprotect(start, span, previous) }
    }
}

#[cfg(not(any(windows, target_os = "linux")))]
mod os_impl {
    use std::{ffi::c_void, io};

    pub type Protection = ();

    pub fn page_size() -> usize {
        4096
    }

    pub unsafe fn make_writable(_addr: *mut c_void, _len: usize) -> io::Result<Protection> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "page protection changes are not supported on this platform",
        ))
    }

    pub unsafe fn restore(_addr: *mut c_void, _len: usize, _previous: Protection) -> io::Result<()> {
        Ok(())
    }
}
