//! Exported stubs that tail-jump into a resolved [`Forwarder`] table.
//!
//! This is the only place that emits machine code by hand. Each stub is a
//! naked function holding a single indirect `jmp` through its slot, so the
//! callee sees the caller's registers, stack and return address untouched and
//! cleans up the stack exactly as it would have if called directly.
//!
//! [`Forwarder`]: crate::resolver::Forwarder

pub mod bink;

/// Declares a forwarding table: its [`export_table!`] struct, the
/// [`Forwarder`](crate::resolver::Forwarder) static holding it, and one
/// exported `extern "system"` stub per entry.
///
/// Stubs jump through whatever the slot holds; calling one whose slot is
/// null faults.
#[macro_export]
macro_rules! forward_table {
    (
        $(#[$attr:meta])*
        $vis:vis static $forwarder:ident: $table:ident;
        $(
            $(#[$stub_attr:meta])*
            fn $stub:ident($($arg:ident: $arg_ty:ty),* $(,)?) $(-> $ret:ty)? = $export:literal;
        )*
    ) => {
        $crate::export_table! {
            $vis struct $table {
                $($stub = $export,)*
            }
        }

        $(#[$attr])*
        $vis static $forwarder: $crate::resolver::Forwarder<$table> =
            $crate::resolver::Forwarder::new($table::new());

        $(
            $(#[$stub_attr])*
            #[unsafe(naked)]
            #[unsafe(no_mangle)]
            #[allow(non_snake_case, unused_variables)]
            pub unsafe extern "system" fn $stub($($arg: $arg_ty),*) $(-> $ret)? {
                #[cfg(target_arch = "x86_64")]
                ::core::arch::naked_asm!(
                    "jmp qword ptr [rip + {forwarder} + {offset}]",
                    forwarder = sym $forwarder,
                    offset = const $crate::resolver::Forwarder::<$table>::TABLE_OFFSET
                        + ::core::mem::offset_of!($table, $stub),
                );
                #[cfg(target_arch = "x86")]
                ::core::arch::naked_asm!(
                    "jmp dword ptr [{forwarder} + {offset}]",
                    forwarder = sym $forwarder,
                    offset = const $crate::resolver::Forwarder::<$table>::TABLE_OFFSET
                        + ::core::mem::offset_of!($table, $stub),
                );
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::{CStr, c_void},
        mem::{offset_of, size_of},
        ptr::null_mut,
    };

    use crate::resolver::{ExportTable, Forwarder, ModuleLoader, Resolution, Slot};

    unsafe extern "system" fn weighted_sum(
        a: i32,
        b: i32,
        c: i32,
        d: i32,
        e: i32,
        f: i32,
        g: i32,
        h: i32,
        i: i32,
        j: i32,
        k: i32,
    ) -> i32 {
        [a, b, c, d, e, f, g, h, i, j, k]
            .iter()
            .zip(1..)
            .map(|(value, weight)| value * weight)
            .sum()
    }

    unsafe extern "system" fn fill(dst: *mut u32, len: usize, value: u32) -> usize {
        for index in 0..len {
            unsafe { dst.add(index).write(value + index as u32) };
        }
        len
    }

    unsafe extern "system" fn echo(ptr: *mut c_void) -> *mut c_void {
        ptr
    }

    unsafe extern "system" fn wide(a: u64, b: u8, c: f64, d: u16) -> f64 {
        a as f64 + f64::from(b) + c + f64::from(d)
    }

    crate::forward_table! {
        static TEST_FORWARDS: TestForwards;
        fn bink_shim_test_weighted_sum(
            a: i32, b: i32, c: i32, d: i32, e: i32, f: i32,
            g: i32, h: i32, i: i32, j: i32, k: i32,
        ) -> i32 = c"weighted_sum";
        fn bink_shim_test_fill(dst: *mut u32, len: usize, value: u32) -> usize = c"fill";
        fn bink_shim_test_echo(ptr: *mut c_void) -> *mut c_void = c"echo";
        fn bink_shim_test_wide(a: u64, b: u8, c: f64, d: u16) -> f64 = c"wide";
        fn bink_shim_test_missing() = c"missing";
    }

    /// Serves the functions above as if they were a loaded module.
    struct LocalFunctions;

    impl ModuleLoader for LocalFunctions {
        type Module = ();
        type Error = &'static str;

        fn load(&mut self, name: &str) -> Result<(), &'static str> {
            match name {
                "local" => Ok(()),
                _ => Err("not local"),
            }
        }

        fn symbol(&mut self, _: &(), name: &CStr) -> *mut c_void {
            match name.to_bytes() {
                b"weighted_sum" => weighted_sum as *mut c_void,
                b"fill" => fill as *mut c_void,
                b"echo" => echo as *mut c_void,
                b"wide" => wide as *mut c_void,
                _ => null_mut(),
            }
        }
    }

    fn resolved() -> &'static Resolution {
        TEST_FORWARDS.resolve_with(&mut LocalFunctions, &["remote", "local"])
    }

    #[test]
    fn resolution_report() {
        let resolution = resolved();
        assert_eq!(resolution.module, Some("local"));
        assert_eq!(resolution.resolved, 4);
        assert_eq!(resolution.missing, ["bink_shim_test_missing"]);
    }

    #[test]
    fn stack_arguments_pass_through() {
        resolved();
        let args = [3, -1, 4, 1, -5, 9, 2, -6, 5, 3, 5];
        let [a, b, c, d, e, f, g, h, i, j, k] = args;
        let direct = unsafe { weighted_sum(a, b, c, d, e, f, g, h, i, j, k) };
        let forwarded = unsafe { bink_shim_test_weighted_sum(a, b, c, d, e, f, g, h, i, j, k) };
        assert_eq!(forwarded, direct);
    }

    #[test]
    fn memory_side_effects_match() {
        resolved();
        let mut direct = [0u32; 8];
        let mut forwarded = [0u32; 8];
        let direct_len = unsafe { fill(direct.as_mut_ptr(), 6, 40) };
        let forwarded_len = unsafe { bink_shim_test_fill(forwarded.as_mut_ptr(), 6, 40) };
        assert_eq!(forwarded_len, direct_len);
        assert_eq!(forwarded, direct);
        assert_eq!(forwarded[5], 45);
        assert_eq!(forwarded[6], 0);
    }

    #[test]
    fn pointer_and_float_registers_pass_through() {
        resolved();
        let mut value = 7u8;
        let ptr = (&raw mut value).cast::<c_void>();
        assert_eq!(unsafe { bink_shim_test_echo(ptr) }, ptr);
        assert_eq!(unsafe { bink_shim_test_wide(1 << 40, 200, 0.5, 65535) }, unsafe {
            wide(1 << 40, 200, 0.5, 65535)
        });
    }

    #[test]
    fn slots_are_laid_out_in_export_order() {
        assert_eq!(size_of::<Slot>(), size_of::<*mut c_void>());
        assert_eq!(Forwarder::<TestForwards>::TABLE_OFFSET, 0);
        assert_eq!(offset_of!(TestForwards, bink_shim_test_weighted_sum), 0);
        assert_eq!(
            offset_of!(TestForwards, bink_shim_test_missing),
            4 * size_of::<Slot>()
        );
        let slots = TEST_FORWARDS.table().slots();
        assert_eq!(slots.len(), TestForwards::EXPORTS.len());
        assert!(std::ptr::eq(slots[2], &TEST_FORWARDS.table().bink_shim_test_echo));
    }
}
