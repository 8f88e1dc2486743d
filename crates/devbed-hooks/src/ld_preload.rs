// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use core::cell::Cell;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use libc::c_char;
use nix::errno::Errno;

/// # Safety
///
/// Performs dynamic symbol resolution via `dlsym(RTLD_NEXT, ...)`. `symbol`
/// must be NUL-terminated.
pub unsafe fn dlsym_next(symbol: &'static str) -> *mut c_void {
    debug_assert!(symbol.ends_with('\0'));
    let ptr = libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr() as *const c_char);
    if ptr.is_null() {
        panic!(
            "devbed-hooks: unable to find underlying function for {}",
            symbol.trim_end_matches('\0')
        );
    }
    ptr
}

/// Lazily resolved address of the real (next) definition of a libc symbol.
pub struct RealFn {
    symbol: &'static str,
    addr: AtomicPtr<c_void>,
}

impl RealFn {
    /// `symbol` must be NUL-terminated, e.g. `"open\0"`.
    pub const fn new(symbol: &'static str) -> Self {
        Self {
            symbol,
            addr: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Address of the real function, resolved on first call.
    ///
    /// Concurrent first calls may both resolve; `dlsym` returns the same
    /// address, so the race is benign.
    pub fn get(&self) -> *mut c_void {
        let addr = self.addr.load(Ordering::Acquire);
        if !addr.is_null() {
            return addr;
        }
        let resolved = unsafe { dlsym_next(self.symbol) };
        self.addr.store(resolved, Ordering::Release);
        resolved
    }
}

static RUNTIME_READY: AtomicBool = AtomicBool::new(false);

thread_local! {
    static HOOK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Enable hooks to start intercepting function calls.
///
/// Hooks are enabled automatically when the library is loaded.
pub fn enable_hooks() {
    RUNTIME_READY.store(true, Ordering::Release);
}

pub fn hooks_enabled() -> bool {
    RUNTIME_READY.load(Ordering::Acquire)
}

/// Returns true when hooks are allowed to run (no active reentrancy guard).
pub fn hooks_allowed() -> bool {
    HOOK_DEPTH.with(|cell| cell.get() == 0)
}

pub struct HookGuard;

impl HookGuard {
    pub fn new() -> Self {
        HOOK_DEPTH.with(|cell| cell.set(cell.get() + 1));
        HookGuard
    }
}

impl Default for HookGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        HOOK_DEPTH.with(|cell| {
            let current = cell.get();
            if current > 0 {
                cell.set(current - 1);
            }
        });
    }
}

/// Run `f` and restore `errno` to the value it had before.
///
/// Bookkeeping after a real call must not leak its own errno to the caller.
pub fn preserve_errno<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let saved = Errno::last_raw();
    let result = f();
    Errno::set_raw(saved);
    result
}

pub fn set_errno(errno: Errno) {
    Errno::set_raw(errno as i32);
}

#[ctor::ctor]
fn auto_enable_hooks() {
    enable_hooks();
}

/// Call the real function from inside a [`hook!`] body.
#[macro_export]
macro_rules! call_real {
    ($($args:expr),* $(,)?) => {
        {
            let value = __devbed_real_fn!()($($args),*);
            __devbed_real_result!().set(Some(value));
            value
        }
    };
}

/// Define an interposed libc entry point.
///
/// ```ignore
/// devbed_hooks::hook! {
///     unsafe fn access(path: *const libc::c_char, mode: libc::c_int) -> libc::c_int {
///         devbed_hooks::call_real!(path, mode)
///     }
/// }
/// ```
///
/// C-variadic functions take their single optional argument after `; ...`;
/// it is forwarded to the real function as a variadic argument:
///
/// ```ignore
/// devbed_hooks::hook! {
///     unsafe fn ioctl(fd: libc::c_int, request: libc::c_ulong; ... arg: *mut libc::c_void) -> libc::c_int {
///         devbed_hooks::call_real!(fd, request, arg)
///     }
/// }
/// ```
///
/// The symbol is exported unmangled except in unit-test builds, so a test
/// binary never interposes its own libc calls. A panic in the body falls back
/// to the real function, unless the body already called it; then the result of
/// that call is returned. Return types must be `Copy`.
#[macro_export]
macro_rules! hook {
    (unsafe fn $real_fn:ident ( $( $v:ident : $t:ty ),* $(,)? ) -> $r:ty $body:block) => {
        $crate::__devbed_paste! {
            #[allow(non_upper_case_globals)]
            static [<__DEVBED_REAL_ $real_fn>]: $crate::RealFn =
                $crate::RealFn::new(concat!(stringify!($real_fn), "\0"));

            #[cfg_attr(not(test), no_mangle)]
            #[cfg_attr(test, allow(dead_code))]
            #[allow(clippy::missing_safety_doc)]
            pub unsafe extern "C" fn $real_fn($($v : $t),*) -> $r {
                let real: unsafe extern "C" fn($($t),*) -> $r =
                    ::core::mem::transmute([<__DEVBED_REAL_ $real_fn>].get());
                if !$crate::hooks_enabled() || !$crate::hooks_allowed() {
                    return real($($v),*);
                }
                let _devbed_guard = $crate::HookGuard::new();
                let __devbed_result: ::core::cell::Cell<Option<$r>> = ::core::cell::Cell::new(None);
                #[allow(unused_macros)]
                macro_rules! __devbed_real_fn {
                    () => {
                        real
                    };
                }
                #[allow(unused_macros)]
                macro_rules! __devbed_real_result {
                    () => {
                        __devbed_result
                    };
                }
                match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $body)) {
                    Ok(value) => value,
                    Err(_) => match __devbed_result.take() {
                        Some(value) => value,
                        None => real($($v),*),
                    },
                }
            }
        }
    };

    (unsafe fn $real_fn:ident ( $( $v:ident : $t:ty ),+ ; ... $va:ident : $vt:ty ) -> $r:ty $body:block) => {
        $crate::__devbed_paste! {
            #[allow(non_upper_case_globals)]
            static [<__DEVBED_REAL_ $real_fn>]: $crate::RealFn =
                $crate::RealFn::new(concat!(stringify!($real_fn), "\0"));

            #[cfg_attr(not(test), no_mangle)]
            #[cfg_attr(test, allow(dead_code))]
            #[allow(clippy::missing_safety_doc)]
            pub unsafe extern "C" fn $real_fn($($v : $t),+ , $va : $vt) -> $r {
                let real: unsafe extern "C" fn($($t),+ , ...) -> $r =
                    ::core::mem::transmute([<__DEVBED_REAL_ $real_fn>].get());
                if !$crate::hooks_enabled() || !$crate::hooks_allowed() {
                    return real($($v),+ , $va);
                }
                let _devbed_guard = $crate::HookGuard::new();
                let __devbed_result: ::core::cell::Cell<Option<$r>> = ::core::cell::Cell::new(None);
                #[allow(unused_macros)]
                macro_rules! __devbed_real_fn {
                    () => {
                        real
                    };
                }
                #[allow(unused_macros)]
                macro_rules! __devbed_real_result {
                    () => {
                        __devbed_result
                    };
                }
                match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $body)) {
                    Ok(value) => value,
                    Err(_) => match __devbed_result.take() {
                        Some(value) => value,
                        None => real($($v),+ , $va),
                    },
                }
            }
        }
    };

    (unsafe fn $real_fn:ident ( $( $v:ident : $t:ty ),* $(,)? ) $body:block) => {
        $crate::hook! { unsafe fn $real_fn ( $( $v : $t ),* ) -> () $body }
    };
}
