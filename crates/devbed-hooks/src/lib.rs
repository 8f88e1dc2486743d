// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Plumbing shared by the devbed preload library.
//!
//! Every interposed libc entry point is generated by [`hook!`]. The generated
//! function resolves the next definition of the symbol with
//! `dlsym(RTLD_NEXT, ...)` on first use, caches it, and runs the hook body under
//! a per-thread [`HookGuard`]. While a guard is held, nested calls into any
//! interposed symbol (file IO done by the hook itself, logging, existence
//! checks) go straight to the real implementation.

extern crate libc;

#[doc(hidden)]
pub use paste::paste as __devbed_paste;

#[cfg(target_env = "gnu")]
pub mod ld_preload;

#[cfg(target_env = "gnu")]
pub use ld_preload::{
    HookGuard, RealFn, enable_hooks, hooks_allowed, hooks_enabled, preserve_errno, set_errno,
};
