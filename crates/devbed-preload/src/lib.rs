// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Device testbed preload library.
//!
//! Loaded with `LD_PRELOAD`, it makes unmodified programs see a synthetic
//! device tree: `/dev` and `/sys` lookups are redirected below `DEVBED_DIR`,
//! ioctls on testbed nodes are answered from recorded trees, and kernel uevent
//! sockets are emulated over Unix datagram sockets. Without a testbed it can
//! record ioctls and read/write traffic of real devices for later replay.

#![cfg(target_os = "linux")]

pub mod classify;
pub mod config;
pub mod fd_table;
pub mod interpose;
pub mod ioctl;
pub mod netlink;
pub mod script;
pub mod trap;

use std::fmt::Display;
use std::os::fd::{BorrowedFd, RawFd};
use tracing::error;

const LOG_PREFIX: &str = "[devbed-preload]";

#[ctor::ctor]
fn init_preload() {
    devbed_hooks::enable_hooks();
    let _guard = devbed_hooks::HookGuard::new();
    if let Err(err) = devbed_logging::init_from_env("devbed-preload") {
        eprintln!("{LOG_PREFIX} diagnostics disabled: {err}");
    }
}

/// The harness set us up inconsistently; running on would produce a test
/// against an incomplete mock.
pub(crate) fn fatal_misconfiguration(err: &dyn Display) -> ! {
    error!(%err, "fatal misconfiguration");
    eprintln!("{LOG_PREFIX} ERROR: {err}");
    std::process::exit(1)
}

/// Bookkeeping invariant broken.
pub(crate) fn internal_error(err: &dyn Display) -> ! {
    error!(%err, "internal error");
    eprintln!("{LOG_PREFIX} internal error: {err}");
    std::process::abort()
}

/// Device number behind an open descriptor, if `fstat` succeeds.
pub(crate) fn dev_of_fd(fd: RawFd) -> Option<u64> {
    // SAFETY: the descriptor was just returned by a successful open and is
    // only borrowed for the duration of the call
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    nix::sys::stat::fstat(fd).ok().map(|st| st.st_rdev)
}
