// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Interposed libc entry points.

use crate::classify::{self, StatBuf};
use crate::config::{self, RecordConfig};
use crate::ioctl::{self, IoctlError};
use crate::script::{self, ScriptError, ScriptOp};
use crate::trap::{self, TrapError};
use crate::{dev_of_fd, fatal_misconfiguration, internal_error, netlink};
use devbed_hooks::{call_real, hook, preserve_errno, set_errno};
use libc::{c_char, c_int, c_ulong, c_void, mode_t, size_t, sockaddr, socklen_t, ssize_t};
use nix::errno::Errno;
use once_cell::sync::OnceCell;
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{debug, error, trace};

static RECORD_CONFIG: OnceCell<RecordConfig> = OnceCell::new();

fn record_config() -> &'static RecordConfig {
    RECORD_CONFIG.get_or_init(|| {
        RecordConfig::from_env().unwrap_or_else(|err| fatal_misconfiguration(&err))
    })
}

/// # Safety
///
/// `path` must be null or a valid C string.
unsafe fn trap_c_path(path: *const c_char) -> Result<Option<CString>, TrapError> {
    if path.is_null() {
        return Ok(None);
    }
    let root = config::testbed_root();
    preserve_errno(|| trap::trap_path(root.as_deref(), CStr::from_ptr(path)))
}

macro_rules! trap_or_fail {
    ($path:expr, $fail:expr) => {
        match trap_c_path($path) {
            Ok(shadow) => shadow,
            Err(err) => {
                debug!(%err, "shadow path too long");
                set_errno(Errno::ENAMETOOLONG);
                return $fail;
            }
        }
    };
}

fn path_ptr(path: *const c_char, shadow: &Option<CString>) -> *const c_char {
    shadow.as_ref().map_or(path, |shadow| shadow.as_ptr())
}

fn c_path(path: &CStr) -> &Path {
    Path::new(OsStr::from_bytes(path.to_bytes()))
}

unsafe fn fixup_stat<S: StatBuf>(
    ret: c_int,
    path: *const c_char,
    shadow: &Option<CString>,
    buf: *mut S,
) {
    let Some(shadow) = shadow else {
        return;
    };
    if ret != 0 || buf.is_null() {
        return;
    }
    let Some(node) = CStr::from_ptr(path).to_bytes().strip_prefix(b"/dev/") else {
        return;
    };
    let Some(root) = config::testbed_root() else {
        return;
    };
    let node = String::from_utf8_lossy(node);
    preserve_errno(|| classify::fixup_stat(&mut *buf, &root, c_path(shadow), &node));
}

fn forget_stale(fd: c_int) {
    netlink::forget_stale(fd);
    ioctl::forget_stale(fd);
    script::forget_stale(fd);
}

unsafe fn after_open(fd: c_int, path: *const c_char, redirected: bool) {
    if fd < 0 {
        return;
    }
    forget_stale(fd);
    let path = CStr::from_ptr(path);

    if redirected {
        if !path.to_bytes().starts_with(b"/dev/") {
            return;
        }
        let Some(root) = config::testbed_root() else {
            return;
        };
        match ioctl::wrap_open(fd, &root, c_path(path)) {
            Ok(()) => {}
            Err(IoctlError::Table(err)) => internal_error(&err),
            Err(err) => fatal_misconfiguration(&err),
        }
        return;
    }

    let records = record_config();
    if records.ioctl.is_none() && records.scripts.is_empty() {
        return;
    }
    let Some(device) = dev_of_fd(fd).filter(|device| *device != 0) else {
        return;
    };

    if let Some(target) = &records.ioctl {
        let testbed_active = config::testbed_root().is_some();
        match ioctl::record_open(fd, device, target, testbed_active) {
            Ok(()) => {}
            Err(IoctlError::Table(err)) => internal_error(&err),
            Err(err) => fatal_misconfiguration(&err),
        }
    }
    if let Some(file) = records.script_file_for(device) {
        match script::record_open(fd, file) {
            Ok(()) => {}
            Err(ScriptError::Table(err)) => internal_error(&err),
            Err(err) => fatal_misconfiguration(&err),
        }
    }
}

fn release_descriptor(fd: c_int) {
    if fd < 0 {
        return;
    }
    match netlink::forget(fd) {
        Ok(true) => debug!(fd, "closing wrapped netlink socket"),
        Ok(false) => {}
        Err(err) => internal_error(&err),
    }
    match ioctl::forget(fd) {
        Ok(true) => debug!(fd, "closing ioctl-wrapped descriptor"),
        Ok(false) => {}
        Err(err) => internal_error(&err),
    }
    if let Err(err) = ioctl::record_close(fd) {
        error!(fd, %err, "failed to write ioctl record");
    }
    if let Err(err) = script::forget(fd) {
        internal_error(&err);
    }
}

unsafe fn record_script(fd: c_int, op: ScriptOp, buf: *const c_void, len: usize) {
    if fd < 0 || buf.is_null() || len == 0 {
        return;
    }
    let bytes = std::slice::from_raw_parts(buf as *const u8, len);
    preserve_errno(|| script::record_op(fd, op, bytes));
}

hook! {
    unsafe fn opendir(path: *const c_char) -> *mut libc::DIR {
        let shadow = trap_or_fail!(path, std::ptr::null_mut());
        call_real!(path_ptr(path, &shadow))
    }
}

hook! {
    unsafe fn fopen(path: *const c_char, mode: *const c_char) -> *mut libc::FILE {
        let shadow = trap_or_fail!(path, std::ptr::null_mut());
        call_real!(path_ptr(path, &shadow), mode)
    }
}

hook! {
    unsafe fn fopen64(path: *const c_char, mode: *const c_char) -> *mut libc::FILE {
        let shadow = trap_or_fail!(path, std::ptr::null_mut());
        call_real!(path_ptr(path, &shadow), mode)
    }
}

hook! {
    unsafe fn mkdir(path: *const c_char, mode: mode_t) -> c_int {
        let shadow = trap_or_fail!(path, -1);
        call_real!(path_ptr(path, &shadow), mode)
    }
}

hook! {
    unsafe fn access(path: *const c_char, mode: c_int) -> c_int {
        let shadow = trap_or_fail!(path, -1);
        call_real!(path_ptr(path, &shadow), mode)
    }
}

hook! {
    unsafe fn readlink(path: *const c_char, buf: *mut c_char, size: size_t) -> ssize_t {
        let shadow = trap_or_fail!(path, -1);
        call_real!(path_ptr(path, &shadow), buf, size)
    }
}

macro_rules! stat_hook {
    ($name:ident, $stat:ty) => {
        hook! {
            unsafe fn $name(path: *const c_char, buf: *mut $stat) -> c_int {
                let shadow = trap_or_fail!(path, -1);
                let ret = call_real!(path_ptr(path, &shadow), buf);
                fixup_stat(ret, path, &shadow, buf);
                ret
            }
        }
    };
}

macro_rules! versioned_stat_hook {
    ($name:ident, $stat:ty) => {
        hook! {
            unsafe fn $name(ver: c_int, path: *const c_char, buf: *mut $stat) -> c_int {
                let shadow = trap_or_fail!(path, -1);
                let ret = call_real!(ver, path_ptr(path, &shadow), buf);
                fixup_stat(ret, path, &shadow, buf);
                ret
            }
        }
    };
}

stat_hook!(stat, libc::stat);
stat_hook!(stat64, libc::stat64);
stat_hook!(lstat, libc::stat);
stat_hook!(lstat64, libc::stat64);
versioned_stat_hook!(__xstat, libc::stat);
versioned_stat_hook!(__xstat64, libc::stat64);
versioned_stat_hook!(__lxstat, libc::stat);
versioned_stat_hook!(__lxstat64, libc::stat64);

macro_rules! open_hook {
    ($name:ident) => {
        hook! {
            unsafe fn $name(path: *const c_char, flags: c_int; ... mode: mode_t) -> c_int {
                let shadow = trap_or_fail!(path, -1);
                let fd = call_real!(path_ptr(path, &shadow), flags, mode);
                if let Some(shadow) = &shadow {
                    trace!(from = ?CStr::from_ptr(path), to = ?shadow, fd, "opened in testbed");
                }
                preserve_errno(|| after_open(fd, path, shadow.is_some()));
                fd
            }
        }
    };
}

open_hook!(open);
open_hook!(open64);

hook! {
    unsafe fn close(fd: c_int) -> c_int {
        preserve_errno(|| release_descriptor(fd));
        call_real!(fd)
    }
}

hook! {
    unsafe fn fclose(stream: *mut libc::FILE) -> c_int {
        if !stream.is_null() {
            let fd = libc::fileno(stream);
            preserve_errno(|| release_descriptor(fd));
        }
        call_real!(stream)
    }
}

hook! {
    unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
        let res = call_real!(fd, buf, count);
        if res > 0 {
            record_script(fd, ScriptOp::Read, buf, res as usize);
        }
        res
    }
}

hook! {
    unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
        let res = call_real!(fd, buf, count);
        if res > 0 {
            record_script(fd, ScriptOp::Write, buf, res as usize);
        }
        res
    }
}

hook! {
    unsafe fn fread(ptr: *mut c_void, size: size_t, nmemb: size_t, stream: *mut libc::FILE) -> size_t {
        let res = call_real!(ptr, size, nmemb, stream);
        if res > 0 && !stream.is_null() {
            let fd = libc::fileno(stream);
            record_script(fd, ScriptOp::Read, ptr, res.saturating_mul(size));
        }
        res
    }
}

hook! {
    unsafe fn fwrite(ptr: *const c_void, size: size_t, nmemb: size_t, stream: *mut libc::FILE) -> size_t {
        let res = call_real!(ptr, size, nmemb, stream);
        if res > 0 && !stream.is_null() {
            let fd = libc::fileno(stream);
            record_script(fd, ScriptOp::Write, ptr, res.saturating_mul(size));
        }
        res
    }
}

hook! {
    unsafe fn fgets(s: *mut c_char, size: c_int, stream: *mut libc::FILE) -> *mut c_char {
        let res = call_real!(s, size, stream);
        if !res.is_null() && !stream.is_null() {
            let fd = libc::fileno(stream);
            let len = CStr::from_ptr(res).to_bytes().len();
            record_script(fd, ScriptOp::Read, res as *const c_void, len);
        }
        res
    }
}

hook! {
    unsafe fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
        let uevent = netlink::is_uevent_socket(domain, protocol);
        let fd = if uevent {
            call_real!(libc::AF_UNIX, netlink::replacement_type(ty), 0)
        } else {
            call_real!(domain, ty, protocol)
        };
        if fd >= 0 {
            preserve_errno(|| {
                forget_stale(fd);
                if uevent {
                    if let Err(err) = netlink::register(fd) {
                        internal_error(&err);
                    }
                }
            });
        }
        fd
    }
}

hook! {
    unsafe fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
        if !netlink::is_wrapped(fd) {
            return call_real!(fd, addr, len);
        }
        let Some(root) = config::testbed_root() else {
            return call_real!(fd, addr, len);
        };
        let path = netlink::event_socket_path(&root, fd);
        let Some((unix_addr, unix_len)) = netlink::unix_sockaddr(&path) else {
            debug!(fd, path = %path.display(), "uevent socket path too long");
            set_errno(Errno::ENAMETOOLONG);
            return -1;
        };
        preserve_errno(|| {
            let _ = std::fs::remove_file(&path);
        });
        debug!(fd, path = %path.display(), "binding uevent socket");
        call_real!(fd, &unix_addr as *const libc::sockaddr_un as *const sockaddr, unix_len)
    }
}

hook! {
    unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
        let name_capacity = if msg.is_null() { 0 } else { (*msg).msg_namelen };
        let ret = call_real!(fd, msg, flags);
        if ret > 0 && !msg.is_null() && netlink::is_wrapped(fd) {
            netlink::forge_kernel_sender(msg, name_capacity);
            trace!(fd, bytes = ret, "forged uevent sender");
        }
        ret
    }
}

hook! {
    unsafe fn ioctl(fd: c_int, request: c_ulong; ... arg: *mut c_void) -> c_int {
        if let Some(result) = ioctl::emulate(fd, request, arg) {
            return result;
        }
        let result = call_real!(fd, request, arg);
        if result != -1 {
            preserve_errno(|| ioctl::record_ioctl(fd, request, arg, result));
        }
        result
    }
}
