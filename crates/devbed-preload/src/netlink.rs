// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel uevent sockets emulated over Unix datagram sockets.
//!
//! A uevent listener gets an `AF_UNIX` socket bound to `<root>/event<fd>`; an
//! external injector sends uevents there. Received messages are made to look
//! like they came from the kernel's udev multicast group.

use crate::fd_table::{lock, release, FdTable, FdTableError};
use libc::{c_int, sockaddr_nl, sockaddr_un, socklen_t};
use once_cell::sync::Lazy;
use std::mem;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Mutex;
use tracing::debug;

/// Multicast group udev monitors listen on.
pub const UDEV_MONITOR_GROUP: u32 = 2;

/// Marker for descriptors created in place of a netlink uevent socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrappedSocket;

static WRAPPED_SOCKETS: Lazy<Mutex<FdTable<WrappedSocket>>> =
    Lazy::new(|| Mutex::new(FdTable::new()));

pub fn is_uevent_socket(domain: c_int, protocol: c_int) -> bool {
    domain == libc::AF_NETLINK && protocol == libc::NETLINK_KOBJECT_UEVENT
}

/// Socket type for the replacement socket, keeping the caller's creation flags.
pub fn replacement_type(ty: c_int) -> c_int {
    libc::SOCK_DGRAM | (ty & (libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK))
}

pub fn register(fd: RawFd) -> Result<(), FdTableError> {
    let mut sockets = lock(&WRAPPED_SOCKETS);
    sockets.take_stale(fd);
    sockets.add(fd, WrappedSocket)?;
    debug!(fd, "intercepting netlink uevent socket");
    Ok(())
}

pub fn is_wrapped(fd: RawFd) -> bool {
    lock(&WRAPPED_SOCKETS).contains(fd)
}

/// Returns whether `fd` was a wrapped socket.
pub fn forget(fd: RawFd) -> Result<bool, FdTableError> {
    Ok(release(&WRAPPED_SOCKETS, fd)?.is_some())
}

pub fn forget_stale(fd: RawFd) {
    lock(&WRAPPED_SOCKETS).take_stale(fd);
}

pub fn event_socket_path(root: &Path, fd: RawFd) -> PathBuf {
    let mut path = root.as_os_str().to_owned();
    path.push(format!("/event{fd}"));
    PathBuf::from(path)
}

/// Build a filesystem `sockaddr_un`, or `None` if `path` does not fit.
pub fn unix_sockaddr(path: &Path) -> Option<(sockaddr_un, socklen_t)> {
    // SAFETY: sockaddr_un is plain old data
    let mut addr: sockaddr_un = unsafe { mem::zeroed() };
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return None;
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Some((addr, mem::size_of::<sockaddr_un>() as socklen_t))
}

/// Make a received message look like a kernel uevent.
///
/// `name_capacity` is the `msg_namelen` the caller passed in, before the real
/// receive overwrote it with the Unix sender's address length.
///
/// # Safety
///
/// `msg` must be a valid `msghdr` just filled by a successful `recvmsg`.
pub unsafe fn forge_kernel_sender(msg: *mut libc::msghdr, name_capacity: socklen_t) {
    let msg = &mut *msg;

    if !msg.msg_name.is_null() && name_capacity as usize >= mem::size_of::<sockaddr_nl>() {
        let mut sender: sockaddr_nl = mem::zeroed();
        sender.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        sender.nl_pid = 0;
        sender.nl_groups = UDEV_MONITOR_GROUP;
        ptr::write_unaligned(msg.msg_name as *mut sockaddr_nl, sender);
        msg.msg_namelen = mem::size_of::<sockaddr_nl>() as socklen_t;
    }

    if msg.msg_control.is_null() {
        return;
    }
    let hdr: *const libc::msghdr = msg;
    let mut cmsg = libc::CMSG_FIRSTHDR(hdr);
    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS {
            let data = libc::CMSG_DATA(cmsg) as *mut libc::ucred;
            let mut cred = ptr::read_unaligned(data);
            cred.uid = 0;
            cred.gid = 0;
            ptr::write_unaligned(data, cred);
        }
        cmsg = libc::CMSG_NXTHDR(hdr, cmsg);
    }
}
