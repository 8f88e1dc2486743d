// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reconstruct device typing for stat results of redirected `/dev` nodes.
//!
//! The testbed stores device nodes as plain files. A set sticky bit marks a
//! block device, anything else is a char device. The device number lives in a
//! side symlink `<root>/dev/.node/<name>` whose target reads `major:minor`,
//! with `/` in the node name replaced by `_`.

use libc::mode_t;
use nix::sys::stat::makedev;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Mode and device fields shared by `struct stat` and `struct stat64`.
pub trait StatBuf {
    fn mode(&self) -> mode_t;
    fn set_mode(&mut self, mode: mode_t);
    fn set_rdev(&mut self, rdev: libc::dev_t);
}

impl StatBuf for libc::stat {
    fn mode(&self) -> mode_t {
        self.st_mode
    }
    fn set_mode(&mut self, mode: mode_t) {
        self.st_mode = mode;
    }
    fn set_rdev(&mut self, rdev: libc::dev_t) {
        self.st_rdev = rdev;
    }
}

#[cfg(target_env = "gnu")]
impl StatBuf for libc::stat64 {
    fn mode(&self) -> mode_t {
        self.st_mode
    }
    fn set_mode(&mut self, mode: mode_t) {
        self.st_mode = mode;
    }
    fn set_rdev(&mut self, rdev: libc::dev_t) {
        self.st_rdev = rdev;
    }
}

/// Whether a shadow entry stands for a device node.
///
/// Symlinks into the real `/dev` (pty pairs) count, other symlinks and
/// directories do not.
pub fn is_emulated_device(shadow: &Path, mode: mode_t) -> bool {
    match mode & libc::S_IFMT {
        libc::S_IFLNK => std::fs::read_link(shadow)
            .map(|target| target.starts_with("/dev/"))
            .unwrap_or(false),
        libc::S_IFDIR => false,
        _ => true,
    }
}

/// Rewrite the file type bits of an emulated node.
pub fn device_mode(mode: mode_t) -> mode_t {
    let mode = mode & !libc::S_IFREG;
    if mode & libc::S_ISVTX != 0 {
        (mode & !libc::S_ISVTX) | libc::S_IFBLK
    } else {
        mode | libc::S_IFCHR
    }
}

/// Side-channel symlink holding the device number of `/dev/<node>`.
pub fn node_link_path(root: &Path, node: &str) -> PathBuf {
    root.join("dev/.node").join(node.replace('/', "_"))
}

/// Device number of `/dev/<node>`, or 0 when it cannot be determined.
pub fn node_rdev(root: &Path, node: &str) -> libc::dev_t {
    let link = node_link_path(root, node);
    let target = match std::fs::read_link(&link) {
        Ok(target) => target,
        Err(err) => {
            trace!(node, link = %link.display(), %err, "no device number link");
            return 0;
        }
    };
    let text = target.to_string_lossy();
    match parse_major_minor(&text) {
        Some((major, minor)) => makedev(major, minor),
        None => {
            debug!(node, target = %text, "cannot decode major:minor");
            0
        }
    }
}

/// Parse `major:minor`, each number in C `%i` notation.
pub fn parse_major_minor(text: &str) -> Option<(u64, u64)> {
    let (major, rest) = parse_c_int(text)?;
    let rest = rest.strip_prefix(':')?;
    let (minor, _) = parse_c_int(rest)?;
    Some((major as u64, minor as u64))
}

fn parse_c_int(text: &str) -> Option<(i64, &str)> {
    let text = text.trim_start();
    let (negative, text) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let (radix, digits) = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (16, hex)
    } else if text.len() > 1 && text.starts_with('0') {
        (8, &text[1..])
    } else {
        (10, text)
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    if end == 0 {
        // a lone "0" followed by a non-octal digit still reads as zero
        return (radix == 8).then_some((0, digits));
    }
    let value = i64::from_str_radix(&digits[..end], radix).ok()?;
    Some((if negative { -value } else { value }, &digits[end..]))
}

/// Apply device typing to a successful stat of a redirected `/dev/<node>`.
pub fn fixup_stat<S: StatBuf>(buf: &mut S, root: &Path, shadow: &Path, node: &str) {
    if !is_emulated_device(shadow, buf.mode()) {
        return;
    }
    let mode = device_mode(buf.mode());
    buf.set_mode(mode);
    buf.set_rdev(node_rdev(root, node));
    debug!(
        node,
        block = mode & libc::S_IFMT == libc::S_IFBLK,
        "emulated device node"
    );
}
