// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ioctl record/replay tree.
//!
//! A tree is an ordered list of observed `(request, result, argument bytes)`
//! nodes. Replay walks the list from a per-descriptor cursor, so a dialogue of
//! repeated requests with changing answers plays back in order.
//!
//! On disk, one node per line:
//!
//! ```text
//! # devbed ioctl tree
//! 0x80045430 0 05000000
//! ```

use std::ffi::c_void;
use std::io::{self, BufRead, Write};
use thiserror::Error;

/// `_IOC` direction bit: userspace writes the argument.
pub const IOC_WRITE: u32 = 1;
/// `_IOC` direction bit: the kernel fills the argument.
pub const IOC_READ: u32 = 2;

const IOC_SIZESHIFT: u64 = 16;
const IOC_SIZEMASK: u64 = (1 << 14) - 1;
const IOC_DIRSHIFT: u64 = 30;
const IOC_DIRMASK: u64 = (1 << 2) - 1;

const HEADER: &str = "# devbed ioctl tree";

pub fn ioc_dir(request: u64) -> u32 {
    ((request >> IOC_DIRSHIFT) & IOC_DIRMASK) as u32
}

pub fn ioc_size(request: u64) -> usize {
    ((request >> IOC_SIZESHIFT) & IOC_SIZEMASK) as usize
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlNode {
    pub request: u64,
    pub result: i32,
    /// Argument bytes after the call, or the little-endian integer value for
    /// requests that carry no size.
    pub data: Vec<u8>,
}

impl IoctlNode {
    /// Capture a completed ioctl call.
    ///
    /// Returns `None` when the request carries a size but `arg` is null.
    ///
    /// # Safety
    ///
    /// For requests with a non-zero `_IOC` size, a non-null `arg` must point to
    /// at least that many readable bytes.
    pub unsafe fn new_from_binary(request: u64, arg: *const c_void, result: i32) -> Option<Self> {
        let size = ioc_size(request);
        let data = if size == 0 {
            (arg as usize).to_le_bytes().to_vec()
        } else if arg.is_null() {
            return None;
        } else {
            std::slice::from_raw_parts(arg as *const u8, size).to_vec()
        };
        Some(Self {
            request,
            result,
            data,
        })
    }

    fn parse(line_no: usize, line: &str) -> Result<Self, TreeError> {
        let parse_err = |reason: String| TreeError::Parse {
            line: line_no,
            reason,
        };

        let mut fields = line.split_whitespace();
        let request = fields
            .next()
            .ok_or_else(|| parse_err("missing request".into()))?;
        let request = request
            .strip_prefix("0x")
            .ok_or_else(|| parse_err(format!("request {request:?} lacks 0x prefix")))
            .and_then(|hex| {
                u64::from_str_radix(hex, 16)
                    .map_err(|e| parse_err(format!("bad request {request:?}: {e}")))
            })?;
        let result = fields
            .next()
            .ok_or_else(|| parse_err("missing result".into()))?;
        let result: i32 = result
            .parse()
            .map_err(|e| parse_err(format!("bad result {result:?}: {e}")))?;
        let data = fields
            .next()
            .ok_or_else(|| parse_err("missing data".into()))?;
        let data = hex::decode(data).map_err(|e| parse_err(format!("bad data: {e}")))?;
        if let Some(extra) = fields.next() {
            return Err(parse_err(format!("unexpected trailing field {extra:?}")));
        }

        let expected = match ioc_size(request) {
            0 => std::mem::size_of::<usize>(),
            size => size,
        };
        if data.len() != expected {
            return Err(parse_err(format!(
                "request 0x{request:x} expects {expected} data bytes, found {}",
                data.len()
            )));
        }

        Ok(Self {
            request,
            result,
            data,
        })
    }

    /// # Safety
    ///
    /// See [`IoctlTree::execute`].
    unsafe fn matches(&self, request: u64, arg: *mut c_void) -> bool {
        if self.request != request {
            return false;
        }
        let size = ioc_size(request);
        if size == 0 {
            return self.data == (arg as usize).to_le_bytes();
        }
        if arg.is_null() {
            return false;
        }
        if ioc_dir(request) & IOC_READ != 0 {
            return true;
        }
        std::slice::from_raw_parts(arg as *const u8, size) == self.data.as_slice()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoctlTree {
    nodes: Vec<IoctlNode>,
}

impl IoctlTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a tree. Input without any node yields `Ok(None)`.
    pub fn read<R: BufRead>(reader: R) -> Result<Option<Self>, TreeError> {
        let mut nodes = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            nodes.push(IoctlNode::parse(idx + 1, line)?);
        }
        if nodes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Self { nodes }))
        }
    }

    pub fn write<W: Write>(&self, mut out: W) -> Result<(), TreeError> {
        writeln!(out, "{HEADER}")?;
        for node in &self.nodes {
            writeln!(
                out,
                "0x{:x} {} {}",
                node.request,
                node.result,
                hex::encode(&node.data)
            )?;
        }
        out.flush()?;
        Ok(())
    }

    /// Add `node` unless an identical node is already present. Returns whether
    /// the tree changed.
    pub fn insert(&mut self, node: IoctlNode) -> bool {
        if self.nodes.contains(&node) {
            return false;
        }
        self.nodes.push(node);
        true
    }

    /// Find the next node answering `(request, arg)`, starting after `cursor`
    /// and wrapping around once.
    ///
    /// On a hit, output data of read-direction requests is copied into `arg`
    /// and `(matched index, recorded result)` is returned.
    ///
    /// # Safety
    ///
    /// For requests with a non-zero `_IOC` size, a non-null `arg` must point to
    /// at least that many bytes, writable when the request direction includes
    /// [`IOC_READ`].
    pub unsafe fn execute(
        &self,
        cursor: Option<usize>,
        request: u64,
        arg: *mut c_void,
    ) -> Option<(usize, i32)> {
        let len = self.nodes.len();
        if len == 0 {
            return None;
        }
        let start = cursor.map_or(0, |c| (c + 1) % len);

        for step in 0..len {
            let idx = (start + step) % len;
            let node = &self.nodes[idx];
            if !node.matches(request, arg) {
                continue;
            }
            let size = ioc_size(request);
            if size > 0 && ioc_dir(request) & IOC_READ != 0 {
                std::ptr::copy_nonoverlapping(node.data.as_ptr(), arg as *mut u8, size);
            }
            return Some((idx, node.result));
        }
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
