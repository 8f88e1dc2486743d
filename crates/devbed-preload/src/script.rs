// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Timed read/write trace of selected devices.
//!
//! Each record is `<r|w> <ms since previous op> <escaped bytes>`. Consecutive
//! operations of the same kind with no measurable gap extend the current
//! record instead of starting a new line.
//!
//! Gaps are differences of whole-millisecond monotonic timestamps, so two
//! operations on either side of a millisecond boundary are 1 ms apart even
//! when less than a millisecond passed between them.

use crate::fd_table::{lock, release, FdTable, FdTableError};
use nix::time::{clock_gettime, ClockId};
use once_cell::sync::Lazy;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOp {
    Read,
    Write,
}

impl ScriptOp {
    fn tag(self) -> char {
        match self {
            ScriptOp::Read => 'r',
            ScriptOp::Write => 'w',
        }
    }
}

/// Caret notation: control bytes become `^` + (byte + 64), `^` doubles.
pub fn escape_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        if byte < 32 {
            out.push(b'^');
            out.push(byte + 64);
            continue;
        }
        if byte == b'^' {
            out.push(b'^');
        }
        out.push(byte);
    }
}

/// Current `CLOCK_MONOTONIC` time in whole milliseconds.
pub fn monotonic_ms() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000)
        .unwrap_or(0)
}

pub struct ScriptRecorder<W: Write> {
    out: W,
    last_ms: u64,
    last_op: Option<ScriptOp>,
}

impl<W: Write> ScriptRecorder<W> {
    pub fn new(out: W, now_ms: u64) -> Self {
        Self {
            out,
            last_ms: now_ms,
            last_op: None,
        }
    }

    pub fn record(&mut self, op: ScriptOp, bytes: &[u8], now_ms: u64) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let delta = now_ms.saturating_sub(self.last_ms);
        self.last_ms = now_ms;

        let mut chunk = Vec::with_capacity(bytes.len() * 2 + 16);
        if delta > 0 || self.last_op != Some(op) {
            if self.last_op.is_some() {
                chunk.push(b'\n');
            }
            chunk.extend_from_slice(format!("{} {} ", op.tag(), delta).as_bytes());
        }
        escape_into(bytes, &mut chunk);
        self.last_op = Some(op);

        self.out.write_all(&chunk)?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to open script record file {}: {source}", path.display())]
    Open { path: std::path::PathBuf, source: io::Error },

    #[error(transparent)]
    Table(#[from] FdTableError),
}

static SCRIPT_RECORDERS: Lazy<Mutex<FdTable<ScriptRecorder<File>>>> =
    Lazy::new(|| Mutex::new(FdTable::new()));

/// Start recording `fd` into `path`, truncating any previous trace.
pub fn record_open(fd: RawFd, path: &Path) -> Result<(), ScriptError> {
    let file = File::create(path).map_err(|source| ScriptError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut recorders = lock(&SCRIPT_RECORDERS);
    recorders.take_stale(fd);
    recorders.add(fd, ScriptRecorder::new(file, monotonic_ms()))?;
    debug!(fd, path = %path.display(), "recording script");
    Ok(())
}

/// Append an operation on `fd` if it is being recorded.
pub fn record_op(fd: RawFd, op: ScriptOp, bytes: &[u8]) {
    let mut recorders = lock(&SCRIPT_RECORDERS);
    let Some(recorder) = recorders.get_mut(fd) else {
        return;
    };
    if let Err(err) = recorder.record(op, bytes, monotonic_ms()) {
        warn!(fd, %err, "failed to write script record");
    }
}

/// Stop recording `fd`; the trace file is closed.
pub fn forget(fd: RawFd) -> Result<bool, FdTableError> {
    let stopped = release(&SCRIPT_RECORDERS, fd)?.is_some();
    if stopped {
        debug!(fd, "stopped recording script");
    }
    Ok(stopped)
}

pub fn forget_stale(fd: RawFd) {
    lock(&SCRIPT_RECORDERS).take_stale(fd);
}
