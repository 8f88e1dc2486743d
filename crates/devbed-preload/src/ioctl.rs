// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ioctl replay for testbed device nodes and recording for a real device.

use crate::config::IoctlRecordTarget;
use crate::fd_table::{lock, release, FdTable, FdTableError};
use devbed_ioctl_tree::{IoctlNode, IoctlTree, TreeError};
use libc::{c_int, c_ulong, c_void};
use once_cell::sync::Lazy;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum IoctlError {
    #[error("failed to load ioctl record file {}: {reason}", path.display())]
    InvalidReplay { path: PathBuf, reason: String },

    #[error("$DEVBED_IOCTL_RECORD_FILE not set")]
    RecordFileUnset,

    #[error("$DEVBED_DIR cannot be used while recording")]
    RecordWithTestbed,

    #[error("failed to open ioctl record file {}: {source}", path.display())]
    RecordFile { path: PathBuf, source: io::Error },

    #[error("ioctl record file {}: {source}", path.display())]
    RecordTree { path: PathBuf, source: TreeError },

    #[error(transparent)]
    Table(#[from] FdTableError),
}

/// Replay state of one descriptor opened on a testbed node.
#[derive(Debug, Default)]
pub struct IoctlFdState {
    tree: Option<IoctlTree>,
    cursor: Option<usize>,
}

impl IoctlFdState {
    /// Load the replay file at `path`. A missing file means no replay; an
    /// empty or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, IoctlError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                trace!(path = %path.display(), %err, "no ioctl replay file");
                return Ok(Self::default());
            }
        };
        let invalid = |reason: String| IoctlError::InvalidReplay {
            path: path.to_path_buf(),
            reason,
        };
        match IoctlTree::read(BufReader::new(file)) {
            Ok(Some(tree)) => {
                debug!(path = %path.display(), nodes = tree.len(), "loaded ioctl tree");
                Ok(Self {
                    tree: Some(tree),
                    cursor: None,
                })
            }
            Ok(None) => Err(invalid("empty or invalid format".into())),
            Err(err) => Err(invalid(err.to_string())),
        }
    }

    pub fn has_tree(&self) -> bool {
        self.tree.is_some()
    }

    /// Answer `request` from the tree, advancing the cursor on a hit.
    ///
    /// # Safety
    ///
    /// `arg` must satisfy the contract of [`IoctlTree::execute`].
    pub unsafe fn emulate(&mut self, request: c_ulong, arg: *mut c_void) -> Option<c_int> {
        let tree = self.tree.as_ref()?;
        let (idx, result) = tree.execute(self.cursor, request as u64, arg)?;
        self.cursor = Some(idx);
        Some(result)
    }
}

static IOCTL_FDS: Lazy<Mutex<FdTable<IoctlFdState>>> = Lazy::new(|| Mutex::new(FdTable::new()));

/// `<root>/ioctl/dev/...` for a device path `/dev/...`.
pub fn replay_file_path(root: &Path, dev_path: &Path) -> PathBuf {
    let mut path = root.join("ioctl").into_os_string();
    path.push(dev_path.as_os_str());
    PathBuf::from(path)
}

/// Start tracking a descriptor opened on a redirected `/dev` path.
pub fn wrap_open(fd: RawFd, root: &Path, dev_path: &Path) -> Result<(), IoctlError> {
    let state = IoctlFdState::load(&replay_file_path(root, dev_path))?;
    let mut fds = lock(&IOCTL_FDS);
    fds.take_stale(fd);
    fds.add(fd, state)?;
    Ok(())
}

/// `None` when the descriptor has nothing to replay for `request`.
///
/// # Safety
///
/// See [`IoctlFdState::emulate`].
pub unsafe fn emulate(fd: RawFd, request: c_ulong, arg: *mut c_void) -> Option<c_int> {
    let mut fds = lock(&IOCTL_FDS);
    let state = fds.get_mut(fd)?;
    let result = state.emulate(request, arg);
    match result {
        Some(result) => trace!(fd, request = format_args!("0x{request:x}"), result, "ioctl replayed"),
        None if state.has_tree() => {
            trace!(fd, request = format_args!("0x{request:x}"), "ioctl not in tree")
        }
        None => {}
    }
    result
}

/// Drop the replay state of a closing descriptor. Returns whether it had any.
pub fn forget(fd: RawFd) -> Result<bool, FdTableError> {
    Ok(release(&IOCTL_FDS, fd)?.is_some())
}

pub fn forget_stale(fd: RawFd) {
    lock(&IOCTL_FDS).take_stale(fd);
}

/// Process-wide ioctl recording of one device.
#[derive(Debug, Default)]
pub struct RecordSession {
    fd: Option<RawFd>,
    output: Option<(PathBuf, File)>,
    tree: Option<IoctlTree>,
}

impl RecordSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fd` the recorded descriptor, opening the record file and loading
    /// what it already holds on first activation.
    pub fn activate(
        &mut self,
        fd: RawFd,
        target: &IoctlRecordTarget,
        testbed_active: bool,
    ) -> Result<(), IoctlError> {
        if let Some(previous) = self.fd.filter(|previous| *previous != fd) {
            warn!(previous, fd, "ioctl recording moves to a new descriptor of the same device");
        }
        self.fd = Some(fd);

        if self.output.is_some() {
            return Ok(());
        }
        let path = target.file.clone().ok_or(IoctlError::RecordFileUnset)?;
        if testbed_active {
            return Err(IoctlError::RecordWithTestbed);
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| IoctlError::RecordFile {
                path: path.clone(),
                source,
            })?;
        file.seek(SeekFrom::Start(0))
            .map_err(|source| IoctlError::RecordFile {
                path: path.clone(),
                source,
            })?;
        self.tree = IoctlTree::read(BufReader::new(&file)).map_err(|source| {
            IoctlError::RecordTree {
                path: path.clone(),
                source,
            }
        })?;
        info!(fd, path = %path.display(), "recording ioctls");
        self.output = Some((path, file));
        Ok(())
    }

    /// Add a completed real ioctl on the recorded descriptor.
    ///
    /// # Safety
    ///
    /// `arg` must satisfy the contract of [`IoctlNode::new_from_binary`].
    pub unsafe fn record(&mut self, fd: RawFd, request: c_ulong, arg: *const c_void, result: c_int) {
        if self.fd != Some(fd) {
            return;
        }
        let Some(node) = IoctlNode::new_from_binary(request as u64, arg, result) else {
            return;
        };
        if self.tree.get_or_insert_with(IoctlTree::new).insert(node) {
            trace!(fd, request = format_args!("0x{request:x}"), result, "recorded ioctl");
        }
    }

    /// Stop recording if `fd` is the recorded descriptor and rewrite the record
    /// file from the in-memory tree. Returns whether `fd` was being recorded.
    pub fn close(&mut self, fd: RawFd) -> Result<bool, IoctlError> {
        if self.fd != Some(fd) {
            return Ok(false);
        }
        self.fd = None;
        if let (Some(tree), Some((path, file))) = (&self.tree, &self.output) {
            let tree_err = |source: TreeError| IoctlError::RecordTree {
                path: path.clone(),
                source,
            };
            file.set_len(0).map_err(|e| tree_err(e.into()))?;
            tree.write(file).map_err(tree_err)?;
            debug!(fd, path = %path.display(), nodes = tree.len(), "wrote ioctl record");
        }
        Ok(true)
    }
}

static RECORD_SESSION: Lazy<Mutex<RecordSession>> = Lazy::new(|| Mutex::new(RecordSession::new()));

pub fn record_open(
    fd: RawFd,
    device: u64,
    target: &IoctlRecordTarget,
    testbed_active: bool,
) -> Result<(), IoctlError> {
    if device != target.device {
        return Ok(());
    }
    lock(&RECORD_SESSION).activate(fd, target, testbed_active)
}

/// # Safety
///
/// See [`RecordSession::record`].
pub unsafe fn record_ioctl(fd: RawFd, request: c_ulong, arg: *const c_void, result: c_int) {
    lock(&RECORD_SESSION).record(fd, request, arg, result);
}

pub fn record_close(fd: RawFd) -> Result<bool, IoctlError> {
    lock(&RECORD_SESSION).close(fd)
}
