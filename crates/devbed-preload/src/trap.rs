// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Redirection of `/dev` and `/sys` paths into the testbed.

use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use thiserror::Error;
use tracing::trace;

/// Longest shadow path we compose, root and requested path together.
pub const SHADOW_PATH_MAX: usize = libc::PATH_MAX as usize * 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrapError {
    #[error("shadow path for {path} would exceed {limit} bytes")]
    NameTooLong { path: String, limit: usize },
}

fn is_under(path: &[u8], tree: &[u8]) -> bool {
    path.strip_prefix(tree)
        .is_some_and(|rest| rest.is_empty() || rest[0] == b'/')
}

/// Map `path` to its shadow under `root`.
///
/// `Ok(None)` means the caller should use the path as given: no testbed, a
/// path outside `/dev` and `/sys`, a disabled testbed, or a `/dev` node the
/// testbed does not provide.
pub fn trap_path(root: Option<&Path>, path: &CStr) -> Result<Option<CString>, TrapError> {
    let Some(root) = root else {
        return Ok(None);
    };
    let bytes = path.to_bytes();

    let check_exist = if is_under(bytes, b"/dev") {
        true
    } else if is_under(bytes, b"/sys") {
        false
    } else {
        return Ok(None);
    };

    let root = root.as_os_str().as_bytes();
    if root.len() + bytes.len() >= SHADOW_PATH_MAX {
        return Err(TrapError::NameTooLong {
            path: String::from_utf8_lossy(bytes).into_owned(),
            limit: SHADOW_PATH_MAX,
        });
    }

    let mut disabled = root.to_vec();
    disabled.extend_from_slice(b"/disabled");
    if Path::new(OsStr::from_bytes(&disabled)).exists() {
        return Ok(None);
    }

    let mut shadow = root.to_vec();
    shadow.extend_from_slice(bytes);
    if check_exist && !Path::new(OsStr::from_bytes(&shadow)).exists() {
        return Ok(None);
    }

    let Ok(shadow) = CString::new(shadow) else {
        return Ok(None);
    };
    trace!(from = ?path, to = ?shadow, "redirected into testbed");
    Ok(Some(shadow))
}
