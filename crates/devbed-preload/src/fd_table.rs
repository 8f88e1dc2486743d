// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-descriptor state tables.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::warn;

/// Entry limit of the process-wide tables. Larger than the classic 50 slots so
/// busy hosts do not abort; tests build 50-slot tables with [`FdTable::with_limit`].
pub const TRACKED_FD_LIMIT: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FdTableError {
    #[error("descriptor table full ({limit} entries), cannot track fd {fd}")]
    Full { fd: RawFd, limit: usize },

    #[error("fd {fd} is already tracked")]
    AlreadyTracked { fd: RawFd },

    #[error("fd {fd} is not tracked")]
    NotTracked { fd: RawFd },
}

/// Bounded map from an open descriptor to the state kept for it.
#[derive(Debug)]
pub struct FdTable<T> {
    entries: HashMap<RawFd, T>,
    limit: usize,
}

impl<T> FdTable<T> {
    pub fn new() -> Self {
        Self::with_limit(TRACKED_FD_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            limit,
        }
    }

    pub fn add(&mut self, fd: RawFd, payload: T) -> Result<(), FdTableError> {
        if self.entries.contains_key(&fd) {
            return Err(FdTableError::AlreadyTracked { fd });
        }
        if self.entries.len() >= self.limit {
            return Err(FdTableError::Full {
                fd,
                limit: self.limit,
            });
        }
        self.entries.insert(fd, payload);
        Ok(())
    }

    /// Remove `fd`, handing its payload back to the caller.
    pub fn remove(&mut self, fd: RawFd) -> Result<T, FdTableError> {
        self.entries.remove(&fd).ok_or(FdTableError::NotTracked { fd })
    }

    /// Drop the entry of a descriptor number the OS just handed out again.
    /// The previous descriptor was closed without passing through `close`.
    pub fn take_stale(&mut self, fd: RawFd) -> Option<T> {
        let stale = self.entries.remove(&fd);
        if stale.is_some() {
            warn!(fd, "dropping state of a descriptor closed behind our back");
        }
        stale
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut T> {
        self.entries.get_mut(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for FdTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a table, recovering it if a panicking hook poisoned the mutex.
pub fn lock<T>(table: &Mutex<T>) -> MutexGuard<'_, T> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove the entry of a descriptor that is being closed, if it is tracked.
pub fn release<T>(table: &Mutex<FdTable<T>>, fd: RawFd) -> Result<Option<T>, FdTableError> {
    let mut table = lock(table);
    if !table.contains(fd) {
        return Ok(None);
    }
    table.remove(fd).map(Some)
}
