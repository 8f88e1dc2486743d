// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Linux-specific test utilities for preload injection

use std::path::PathBuf;
use std::process::Command;

/// Variables the preload library reads; cleared so the caller's environment
/// cannot leak into a test.
const DEVBED_VARS: &[&str] = &[
    "DEVBED_DIR",
    "DEVBED_IOCTL_RECORD_DEV",
    "DEVBED_IOCTL_RECORD_FILE",
    "DEVBED_SCRIPT_RECORD_DEV_0",
    "DEVBED_SCRIPT_RECORD_FILE_0",
    "DEVBED_LOG",
];

pub trait CommandExt {
    fn with_preload_libraries(&mut self, libraries: &[PathBuf]) -> &mut Self;
    fn with_clean_devbed_env(&mut self) -> &mut Self;
}

impl CommandExt for Command {
    fn with_preload_libraries(&mut self, libraries: &[PathBuf]) -> &mut Self {
        if !libraries.is_empty() {
            let library_paths =
                libraries.iter().map(|lib| lib.to_string_lossy()).collect::<Vec<_>>().join(":");

            self.env("LD_PRELOAD", &library_paths);
        }
        self
    }

    fn with_clean_devbed_env(&mut self) -> &mut Self {
        for var in DEVBED_VARS {
            self.env_remove(var);
        }
        self
    }
}
