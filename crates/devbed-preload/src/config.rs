// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Environment configuration.
//!
//! `DEVBED_DIR` is looked up on every call so a harness can switch the testbed
//! at runtime. The recording variables are parsed once.

use std::ffi::OsString;
use std::path::PathBuf;
use thiserror::Error;

pub const ENV_DIR: &str = "DEVBED_DIR";
pub const ENV_IOCTL_RECORD_DEV: &str = "DEVBED_IOCTL_RECORD_DEV";
pub const ENV_IOCTL_RECORD_FILE: &str = "DEVBED_IOCTL_RECORD_FILE";
pub const ENV_SCRIPT_RECORD_DEV_PREFIX: &str = "DEVBED_SCRIPT_RECORD_DEV_";
pub const ENV_SCRIPT_RECORD_FILE_PREFIX: &str = "DEVBED_SCRIPT_RECORD_FILE_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("${var} is not a device number: {value:?}")]
    InvalidDevice { var: String, value: String },

    #[error("${var} not set")]
    Missing { var: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlRecordTarget {
    pub device: u64,
    /// Checked when recording actually starts.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    pub device: u64,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordConfig {
    pub ioctl: Option<IoctlRecordTarget>,
    pub scripts: Vec<ScriptTarget>,
}

impl RecordConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var_os(var))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let ioctl = match lookup(ENV_IOCTL_RECORD_DEV) {
            Some(value) => match parse_device(ENV_IOCTL_RECORD_DEV, value)? {
                0 => None,
                device => Some(IoctlRecordTarget {
                    device,
                    file: lookup(ENV_IOCTL_RECORD_FILE).map(PathBuf::from),
                }),
            },
            None => None,
        };

        let mut scripts = Vec::new();
        for idx in 0.. {
            let dev_var = format!("{ENV_SCRIPT_RECORD_DEV_PREFIX}{idx}");
            let Some(value) = lookup(&dev_var) else {
                break;
            };
            let device = parse_device(&dev_var, value)?;
            let file_var = format!("{ENV_SCRIPT_RECORD_FILE_PREFIX}{idx}");
            let file = lookup(&file_var)
                .map(PathBuf::from)
                .ok_or(ConfigError::Missing { var: file_var })?;
            scripts.push(ScriptTarget { device, file });
        }

        Ok(Self { ioctl, scripts })
    }

    pub fn script_file_for(&self, device: u64) -> Option<&PathBuf> {
        self.scripts
            .iter()
            .find(|target| target.device == device)
            .map(|target| &target.file)
    }
}

fn parse_device(var: &str, value: OsString) -> Result<u64, ConfigError> {
    let text = value.to_string_lossy();
    text.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidDevice {
            var: var.to_string(),
            value: text.into_owned(),
        })
}

/// Current testbed root. Unset or empty disables trapping.
pub fn testbed_root() -> Option<PathBuf> {
    std::env::var_os(ENV_DIR)
        .filter(|root| !root.is_empty())
        .map(PathBuf::from)
}
