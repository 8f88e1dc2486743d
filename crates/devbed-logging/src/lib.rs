// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging setup for code that runs inside someone else's process.
//!
//! The preload library must not disturb the host's own output, so nothing is
//! installed unless [`LOG_ENV`] is set. Output always goes to stderr.

use std::io;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub use tracing::Level;

/// Filter directive for the library's diagnostics, e.g. `debug` or
/// `devbed_preload=trace`.
pub const LOG_ENV: &str = "DEVBED_LOG";

/// Install a stderr subscriber filtered by `DEVBED_LOG`.
///
/// Returns `Ok(false)` when the variable is unset or empty. An already
/// installed global subscriber is reported as an error by `try_init`; callers
/// in a preload constructor should ignore it.
pub fn init_from_env(component: &str) -> anyhow::Result<bool> {
    match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.trim().is_empty() => {
            init_with_writer(component, &directive, io::stderr)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Build the filter for `directive`, falling back to warnings for `component`
/// when the directive does not parse.
pub fn build_filter(component: &str, directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| {
        let component = component.replace('-', "_");
        EnvFilter::new(format!("{},{}={}", Level::WARN, component, Level::WARN))
    })
}

pub fn init_with_writer<W>(component: &str, directive: &str, writer: W) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = build_filter(component, directive);
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
    #[cfg(debug_assertions)]
    let layer = layer.with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(layer).try_init()?;
    Ok(())
}
