// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};

use crate::domain::config::{LogFormat, LoggingSettings};

/// Initialize the tracing subscriber. `RUST_LOG` wins over the configured
/// level. Calling this twice is harmless; the first subscriber stays.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&settings.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let initialized = match settings.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if initialized.is_err() {
        tracing::debug!("Tracing subscriber already installed; keeping it");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let settings = LoggingSettings::default();
        init_logging(&settings).unwrap();
        init_logging(&settings).unwrap();
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        // An explicit RUST_LOG would mask the configured level.
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let settings = LoggingSettings {
            level: "aegis=notalevel".to_string(),
            format: LogFormat::Json,
        };
        assert!(init_logging(&settings).is_err());
    }
}
