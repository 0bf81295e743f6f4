// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::LoggingConfig;
use crate::error::{DaemonError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` takes priority over the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
	EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
	let registry = tracing_subscriber::registry().with(env_filter(config));

	// The two formats produce different layer types.
	let result = if config.json {
		registry
			.with(fmt::layer().with_writer(std::io::stdout).json().with_current_span(true))
			.try_init()
	} else {
		registry
			.with(fmt::layer().with_writer(std::io::stdout).with_target(false).compact())
			.try_init()
	};
	result.map_err(|e| DaemonError::Logging(e.to_string()))
}
