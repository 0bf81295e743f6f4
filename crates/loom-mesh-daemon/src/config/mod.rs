// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered daemon configuration.
//!
//! Precedence (highest to lowest):
//! 1. Command line flags
//! 2. Environment variables (`LOOM_MESH_*`)
//! 3. Config file (`/etc/loom/mesh.toml` or `--config`)
//! 4. Built-in defaults

pub mod layer;
pub mod sections;
pub mod sources;

pub use layer::MeshConfigLayer;
pub use sections::*;
pub use sources::{ConfigSource, DefaultsSource, EnvSource, LayerSource, Precedence, TomlSource, SYSTEM_CONFIG_PATH};

use crate::error::ConfigError;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshConfig {
	pub watcher: WatcherConfig,
	pub signaling: SignalingConfig,
	pub ice: IceConfig,
	pub nat: NatConfig,
	pub autocfg: AutocfgConfig,
	pub logging: LoggingConfig,
}

/// Loads every source, with `config_path` replacing the system file.
pub fn load_config(config_path: Option<PathBuf>, overrides: MeshConfigLayer) -> Result<MeshConfig, ConfigError> {
	let toml = match config_path {
		Some(path) => TomlSource::new(path),
		None => TomlSource::system(),
	};
	let sources: Vec<Box<dyn ConfigSource>> = vec![
		Box::new(DefaultsSource),
		Box::new(toml),
		Box::new(EnvSource),
		Box::new(LayerSource(overrides)),
	];
	load_from_sources(sources)
}

pub fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<MeshConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = MeshConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}
	finalize(merged)
}

fn finalize(layer: MeshConfigLayer) -> Result<MeshConfig, ConfigError> {
	let config = MeshConfig {
		watcher: layer.watcher.unwrap_or_default().finalize(),
		signaling: layer.signaling.unwrap_or_default().finalize(),
		ice: layer.ice.unwrap_or_default().finalize(),
		nat: layer.nat.unwrap_or_default().finalize(),
		autocfg: layer.autocfg.unwrap_or_default().finalize(),
		logging: layer.logging.unwrap_or_default().finalize(),
	};
	validate(&config)?;

	info!(
		interface_filter = %config.watcher.interface_filter,
		backends = ?config.signaling.backends,
		stun_servers = config.ice.stun_servers.len(),
		nat = config.nat.enabled,
		"configuration loaded"
	);
	Ok(config)
}

fn validate(config: &MeshConfig) -> Result<(), ConfigError> {
	if config.watcher.interval_secs == 0 {
		return Err(ConfigError::Validation("watcher.interval_secs must be positive".to_string()));
	}
	let ice = &config.ice;
	if ice.mux_port_min != 0 && ice.mux_port_min >= ice.mux_port_max {
		return Err(ConfigError::Validation(format!(
			"ice.mux_port_min ({}) must be below ice.mux_port_max ({})",
			ice.mux_port_min, ice.mux_port_max
		)));
	}
	if ice.failed_timeout_secs == 0 || ice.keepalive_interval_secs == 0 {
		return Err(ConfigError::Validation(
			"ice timeouts and keepalive interval must be positive".to_string(),
		));
	}
	if ice.disconnected_timeout_secs >= ice.failed_timeout_secs {
		return Err(ConfigError::Validation(
			"ice.disconnected_timeout_secs must be below ice.failed_timeout_secs".to_string(),
		));
	}
	Ok(())
}
