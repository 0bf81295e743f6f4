// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	#[error("invalid configuration: {0}")]
	Validation(String),
}

#[derive(Debug, Error)]
pub enum DaemonError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error("failed to load private key: {0}")]
	Key(#[from] loom_mesh_common::KeyFileError),

	#[error("signaling: {0}")]
	Signaling(#[from] loom_mesh_signaling::SignalingError),

	#[error("watcher: {0}")]
	Watcher(#[from] loom_mesh_watcher::WatcherError),

	#[error("failed to install tracing subscriber: {0}")]
	Logging(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
