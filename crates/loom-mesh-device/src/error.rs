// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
	#[error("device not found: {0}")]
	NotFound(String),

	#[error("{command} failed: {stderr}")]
	Command { command: String, stderr: String },

	#[error("failed to parse {what}: {detail}")]
	Parse { what: &'static str, detail: String },

	#[error("invalid key: {0}")]
	Key(#[from] loom_mesh_common::KeyError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("device already exists: {0}")]
	AlreadyExists(String),
}

impl DeviceError {
	pub(crate) fn parse(what: &'static str, detail: impl Into<String>) -> Self {
		DeviceError::Parse {
			what,
			detail: detail.into(),
		}
	}
}

pub type Result<T> = std::result::Result<T, DeviceError>;
