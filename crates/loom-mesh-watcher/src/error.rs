// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatcherError {
	#[error("device error: {0}")]
	Device(#[from] loom_mesh_device::DeviceError),

	#[error("invalid interface filter: {0}")]
	InvalidFilter(#[from] regex::Error),

	#[error("notification error: {0}")]
	Notify(#[from] notify::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WatcherError>;
