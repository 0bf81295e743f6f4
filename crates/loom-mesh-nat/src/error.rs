// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NatError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("command `{command}` failed: {stderr}")]
	Command { command: String, stderr: String },

	#[error("failed to install rule: {0}")]
	RuleInstall(String),

	#[error("no such table: {0}")]
	TableNotFound(String),

	#[error("no rule with handle {0}")]
	RuleNotFound(u64),
}

pub type Result<T> = std::result::Result<T, NatError>;
