// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::stun::StunError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("STUN error: {0}")]
	Stun(#[from] StunError),

	#[error("invalid candidate: {0}")]
	InvalidCandidate(String),

	#[error("ufrag already registered on mux: {0}")]
	UfragInUse(String),

	#[error("remote credentials not set")]
	NoRemoteCredentials,

	#[error("agent closed")]
	Closed,

	#[error("connectivity checks failed")]
	Failed,

	#[error("no port available in range {min}-{max}")]
	NoPortAvailable { min: u16, max: u16 },
}

pub type Result<T> = std::result::Result<T, ConnError>;
