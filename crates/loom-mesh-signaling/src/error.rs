// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_mesh_common::WgPublicKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
	/// No subscription exists for the envelope recipient.
	#[error("not subscribed to {0}")]
	NotSubscribed(WgPublicKey),

	#[error("failed to decrypt envelope from {0}")]
	DecryptFailed(WgPublicKey),

	#[error("failed to encrypt message")]
	EncryptFailed,

	#[error("invalid envelope: {0}")]
	InvalidEnvelope(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("transport failed: {0}")]
	Transport(String),

	#[error("publish deadline exceeded")]
	Timeout,

	#[error("backend closed")]
	Closed,

	#[error("unsupported signaling backend `{0}`: only `inprocess:` is built in, there is no cross-host transport")]
	UnknownBackend(String),

	#[error("no signaling backend configured")]
	NoBackend,
}

pub type Result<T> = std::result::Result<T, SignalingError>;
