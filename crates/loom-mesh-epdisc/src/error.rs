// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_mesh_common::WgPublicKey;
use loom_mesh_conn::ConnError;
use loom_mesh_device::DeviceError;
use loom_mesh_nat::NatError;
use loom_mesh_signaling::SignalingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpdiscError {
	#[error("failed to subscribe to signaling: {0}")]
	Subscribe(#[source] SignalingError),

	#[error("failed to set up proxy: {0}")]
	ProxyInit(String),

	#[error("failed to create ICE agent: {0}")]
	AgentCreate(#[source] ConnError),

	#[error("failed to configure device: {0}")]
	ConfigureDevice(#[source] DeviceError),

	#[error("signaling error: {0}")]
	Signaling(#[from] SignalingError),

	#[error("ICE error: {0}")]
	Conn(#[from] ConnError),

	#[error("device error: {0}")]
	Device(#[from] DeviceError),

	#[error("NAT error: {0}")]
	Nat(#[from] NatError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("no selected candidate pair")]
	NoSelectedPair,

	#[error("unknown interface: {0}")]
	InterfaceNotFound(String),

	#[error("unknown peer: {0}")]
	PeerNotFound(WgPublicKey),

	#[error("engine closed")]
	Closed,
}

pub type Result<T> = std::result::Result<T, EpdiscError>;
