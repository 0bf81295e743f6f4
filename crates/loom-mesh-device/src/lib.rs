// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard device access for the loom mesh.
//!
//! Devices are observed as [`InterfaceSnapshot`]s and reconfigured with
//! partial [`DeviceConfig`]s through a [`WireGuardClient`]. The
//! [`diff`] module turns two observations into modifier bitsets.

pub mod bind;
pub mod client;
pub mod config;
pub mod diff;
pub mod error;
pub mod memory;
pub mod modifier;
pub mod snapshot;
pub mod wgtool;

pub use bind::{MemoryBind, UserBind};
pub use client::WireGuardClient;
pub use config::{DeviceConfig, PeerConfig};
pub use diff::{diff_interfaces, diff_peers, interface_modifier, peer_diff, PeerDiff, SetDiff};
pub use error::{DeviceError, Result};
pub use memory::MemoryWireGuard;
pub use modifier::{InterfaceModifier, PeerModifier};
pub use snapshot::{InterfaceSnapshot, InterfaceType, PeerSnapshot, PresharedKey};
pub use wgtool::{WgToolClient, DEFAULT_SOCKET_DIR};
