// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::snapshot::PresharedKey;
use ipnet::IpNet;
use loom_mesh_common::{WgPrivateKey, WgPublicKey};
use std::net::SocketAddr;

/// Partial reconfiguration of a device. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
	pub private_key: Option<WgPrivateKey>,
	pub listen_port: Option<u16>,
	pub firewall_mark: Option<u32>,
	pub peers: Vec<PeerConfig>,
}

impl DeviceConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_private_key(mut self, key: WgPrivateKey) -> Self {
		self.private_key = Some(key);
		self
	}

	pub fn with_listen_port(mut self, port: u16) -> Self {
		self.listen_port = Some(port);
		self
	}

	pub fn with_firewall_mark(mut self, mark: u32) -> Self {
		self.firewall_mark = Some(mark);
		self
	}

	pub fn with_peer(mut self, peer: PeerConfig) -> Self {
		self.peers.push(peer);
		self
	}
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
	pub public_key: WgPublicKey,
	pub remove: bool,
	/// Only touch the peer if it already exists.
	pub update_only: bool,
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Option<Vec<IpNet>>,
	pub replace_allowed_ips: bool,
	pub persistent_keepalive: Option<u16>,
	pub preshared_key: Option<PresharedKey>,
}

impl PeerConfig {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			remove: false,
			update_only: false,
			endpoint: None,
			allowed_ips: None,
			replace_allowed_ips: false,
			persistent_keepalive: None,
			preshared_key: None,
		}
	}

	pub fn remove(public_key: WgPublicKey) -> Self {
		Self {
			remove: true,
			..Self::new(public_key)
		}
	}

	pub fn update_only(mut self) -> Self {
		self.update_only = true;
		self
	}

	pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
		self.endpoint = Some(endpoint);
		self
	}

	pub fn with_allowed_ips(mut self, allowed_ips: Vec<IpNet>, replace: bool) -> Self {
		self.allowed_ips = Some(allowed_ips);
		self.replace_allowed_ips = replace;
		self
	}

	pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
		self.persistent_keepalive = Some(seconds);
		self
	}

	pub fn with_preshared_key(mut self, key: PresharedKey) -> Self {
		self.preshared_key = Some(key);
		self
	}
}
