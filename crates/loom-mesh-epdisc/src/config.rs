// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_mesh_conn::IceConfig;
use std::net::{IpAddr, Ipv4Addr};

/// First port tried for the host candidate mux.
pub const DEFAULT_MUX_PORT_MIN: u16 = 51820;

/// Last port tried for either mux.
pub const DEFAULT_MUX_PORT_MAX: u16 = 60999;

#[derive(Debug, Clone)]
pub struct EndpointDiscoveryConfig {
	pub ice: IceConfig,
	/// Restart the ICE session on `Disconnected` as well as on `Failed`.
	pub restart_on_disconnect: bool,
	/// Port range for the muxes. A zero minimum binds ephemeral ports.
	pub mux_port_min: u16,
	pub mux_port_max: u16,
	pub mux_bind_address: IpAddr,
}

impl EndpointDiscoveryConfig {
	pub fn new(ice: IceConfig) -> Self {
		Self {
			ice,
			restart_on_disconnect: true,
			mux_port_min: DEFAULT_MUX_PORT_MIN,
			mux_port_max: DEFAULT_MUX_PORT_MAX,
			mux_bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
		}
	}

	pub fn with_restart_on_disconnect(mut self, restart: bool) -> Self {
		self.restart_on_disconnect = restart;
		self
	}

	pub fn with_mux_ports(mut self, min: u16, max: u16) -> Self {
		self.mux_port_min = min;
		self.mux_port_max = max.max(min);
		self
	}

	pub fn with_mux_bind_address(mut self, addr: IpAddr) -> Self {
		self.mux_bind_address = addr;
		self
	}
}

impl Default for EndpointDiscoveryConfig {
	fn default() -> Self {
		Self::new(IceConfig::default())
	}
}
