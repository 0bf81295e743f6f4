// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sections. Each layer holds optional values that merge
//! field by field, and finalizes into a section with defaults applied.

use loom_mesh_conn::DEFAULT_STUN_SERVERS;
use loom_mesh_device::DEFAULT_SOCKET_DIR;
use loom_mesh_epdisc::{DEFAULT_MUX_PORT_MAX, DEFAULT_MUX_PORT_MIN};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

macro_rules! merge_fields {
	($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
		$(
			if $other.$field.is_some() {
				$self.$field = $other.$field;
			}
		)+
	};
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WatcherConfigLayer {
	pub interval_secs: Option<u64>,
	pub interface_filter: Option<String>,
	pub userspace_socket_dir: Option<PathBuf>,
	pub watch_links: Option<bool>,
}

impl WatcherConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_fields!(self, other, interval_secs, interface_filter, userspace_socket_dir, watch_links);
	}

	pub fn finalize(self) -> WatcherConfig {
		let defaults = WatcherConfig::default();
		WatcherConfig {
			interval_secs: self.interval_secs.unwrap_or(defaults.interval_secs),
			interface_filter: self.interface_filter.unwrap_or(defaults.interface_filter),
			userspace_socket_dir: self.userspace_socket_dir.unwrap_or(defaults.userspace_socket_dir),
			watch_links: self.watch_links.unwrap_or(defaults.watch_links),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherConfig {
	pub interval_secs: u64,
	pub interface_filter: String,
	pub userspace_socket_dir: PathBuf,
	pub watch_links: bool,
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			interval_secs: 1,
			interface_filter: ".*".to_string(),
			userspace_socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
			watch_links: true,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalingConfigLayer {
	pub backends: Option<Vec<String>>,
}

impl SignalingConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_fields!(self, other, backends);
	}

	pub fn finalize(self) -> SignalingConfig {
		SignalingConfig {
			backends: self
				.backends
				.filter(|b| !b.is_empty())
				.unwrap_or_else(|| SignalingConfig::default().backends),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalingConfig {
	pub backends: Vec<String>,
}

impl Default for SignalingConfig {
	fn default() -> Self {
		Self {
			backends: vec!["inprocess:".to_string()],
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IceConfigLayer {
	pub stun_servers: Option<Vec<String>>,
	pub host_addresses: Option<Vec<IpAddr>>,
	pub failed_timeout_secs: Option<u64>,
	pub disconnected_timeout_secs: Option<u64>,
	pub keepalive_interval_secs: Option<u64>,
	pub mux_port_min: Option<u16>,
	pub mux_port_max: Option<u16>,
	pub restart_on_disconnect: Option<bool>,
}

impl IceConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_fields!(
			self,
			other,
			stun_servers,
			host_addresses,
			failed_timeout_secs,
			disconnected_timeout_secs,
			keepalive_interval_secs,
			mux_port_min,
			mux_port_max,
			restart_on_disconnect,
		);
	}

	pub fn finalize(self) -> IceConfig {
		let defaults = IceConfig::default();
		IceConfig {
			stun_servers: self.stun_servers.unwrap_or(defaults.stun_servers),
			host_addresses: self.host_addresses.unwrap_or(defaults.host_addresses),
			failed_timeout_secs: self.failed_timeout_secs.unwrap_or(defaults.failed_timeout_secs),
			disconnected_timeout_secs: self
				.disconnected_timeout_secs
				.unwrap_or(defaults.disconnected_timeout_secs),
			keepalive_interval_secs: self.keepalive_interval_secs.unwrap_or(defaults.keepalive_interval_secs),
			mux_port_min: self.mux_port_min.unwrap_or(defaults.mux_port_min),
			mux_port_max: self.mux_port_max.unwrap_or(defaults.mux_port_max),
			restart_on_disconnect: self.restart_on_disconnect.unwrap_or(defaults.restart_on_disconnect),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceConfig {
	pub stun_servers: Vec<String>,
	/// Empty means detect.
	pub host_addresses: Vec<IpAddr>,
	pub failed_timeout_secs: u64,
	pub disconnected_timeout_secs: u64,
	pub keepalive_interval_secs: u64,
	pub mux_port_min: u16,
	pub mux_port_max: u16,
	pub restart_on_disconnect: bool,
}

impl Default for IceConfig {
	fn default() -> Self {
		Self {
			stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
			host_addresses: Vec::new(),
			failed_timeout_secs: 25,
			disconnected_timeout_secs: 5,
			keepalive_interval_secs: 2,
			mux_port_min: DEFAULT_MUX_PORT_MIN,
			mux_port_max: DEFAULT_MUX_PORT_MAX,
			restart_on_disconnect: true,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NatConfigLayer {
	pub enabled: Option<bool>,
	pub nft_binary: Option<String>,
}

impl NatConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_fields!(self, other, enabled, nft_binary);
	}

	pub fn finalize(self) -> NatConfig {
		let defaults = NatConfig::default();
		NatConfig {
			enabled: self.enabled.unwrap_or(defaults.enabled),
			nft_binary: self.nft_binary.unwrap_or(defaults.nft_binary),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NatConfig {
	pub enabled: bool,
	pub nft_binary: String,
}

impl Default for NatConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			nft_binary: "nft".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutocfgConfigLayer {
	pub link_local_addresses: Option<bool>,
}

impl AutocfgConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_fields!(self, other, link_local_addresses);
	}

	pub fn finalize(self) -> AutocfgConfig {
		AutocfgConfig {
			link_local_addresses: self.link_local_addresses.unwrap_or(true),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutocfgConfig {
	pub link_local_addresses: bool,
}

impl Default for AutocfgConfig {
	fn default() -> Self {
		Self {
			link_local_addresses: true,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfigLayer {
	pub level: Option<String>,
	pub json: Option<bool>,
}

impl LoggingConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_fields!(self, other, level, json);
	}

	pub fn finalize(self) -> LoggingConfig {
		LoggingConfig {
			level: self.level.unwrap_or_else(|| "info".to_string()),
			json: self.json.unwrap_or(false),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
	pub level: String,
	pub json: bool,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			json: false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_layers_finalize_to_defaults() {
		assert_eq!(WatcherConfigLayer::default().finalize(), WatcherConfig::default());
		assert_eq!(SignalingConfigLayer::default().finalize(), SignalingConfig::default());
		assert_eq!(IceConfigLayer::default().finalize(), IceConfig::default());
		assert_eq!(NatConfigLayer::default().finalize(), NatConfig::default());
		assert_eq!(AutocfgConfigLayer::default().finalize(), AutocfgConfig::default());
		assert_eq!(LoggingConfigLayer::default().finalize(), LoggingConfig::default());
	}

	#[test]
	fn ice_defaults() {
		let ice = IceConfig::default();
		assert_eq!(ice.failed_timeout_secs, 25);
		assert_eq!(ice.disconnected_timeout_secs, 5);
		assert_eq!(ice.keepalive_interval_secs, 2);
		assert_eq!((ice.mux_port_min, ice.mux_port_max), (51820, 60999));
		assert!(ice.restart_on_disconnect);
		assert!(!ice.stun_servers.is_empty());
	}

	#[test]
	fn merge_keeps_unset_fields() {
		let mut base = IceConfigLayer {
			failed_timeout_secs: Some(30),
			mux_port_min: Some(40000),
			..Default::default()
		};
		base.merge(IceConfigLayer {
			mux_port_min: Some(41000),
			..Default::default()
		});
		assert_eq!(base.failed_timeout_secs, Some(30));
		assert_eq!(base.mux_port_min, Some(41000));
	}

	#[test]
	fn empty_backend_list_falls_back_to_default() {
		let layer = SignalingConfigLayer {
			backends: Some(Vec::new()),
		};
		assert_eq!(layer.finalize().backends, vec!["inprocess:".to_string()]);
	}
}
