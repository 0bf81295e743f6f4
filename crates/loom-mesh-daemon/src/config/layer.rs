// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use super::sections::{
	AutocfgConfigLayer, IceConfigLayer, LoggingConfigLayer, NatConfigLayer, SignalingConfigLayer,
	WatcherConfigLayer,
};
use serde::{Deserialize, Serialize};

/// One source's view of the configuration. Absent sections and fields
/// leave lower layers untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MeshConfigLayer {
	pub watcher: Option<WatcherConfigLayer>,
	pub signaling: Option<SignalingConfigLayer>,
	pub ice: Option<IceConfigLayer>,
	pub nat: Option<NatConfigLayer>,
	pub autocfg: Option<AutocfgConfigLayer>,
	pub logging: Option<LoggingConfigLayer>,
}

fn merge_section<T>(base: &mut Option<T>, other: Option<T>, merge: impl FnOnce(&mut T, T)) {
	match (base.as_mut(), other) {
		(Some(base), Some(other)) => merge(base, other),
		(None, Some(other)) => *base = Some(other),
		(_, None) => {}
	}
}

impl MeshConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_section(&mut self.watcher, other.watcher, WatcherConfigLayer::merge);
		merge_section(&mut self.signaling, other.signaling, SignalingConfigLayer::merge);
		merge_section(&mut self.ice, other.ice, IceConfigLayer::merge);
		merge_section(&mut self.nat, other.nat, NatConfigLayer::merge);
		merge_section(&mut self.autocfg, other.autocfg, AutocfgConfigLayer::merge);
		merge_section(&mut self.logging, other.logging, LoggingConfigLayer::merge);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_partial_toml() {
		let layer: MeshConfigLayer = toml::from_str(
			r#"
			[ice]
			stun_servers = ["stun.example.com:3478"]
			mux_port_min = 40000

			[logging]
			json = true
			"#,
		)
		.unwrap();
		let ice = layer.ice.unwrap();
		assert_eq!(ice.stun_servers, Some(vec!["stun.example.com:3478".to_string()]));
		assert_eq!(ice.mux_port_min, Some(40000));
		assert_eq!(ice.mux_port_max, None);
		assert_eq!(layer.logging.unwrap().json, Some(true));
		assert!(layer.watcher.is_none());
	}

	#[test]
	fn unknown_section_is_rejected() {
		assert!(toml::from_str::<MeshConfigLayer>("[server]\nport = 1\n").is_err());
	}

	#[test]
	fn later_layer_wins_per_field() {
		let mut base = MeshConfigLayer {
			logging: Some(LoggingConfigLayer {
				level: Some("debug".to_string()),
				json: Some(false),
			}),
			..Default::default()
		};
		base.merge(MeshConfigLayer {
			logging: Some(LoggingConfigLayer {
				level: None,
				json: Some(true),
			}),
			nat: Some(NatConfigLayer {
				enabled: Some(false),
				nft_binary: None,
			}),
			..Default::default()
		});

		let logging = base.logging.unwrap();
		assert_eq!(logging.level.as_deref(), Some("debug"));
		assert_eq!(logging.json, Some(true));
		assert_eq!(base.nat.unwrap().enabled, Some(false));
	}
}
