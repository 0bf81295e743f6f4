// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: defaults, a TOML file, environment variables and
//! command line overrides.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, trace};

use super::layer::MeshConfigLayer;
use super::sections::{
	AutocfgConfigLayer, IceConfigLayer, LoggingConfigLayer, NatConfigLayer, SignalingConfigLayer,
	WatcherConfigLayer,
};
use crate::error::ConfigError;

pub const SYSTEM_CONFIG_PATH: &str = "/etc/loom/mesh.toml";

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
	CommandLine = 60,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<MeshConfigLayer, ConfigError>;
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<MeshConfigLayer, ConfigError> {
		Ok(MeshConfigLayer::default())
	}
}

/// A TOML file. A missing file contributes nothing.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new(SYSTEM_CONFIG_PATH)
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<MeshConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(MeshConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;
		let layer = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
			path: self.path.clone(),
			source: e,
		})?;
		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variables.
///
/// Convention: LOOM_MESH_<SECTION>_<FIELD>. Lists are comma separated.
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<MeshConfigLayer, ConfigError> {
		debug!("loading environment variables");
		layer_from_env(|name| std::env::var(name).ok())
	}
}

/// Overrides already collected into a layer, such as command line flags.
pub struct LayerSource(pub MeshConfigLayer);

impl ConfigSource for LayerSource {
	fn name(&self) -> &'static str {
		"command-line"
	}

	fn precedence(&self) -> Precedence {
		Precedence::CommandLine
	}

	fn load(&self) -> Result<MeshConfigLayer, ConfigError> {
		Ok(self.0.clone())
	}
}

struct Env<F> {
	lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
	fn var(&self, name: &str) -> Option<String> {
		(self.lookup)(name).filter(|s| !s.is_empty())
	}

	fn bool(&self, name: &str) -> Option<bool> {
		self.var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
	}

	fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
		match self.var(name) {
			Some(v) => v.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
				key: name.to_string(),
				message: format!("cannot parse '{v}'"),
			}),
			None => Ok(None),
		}
	}

	fn list(&self, name: &str) -> Option<Vec<String>> {
		self.var(name).map(|v| {
			v.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(str::to_string)
				.collect()
		})
	}

	fn parsed_list<T: FromStr>(&self, name: &str) -> Result<Option<Vec<T>>, ConfigError> {
		let Some(items) = self.list(name) else {
			return Ok(None);
		};
		items
			.iter()
			.map(|item| {
				item.parse().map_err(|_| ConfigError::InvalidValue {
					key: name.to_string(),
					message: format!("cannot parse '{item}'"),
				})
			})
			.collect::<Result<Vec<T>, _>>()
			.map(Some)
	}
}

pub(crate) fn layer_from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<MeshConfigLayer, ConfigError> {
	let env = Env { lookup };
	Ok(MeshConfigLayer {
		watcher: Some(WatcherConfigLayer {
			interval_secs: env.parse("LOOM_MESH_WATCHER_INTERVAL_SECS")?,
			interface_filter: env.var("LOOM_MESH_WATCHER_INTERFACE_FILTER"),
			userspace_socket_dir: env.var("LOOM_MESH_WATCHER_USERSPACE_SOCKET_DIR").map(PathBuf::from),
			watch_links: env.bool("LOOM_MESH_WATCHER_WATCH_LINKS"),
		}),
		signaling: Some(SignalingConfigLayer {
			backends: env.list("LOOM_MESH_SIGNALING_BACKENDS"),
		}),
		ice: Some(IceConfigLayer {
			stun_servers: env.list("LOOM_MESH_ICE_STUN_SERVERS"),
			host_addresses: env.parsed_list("LOOM_MESH_ICE_HOST_ADDRESSES")?,
			failed_timeout_secs: env.parse("LOOM_MESH_ICE_FAILED_TIMEOUT_SECS")?,
			disconnected_timeout_secs: env.parse("LOOM_MESH_ICE_DISCONNECTED_TIMEOUT_SECS")?,
			keepalive_interval_secs: env.parse("LOOM_MESH_ICE_KEEPALIVE_INTERVAL_SECS")?,
			mux_port_min: env.parse("LOOM_MESH_ICE_MUX_PORT_MIN")?,
			mux_port_max: env.parse("LOOM_MESH_ICE_MUX_PORT_MAX")?,
			restart_on_disconnect: env.bool("LOOM_MESH_ICE_RESTART_ON_DISCONNECT"),
		}),
		nat: Some(NatConfigLayer {
			enabled: env.bool("LOOM_MESH_NAT_ENABLED"),
			nft_binary: env.var("LOOM_MESH_NAT_NFT_BINARY"),
		}),
		autocfg: Some(AutocfgConfigLayer {
			link_local_addresses: env.bool("LOOM_MESH_AUTOCFG_LINK_LOCAL_ADDRESSES"),
		}),
		logging: Some(LoggingConfigLayer {
			level: env.var("LOOM_MESH_LOG_LEVEL"),
			json: env.bool("LOOM_MESH_LOG_JSON"),
		}),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::io::Write;
	use std::net::IpAddr;

	fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |name| vars.get(name).cloned()
	}

	#[test]
	fn precedence_ordering() {
		assert!(Precedence::CommandLine > Precedence::Environment);
		assert!(Precedence::Environment > Precedence::ConfigFile);
		assert!(Precedence::ConfigFile > Precedence::Defaults);
	}

	#[test]
	fn missing_toml_file_is_empty() {
		let layer = TomlSource::new("/nonexistent/mesh.toml").load().unwrap();
		assert_eq!(layer, MeshConfigLayer::default());
	}

	#[test]
	fn malformed_toml_file_fails() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "[ice\nstun_servers = 1").unwrap();
		let err = TomlSource::new(file.path()).load().unwrap_err();
		assert!(matches!(err, ConfigError::TomlParse { .. }));
	}

	#[test]
	fn env_lists_and_numbers() {
		let layer = layer_from_env(env(&[
			("LOOM_MESH_SIGNALING_BACKENDS", "inprocess:, inprocess:"),
			("LOOM_MESH_ICE_HOST_ADDRESSES", "192.0.2.1,2001:db8::1"),
			("LOOM_MESH_ICE_MUX_PORT_MIN", "40000"),
			("LOOM_MESH_WATCHER_WATCH_LINKS", "false"),
			("LOOM_MESH_LOG_JSON", "1"),
		]))
		.unwrap();

		assert_eq!(layer.signaling.unwrap().backends.unwrap().len(), 2);
		let ice = layer.ice.unwrap();
		assert_eq!(
			ice.host_addresses.unwrap(),
			vec!["192.0.2.1".parse::<IpAddr>().unwrap(), "2001:db8::1".parse().unwrap()]
		);
		assert_eq!(ice.mux_port_min, Some(40000));
		assert_eq!(layer.watcher.unwrap().watch_links, Some(false));
		assert_eq!(layer.logging.unwrap().json, Some(true));
	}

	#[test]
	fn env_rejects_bad_port() {
		let err = layer_from_env(env(&[("LOOM_MESH_ICE_MUX_PORT_MAX", "70000")])).unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "LOOM_MESH_ICE_MUX_PORT_MAX"));
	}

	#[test]
	fn empty_env_sets_nothing() {
		let layer = layer_from_env(env(&[("LOOM_MESH_LOG_LEVEL", "")])).unwrap();
		assert_eq!(layer.logging.unwrap().level, None);
		assert_eq!(layer.ice.unwrap(), IceConfigLayer::default());
	}
}
