// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client driving the `wg(8)` and `ip(8)` tools.
//!
//! `wg` talks to kernel devices over netlink and to userspace
//! implementations over their control socket, so one client covers both.

use crate::client::WireGuardClient;
use crate::config::DeviceConfig;
use crate::error::{DeviceError, Result};
use crate::snapshot::{InterfaceSnapshot, InterfaceType, PeerSnapshot, PresharedKey};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ipnet::IpNet;
use loom_mesh_common::{WgPrivateKey, WgPublicKey};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, trace};
use zeroize::Zeroizing;

pub const DEFAULT_SOCKET_DIR: &str = "/var/run/wireguard";

const NONE_FIELD: &str = "(none)";
const OFF_FIELD: &str = "off";

pub struct WgToolClient {
	wg_binary: String,
	ip_binary: String,
	socket_dir: PathBuf,
}

impl WgToolClient {
	pub fn new() -> Self {
		Self {
			wg_binary: "wg".to_string(),
			ip_binary: "ip".to_string(),
			socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
		}
	}

	pub fn with_wg_binary(mut self, binary: impl Into<String>) -> Self {
		self.wg_binary = binary.into();
		self
	}

	pub fn with_ip_binary(mut self, binary: impl Into<String>) -> Self {
		self.ip_binary = binary.into();
		self
	}

	pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.socket_dir = dir.into();
		self
	}

	async fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> Result<String> {
		trace!(program, ?args, "running command");
		let mut cmd = Command::new(program);
		cmd.args(args)
			.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());

		let mut child = cmd.spawn()?;
		if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
			pipe.write_all(input).await?;
			drop(pipe);
		}

		let output = child.wait_with_output().await?;
		if !output.status.success() {
			return Err(DeviceError::Command {
				command: format!("{} {}", program, args.first().map(String::as_str).unwrap_or("")),
				stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}

	async fn wg(&self, args: Vec<String>, stdin: Option<&[u8]>) -> Result<String> {
		self.run(&self.wg_binary, &args, stdin).await
	}

	async fn ip(&self, args: Vec<String>) -> Result<String> {
		self.run(&self.ip_binary, &args, None).await
	}
}

impl Default for WgToolClient {
	fn default() -> Self {
		Self::new()
	}
}

fn interface_type(socket_dir: &Path, name: &str) -> InterfaceType {
	if socket_dir.join(format!("{}.sock", name)).exists() {
		InterfaceType::Userspace
	} else {
		InterfaceType::Kernel
	}
}

/// Parses `wg show all dump`.
pub fn parse_dump_all(text: &str, socket_dir: &Path) -> Result<Vec<InterfaceSnapshot>> {
	let mut devices: BTreeMap<String, InterfaceSnapshot> = BTreeMap::new();

	for line in text.lines().filter(|l| !l.trim().is_empty()) {
		let fields: Vec<&str> = line.split('\t').collect();
		match fields.len() {
			5 => {
				let name = fields[0];
				let intf = parse_interface_fields(name, &fields[1..], socket_dir)?;
				devices.insert(name.to_string(), intf);
			}
			9 => {
				let peer = parse_peer_fields(&fields[1..])?;
				let intf = devices
					.get_mut(fields[0])
					.ok_or_else(|| DeviceError::parse("dump", format!("peer before interface {}", fields[0])))?;
				intf.peers.push(peer);
			}
			n => return Err(DeviceError::parse("dump", format!("unexpected field count {}", n))),
		}
	}

	Ok(devices
		.into_values()
		.map(|mut intf| {
			intf.sort_peers();
			intf
		})
		.collect())
}

/// Parses `wg show <name> dump`.
pub fn parse_dump_device(name: &str, text: &str, socket_dir: &Path) -> Result<InterfaceSnapshot> {
	let mut lines = text.lines().filter(|l| !l.trim().is_empty());
	let header = lines
		.next()
		.ok_or_else(|| DeviceError::parse("dump", "empty output"))?;
	let fields: Vec<&str> = header.split('\t').collect();
	if fields.len() != 4 {
		return Err(DeviceError::parse("dump", format!("interface line has {} fields", fields.len())));
	}
	let mut intf = parse_interface_fields(name, &fields, socket_dir)?;

	for line in lines {
		let fields: Vec<&str> = line.split('\t').collect();
		if fields.len() != 8 {
			return Err(DeviceError::parse("dump", format!("peer line has {} fields", fields.len())));
		}
		intf.peers.push(parse_peer_fields(&fields)?);
	}

	intf.sort_peers();
	Ok(intf)
}

fn parse_interface_fields(name: &str, fields: &[&str], socket_dir: &Path) -> Result<InterfaceSnapshot> {
	let private_key = match fields[0] {
		NONE_FIELD => WgPrivateKey::from_bytes([0u8; 32]),
		key => WgPrivateKey::from_base64(key)?,
	};
	let listen_port = fields[2]
		.parse::<u16>()
		.map_err(|e| DeviceError::parse("listen port", e.to_string()))?;
	let firewall_mark = parse_fwmark(fields[3])?;

	let mut intf = InterfaceSnapshot::new(name, interface_type(socket_dir, name), private_key)
		.with_listen_port(listen_port);
	intf.firewall_mark = firewall_mark;
	Ok(intf)
}

fn parse_fwmark(field: &str) -> Result<u32> {
	if field == OFF_FIELD {
		return Ok(0);
	}
	let parsed = match field.strip_prefix("0x") {
		Some(hex) => u32::from_str_radix(hex, 16),
		None => field.parse::<u32>(),
	};
	parsed.map_err(|e| DeviceError::parse("fwmark", e.to_string()))
}

fn parse_peer_fields(fields: &[&str]) -> Result<PeerSnapshot> {
	let mut peer = PeerSnapshot::new(WgPublicKey::from_base64(fields[0])?);

	if fields[1] != NONE_FIELD {
		peer.preshared_key = Some(PresharedKey::from_base64(fields[1])?);
	}
	if fields[2] != NONE_FIELD {
		peer.endpoint = Some(parse_endpoint(fields[2])?);
	}
	if fields[3] != NONE_FIELD {
		peer.allowed_ips = fields[3]
			.split(',')
			.filter(|s| !s.is_empty())
			.map(|s| s.parse::<IpNet>().map_err(|e| DeviceError::parse("allowed ip", e.to_string())))
			.collect::<Result<Vec<_>>>()?;
	}

	let handshake = fields[4]
		.parse::<i64>()
		.map_err(|e| DeviceError::parse("handshake", e.to_string()))?;
	if handshake > 0 {
		peer.last_handshake = Utc.timestamp_opt(handshake, 0).single();
	}
	peer.rx_bytes = fields[5]
		.parse()
		.map_err(|_| DeviceError::parse("rx bytes", fields[5]))?;
	peer.tx_bytes = fields[6]
		.parse()
		.map_err(|_| DeviceError::parse("tx bytes", fields[6]))?;
	if fields[7] != OFF_FIELD {
		let secs = fields[7]
			.parse::<u16>()
			.map_err(|e| DeviceError::parse("keepalive", e.to_string()))?;
		peer.persistent_keepalive = (secs > 0).then_some(secs);
	}

	Ok(peer)
}

/// Accepts `ip:port` and `[ipv6%scope]:port`.
fn parse_endpoint(field: &str) -> Result<SocketAddr> {
	let cleaned = match (field.find('%'), field.find(']')) {
		(Some(pct), Some(close)) if pct < close => format!("{}{}", &field[..pct], &field[close..]),
		_ => field.to_string(),
	};
	cleaned
		.parse::<SocketAddr>()
		.map_err(|e| DeviceError::parse("endpoint", format!("{}: {}", field, e)))
}

/// Parses the address lines of `ip -o addr show dev <name>`.
pub fn parse_ip_addr_output(text: &str) -> Vec<IpNet> {
	let mut addrs = Vec::new();
	for line in text.lines() {
		let mut tokens = line.split_whitespace();
		while let Some(token) = tokens.next() {
			if token != "inet" && token != "inet6" {
				continue;
			}
			let Some(value) = tokens.next() else { break };
			let parsed = value
				.parse::<IpNet>()
				.ok()
				.or_else(|| value.parse::<IpAddr>().ok().map(IpNet::from));
			if let Some(net) = parsed {
				addrs.push(net);
			}
			break;
		}
	}
	addrs
}

#[async_trait]
impl WireGuardClient for WgToolClient {
	#[instrument(skip(self))]
	async fn list_devices(&self) -> Result<Vec<InterfaceSnapshot>> {
		let out = self
			.wg(vec!["show".into(), "all".into(), "dump".into()], None)
			.await?;
		parse_dump_all(&out, &self.socket_dir)
	}

	#[instrument(skip(self))]
	async fn get_device(&self, name: &str) -> Result<InterfaceSnapshot> {
		let out = self
			.wg(vec!["show".into(), name.into(), "dump".into()], None)
			.await
			.map_err(|e| match e {
				DeviceError::Command { .. } => DeviceError::NotFound(name.to_string()),
				other => other,
			})?;
		parse_dump_device(name, &out, &self.socket_dir)
	}

	#[instrument(skip(self, config), fields(peers = config.peers.len()))]
	async fn configure_device(&self, name: &str, config: DeviceConfig) -> Result<()> {
		let needs_current = config
			.peers
			.iter()
			.any(|p| p.update_only || (p.allowed_ips.is_some() && !p.replace_allowed_ips));
		let current = if needs_current {
			Some(self.get_device(name).await?)
		} else {
			None
		};

		let mut args: Vec<String> = vec!["set".into(), name.into()];
		let mut stdin: Option<Zeroizing<String>> = None;

		if let Some(port) = config.listen_port {
			args.extend(["listen-port".into(), port.to_string()]);
		}
		if let Some(mark) = config.firewall_mark {
			let value = if mark == 0 { OFF_FIELD.to_string() } else { mark.to_string() };
			args.extend(["fwmark".into(), value]);
		}
		if let Some(key) = &config.private_key {
			args.extend(["private-key".into(), "/dev/stdin".into()]);
			stdin = Some(key.to_base64());
		}

		let mut preshared = Vec::new();
		for peer in &config.peers {
			let existing = current.as_ref().and_then(|c| c.peer(&peer.public_key));
			if peer.update_only && existing.is_none() {
				debug!(peer = %peer.public_key, "skipping update of absent peer");
				continue;
			}

			args.extend(["peer".into(), peer.public_key.to_base64()]);
			if peer.remove {
				args.push("remove".into());
				continue;
			}
			if let Some(endpoint) = peer.endpoint {
				args.extend(["endpoint".into(), endpoint.to_string()]);
			}
			if let Some(keepalive) = peer.persistent_keepalive {
				let value = if keepalive == 0 { OFF_FIELD.to_string() } else { keepalive.to_string() };
				args.extend(["persistent-keepalive".into(), value]);
			}
			if let Some(ips) = &peer.allowed_ips {
				let mut merged: Vec<IpNet> = match (peer.replace_allowed_ips, existing) {
					(false, Some(existing)) => existing.allowed_ips.clone(),
					_ => Vec::new(),
				};
				for ip in ips {
					if !merged.contains(ip) {
						merged.push(*ip);
					}
				}
				let list: Vec<String> = merged.iter().map(ToString::to_string).collect();
				args.extend(["allowed-ips".into(), list.join(",")]);
			}
			if let Some(psk) = &peer.preshared_key {
				preshared.push((peer.public_key, psk.clone()));
			}
		}

		if args.len() > 2 {
			self.wg(args, stdin.as_ref().map(|s| s.as_bytes())).await?;
		}

		for (public_key, psk) in preshared {
			let encoded = psk.to_base64();
			self.wg(
				vec![
					"set".into(),
					name.into(),
					"peer".into(),
					public_key.to_base64(),
					"preshared-key".into(),
					"/dev/stdin".into(),
				],
				Some(encoded.as_bytes()),
			)
			.await?;
		}

		Ok(())
	}

	async fn addresses(&self, name: &str) -> Result<Vec<IpNet>> {
		let out = self
			.ip(vec!["-o".into(), "addr".into(), "show".into(), "dev".into(), name.into()])
			.await?;
		Ok(parse_ip_addr_output(&out))
	}

	#[instrument(skip(self))]
	async fn add_address(&self, name: &str, addr: IpNet) -> Result<()> {
		self.ip(vec!["addr".into(), "add".into(), addr.to_string(), "dev".into(), name.into()])
			.await?;
		Ok(())
	}

	#[instrument(skip(self))]
	async fn delete_address(&self, name: &str, addr: IpNet) -> Result<()> {
		self.ip(vec!["addr".into(), "del".into(), addr.to_string(), "dev".into(), name.into()])
			.await?;
		Ok(())
	}

	fn kind(&self) -> &'static str {
		"wg"
	}
}
