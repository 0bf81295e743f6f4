// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory WireGuard devices for tests and dry runs.

use crate::bind::UserBind;
use crate::client::WireGuardClient;
use crate::config::{DeviceConfig, PeerConfig};
use crate::error::{DeviceError, Result};
use crate::snapshot::{InterfaceSnapshot, InterfaceType, PeerSnapshot};
use async_trait::async_trait;
use ipnet::IpNet;
use loom_mesh_common::{WgPrivateKey, WgPublicKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

struct MemoryDevice {
	snapshot: InterfaceSnapshot,
	addresses: Vec<IpNet>,
}

/// Devices held in memory, applying configuration the way the kernel does.
#[derive(Default)]
pub struct MemoryWireGuard {
	devices: RwLock<BTreeMap<String, MemoryDevice>>,
	binds: RwLock<HashMap<String, Arc<dyn UserBind>>>,
	configure_calls: AtomicU64,
}

impl MemoryWireGuard {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn add_device(
		&self,
		name: &str,
		interface_type: InterfaceType,
		private_key: WgPrivateKey,
		listen_port: u16,
	) -> Result<InterfaceSnapshot> {
		let mut devices = self.devices.write().await;
		if devices.contains_key(name) {
			return Err(DeviceError::AlreadyExists(name.to_string()));
		}
		let snapshot = InterfaceSnapshot::new(name, interface_type, private_key).with_listen_port(listen_port);
		devices.insert(
			name.to_string(),
			MemoryDevice {
				snapshot: snapshot.clone(),
				addresses: Vec::new(),
			},
		);
		Ok(snapshot)
	}

	pub async fn remove_device(&self, name: &str) -> Result<()> {
		self.devices
			.write()
			.await
			.remove(name)
			.map(|_| ())
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))
	}

	/// Registers an in-process bind, as a userspace implementation would expose.
	pub async fn set_user_bind(&self, name: &str, bind: Arc<dyn UserBind>) {
		self.binds.write().await.insert(name.to_string(), bind);
	}

	/// Adds to a peer's transfer counters.
	pub async fn record_traffic(&self, name: &str, peer: &WgPublicKey, rx: u64, tx: u64) -> Result<()> {
		let mut devices = self.devices.write().await;
		let device = devices
			.get_mut(name)
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
		let peer = device
			.snapshot
			.peer_mut(peer)
			.ok_or_else(|| DeviceError::NotFound(format!("{}/{}", name, peer)))?;
		peer.rx_bytes += rx;
		peer.tx_bytes += tx;
		Ok(())
	}

	pub fn configure_calls(&self) -> u64 {
		self.configure_calls.load(Ordering::Relaxed)
	}
}

fn apply_peer(snapshot: &mut InterfaceSnapshot, cfg: &PeerConfig) {
	let exists = snapshot.peer(&cfg.public_key).is_some();

	if cfg.remove {
		snapshot.peers.retain(|p| p.public_key != cfg.public_key);
		return;
	}
	if cfg.update_only && !exists {
		debug!(peer = %cfg.public_key, "skipping update of absent peer");
		return;
	}
	if !exists {
		snapshot.peers.push(PeerSnapshot::new(cfg.public_key));
		snapshot.sort_peers();
	}

	let Some(peer) = snapshot.peer_mut(&cfg.public_key) else {
		return;
	};
	if let Some(endpoint) = cfg.endpoint {
		peer.endpoint = Some(endpoint);
	}
	if let Some(keepalive) = cfg.persistent_keepalive {
		peer.persistent_keepalive = (keepalive > 0).then_some(keepalive);
	}
	if let Some(psk) = &cfg.preshared_key {
		peer.preshared_key = Some(psk.clone());
	}
	if let Some(ips) = &cfg.allowed_ips {
		if cfg.replace_allowed_ips {
			peer.allowed_ips.clear();
		}
		for ip in ips {
			if !peer.allowed_ips.contains(ip) {
				peer.allowed_ips.push(*ip);
			}
		}
	}
}

#[async_trait]
impl WireGuardClient for MemoryWireGuard {
	async fn list_devices(&self) -> Result<Vec<InterfaceSnapshot>> {
		Ok(self
			.devices
			.read()
			.await
			.values()
			.map(|d| d.snapshot.clone())
			.collect())
	}

	async fn get_device(&self, name: &str) -> Result<InterfaceSnapshot> {
		self.devices
			.read()
			.await
			.get(name)
			.map(|d| d.snapshot.clone())
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))
	}

	async fn configure_device(&self, name: &str, config: DeviceConfig) -> Result<()> {
		self.configure_calls.fetch_add(1, Ordering::Relaxed);
		let mut devices = self.devices.write().await;
		let device = devices
			.get_mut(name)
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
		let snapshot = &mut device.snapshot;

		if let Some(key) = config.private_key {
			snapshot.set_private_key(key);
		}
		if let Some(port) = config.listen_port {
			snapshot.listen_port = port;
		}
		if let Some(mark) = config.firewall_mark {
			snapshot.firewall_mark = mark;
		}
		for peer in &config.peers {
			apply_peer(snapshot, peer);
		}
		Ok(())
	}

	async fn addresses(&self, name: &str) -> Result<Vec<IpNet>> {
		self.devices
			.read()
			.await
			.get(name)
			.map(|d| d.addresses.clone())
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))
	}

	async fn add_address(&self, name: &str, addr: IpNet) -> Result<()> {
		let mut devices = self.devices.write().await;
		let device = devices
			.get_mut(name)
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
		if device.addresses.contains(&addr) {
			return Err(DeviceError::AlreadyExists(addr.to_string()));
		}
		device.addresses.push(addr);
		Ok(())
	}

	async fn delete_address(&self, name: &str, addr: IpNet) -> Result<()> {
		let mut devices = self.devices.write().await;
		let device = devices
			.get_mut(name)
			.ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
		let before = device.addresses.len();
		device.addresses.retain(|a| *a != addr);
		if device.addresses.len() == before {
			return Err(DeviceError::NotFound(addr.to_string()));
		}
		Ok(())
	}

	async fn user_bind(&self, name: &str) -> Option<Arc<dyn UserBind>> {
		self.binds.read().await.get(name).cloned()
	}

	fn kind(&self) -> &'static str {
		"memory"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bind::MemoryBind;
	use loom_mesh_common::WgKeyPair;

	async fn device_with_peer() -> (MemoryWireGuard, WgPublicKey) {
		let wg = MemoryWireGuard::new();
		wg.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 51820)
			.await
			.unwrap();
		let peer = *WgKeyPair::generate().public_key();
		wg.configure_device("wg0", DeviceConfig::new().with_peer(PeerConfig::new(peer)))
			.await
			.unwrap();
		(wg, peer)
	}

	#[tokio::test]
	async fn duplicate_device_is_rejected() {
		let wg = MemoryWireGuard::new();
		wg.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 0)
			.await
			.unwrap();
		let err = wg
			.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 0)
			.await
			.unwrap_err();
		assert!(matches!(err, DeviceError::AlreadyExists(_)));
	}

	#[tokio::test]
	async fn update_only_skips_absent_peer() {
		let (wg, _) = device_with_peer().await;
		let stranger = *WgKeyPair::generate().public_key();
		let cfg = DeviceConfig::new().with_peer(
			PeerConfig::new(stranger)
				.update_only()
				.with_endpoint("192.0.2.1:1".parse().unwrap()),
		);
		wg.configure_device("wg0", cfg).await.unwrap();

		assert_eq!(wg.get_device("wg0").await.unwrap().peers.len(), 1);
	}

	#[tokio::test]
	async fn update_only_sets_endpoint_of_existing_peer() {
		let (wg, peer) = device_with_peer().await;
		let endpoint = "192.0.2.1:40000".parse().unwrap();
		wg.configure_device(
			"wg0",
			DeviceConfig::new().with_peer(PeerConfig::new(peer).update_only().with_endpoint(endpoint)),
		)
		.await
		.unwrap();

		let device = wg.get_device("wg0").await.unwrap();
		assert_eq!(device.peer(&peer).unwrap().endpoint, Some(endpoint));
	}

	#[tokio::test]
	async fn allowed_ips_append_or_replace() {
		let (wg, peer) = device_with_peer().await;
		let a: IpNet = "10.0.0.1/32".parse().unwrap();
		let b: IpNet = "10.0.0.2/32".parse().unwrap();

		wg.configure_device("wg0", DeviceConfig::new().with_peer(PeerConfig::new(peer).with_allowed_ips(vec![a], false)))
			.await
			.unwrap();
		wg.configure_device("wg0", DeviceConfig::new().with_peer(PeerConfig::new(peer).with_allowed_ips(vec![b], false)))
			.await
			.unwrap();
		assert_eq!(wg.get_device("wg0").await.unwrap().peer(&peer).unwrap().allowed_ips, vec![a, b]);

		wg.configure_device("wg0", DeviceConfig::new().with_peer(PeerConfig::new(peer).with_allowed_ips(vec![b], true)))
			.await
			.unwrap();
		assert_eq!(wg.get_device("wg0").await.unwrap().peer(&peer).unwrap().allowed_ips, vec![b]);
	}

	#[tokio::test]
	async fn remove_peer() {
		let (wg, peer) = device_with_peer().await;
		wg.configure_device("wg0", DeviceConfig::new().with_peer(PeerConfig::remove(peer)))
			.await
			.unwrap();
		assert!(wg.get_device("wg0").await.unwrap().peers.is_empty());
	}

	#[tokio::test]
	async fn private_key_rotation_updates_public_key() {
		let (wg, _) = device_with_peer().await;
		let rotated = WgKeyPair::generate();
		wg.configure_device("wg0", DeviceConfig::new().with_private_key(rotated.private_key().clone()))
			.await
			.unwrap();
		assert_eq!(wg.get_device("wg0").await.unwrap().public_key, *rotated.public_key());
	}

	#[tokio::test]
	async fn address_management() {
		let (wg, _) = device_with_peer().await;
		let addr: IpNet = "169.254.1.2/32".parse().unwrap();
		wg.add_address("wg0", addr).await.unwrap();
		assert!(wg.add_address("wg0", addr).await.is_err());
		assert_eq!(wg.addresses("wg0").await.unwrap(), vec![addr]);
		wg.delete_address("wg0", addr).await.unwrap();
		assert!(wg.addresses("wg0").await.unwrap().is_empty());
		assert!(wg.delete_address("wg0", addr).await.is_err());
	}

	#[tokio::test]
	async fn user_bind_is_per_device() {
		let wg = MemoryWireGuard::new();
		wg.set_user_bind("wg9", Arc::new(MemoryBind::new())).await;
		assert!(wg.user_bind("wg9").await.is_some());
		assert!(wg.user_bind("wg0").await.is_none());
	}

	#[tokio::test]
	async fn traffic_counters_accumulate() {
		let (wg, peer) = device_with_peer().await;
		wg.record_traffic("wg0", &peer, 100, 50).await.unwrap();
		wg.record_traffic("wg0", &peer, 1, 2).await.unwrap();
		let snapshot = wg.get_device("wg0").await.unwrap();
		let p = snapshot.peer(&peer).unwrap();
		assert_eq!((p.rx_bytes, p.tx_bytes), (101, 52));
	}
}
