// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::EndpointDiscoveryConfig;
use crate::error::{EpdiscError, Result};
use crate::interface::{Interface, Services};
use crate::peer::PeerEngine;
use crate::queue::AsyncEventHandler;
use crate::status::InterfaceStatus;
use async_trait::async_trait;
use loom_mesh_common::WgPublicKey;
use loom_mesh_device::{InterfaceModifier, InterfaceSnapshot, PeerModifier, PeerSnapshot, WireGuardClient};
use loom_mesh_nat::PacketFilter;
use loom_mesh_signaling::Backend;
use loom_mesh_watcher::{Event, EventHandler};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

/// Discovers endpoints for the peers of every watched interface.
///
/// Register it with the watcher through an [`EventQueue`](crate::EventQueue).
pub struct EndpointDiscovery {
	services: Services,
	interfaces: RwLock<HashMap<String, Arc<Interface>>>,
}

impl EndpointDiscovery {
	/// `events` receives peer state changes, usually [`Watcher::events`](loom_mesh_watcher::Watcher::events).
	pub fn new(
		client: Arc<dyn WireGuardClient>,
		backend: Arc<dyn Backend>,
		events: Arc<dyn EventHandler>,
		config: EndpointDiscoveryConfig,
	) -> Self {
		Self {
			services: Services {
				client,
				backend,
				events,
				filter: None,
				config,
			},
			interfaces: RwLock::new(HashMap::new()),
		}
	}

	/// Enables source port rewriting for kernel devices.
	pub fn with_packet_filter(mut self, filter: Arc<dyn PacketFilter>) -> Self {
		self.services.filter = Some(filter);
		self
	}

	pub async fn interface(&self, name: &str) -> Option<Arc<Interface>> {
		self.interfaces.read().await.get(name).cloned()
	}

	pub async fn interfaces(&self) -> Vec<Arc<Interface>> {
		let mut interfaces: Vec<_> = self.interfaces.read().await.values().cloned().collect();
		interfaces.sort_by(|a, b| a.name().cmp(b.name()));
		interfaces
	}

	pub async fn peer(&self, interface: &str, public_key: &WgPublicKey) -> Option<Arc<PeerEngine>> {
		self.interface(interface).await?.peer(public_key).await
	}

	async fn require(&self, interface: &str) -> Result<Arc<Interface>> {
		self.interface(interface)
			.await
			.ok_or_else(|| EpdiscError::InterfaceNotFound(interface.to_string()))
	}

	#[instrument(skip_all, fields(intf = %snapshot.name))]
	async fn on_interface_added(&self, snapshot: &InterfaceSnapshot) -> Result<()> {
		if self.interfaces.read().await.contains_key(&snapshot.name) {
			debug!("interface already known");
			return Ok(());
		}
		let intf = Arc::new(Interface::new(snapshot, &self.services).await?);
		self.interfaces.write().await.insert(snapshot.name.clone(), intf);
		Ok(())
	}

	async fn on_interface_removed(&self, snapshot: &InterfaceSnapshot) -> Result<()> {
		let intf = self
			.interfaces
			.write()
			.await
			.remove(&snapshot.name)
			.ok_or_else(|| EpdiscError::InterfaceNotFound(snapshot.name.clone()))?;
		intf.close().await
	}

	async fn on_interface_modified(
		&self,
		interface: &InterfaceSnapshot,
		modified: InterfaceModifier,
	) -> Result<()> {
		let intf = self.require(&interface.name).await?;
		if modified.contains(InterfaceModifier::LISTEN_PORT) {
			intf.update_listen_port(interface.listen_port).await;
		}
		if modified.contains(InterfaceModifier::PRIVATE_KEY) {
			intf.update_private_key(interface.private_key.clone()).await?;
		}
		Ok(())
	}

	async fn on_peer_added(&self, interface: &str, peer: &PeerSnapshot) -> Result<()> {
		self.require(interface).await?.add_peer(peer).await.map(|_| ())
	}

	async fn on_peer_removed(&self, interface: &str, peer: &PeerSnapshot) -> Result<()> {
		self.require(interface).await?.remove_peer(&peer.public_key).await
	}

	async fn on_peer_modified(
		&self,
		interface: &str,
		public_key: &WgPublicKey,
		endpoint: Option<SocketAddr>,
		modified: PeerModifier,
	) -> Result<()> {
		if !modified.contains(PeerModifier::ENDPOINT) {
			return Ok(());
		}
		let engine = self
			.peer(interface, public_key)
			.await
			.ok_or(EpdiscError::PeerNotFound(*public_key))?;
		engine.on_endpoint_modified(endpoint);
		Ok(())
	}

	/// Status of every interface and its engines.
	pub async fn marshal(&self) -> Vec<InterfaceStatus> {
		let mut status = Vec::new();
		for intf in self.interfaces().await {
			status.push(intf.marshal().await);
		}
		status
	}

	/// Marks every engine closing before closing any of them, then closes
	/// the engines and the interfaces.
	pub async fn close(&self) {
		let interfaces: Vec<_> = self.interfaces.write().await.drain().map(|(_, i)| i).collect();
		for intf in &interfaces {
			intf.mark_closing().await;
		}
		for intf in &interfaces {
			for engine in intf.peers().await {
				engine.close().await;
			}
		}
		for intf in interfaces {
			if let Err(e) = intf.close().await {
				warn!(intf = %intf.name(), error = %e, "failed to close interface");
			}
		}
		info!("endpoint discovery closed");
	}
}

#[async_trait]
impl AsyncEventHandler for EndpointDiscovery {
	async fn handle_event(&self, event: &Event) {
		let result = match event {
			Event::InterfaceAdded(intf) => self.on_interface_added(intf).await,
			Event::InterfaceRemoved(intf) => self.on_interface_removed(intf).await,
			Event::InterfaceModified { interface, modified, .. } => {
				self.on_interface_modified(interface, *modified).await
			}
			Event::PeerAdded { interface, peer } => self.on_peer_added(interface, peer).await,
			Event::PeerRemoved { interface, peer } => self.on_peer_removed(interface, peer).await,
			Event::PeerModified {
				interface,
				peer,
				modified,
				..
			} => {
				self.on_peer_modified(interface, &peer.public_key, peer.endpoint, *modified)
					.await
			}
			Event::PeerStateChanged { .. } => Ok(()),
		};

		if let Err(e) = result {
			error!(kind = event.kind(), intf = event.interface_name(), error = %e, "failed to handle event");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::queue::EventQueue;
	use loom_mesh_common::WgPrivateKey;
	use loom_mesh_conn::IceConfig;
	use loom_mesh_device::{InterfaceType, MemoryWireGuard};
	use loom_mesh_nat::MemoryFilter;
	use loom_mesh_signaling::{InProcessBackend, InProcessHub};
	use loom_mesh_watcher::Handlers;
	use std::net::{IpAddr, Ipv4Addr};

	fn feature(client: Arc<MemoryWireGuard>, filter: Arc<MemoryFilter>) -> Arc<EndpointDiscovery> {
		let config = EndpointDiscoveryConfig::new(IceConfig {
			host_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
			..IceConfig::default()
		})
		.with_mux_ports(0, 0)
		.with_mux_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
		Arc::new(
			EndpointDiscovery::new(
				client,
				Arc::new(InProcessBackend::new(InProcessHub::new())),
				Arc::new(Handlers::new()),
				config,
			)
			.with_packet_filter(filter),
		)
	}

	#[tokio::test]
	async fn interface_and_peer_lifecycle() {
		let client = Arc::new(MemoryWireGuard::new());
		let filter = Arc::new(MemoryFilter::new());
		let feature = feature(client.clone(), filter.clone());
		let queue = EventQueue::spawn(feature.clone());

		let snapshot = client
			.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 51820)
			.await
			.unwrap();
		let peer = PeerSnapshot::new(WgPrivateKey::generate().public_key());

		queue.on_event(&Event::InterfaceAdded(snapshot.clone()));
		queue.on_event(&Event::PeerAdded {
			interface: "wg0".to_string(),
			peer: peer.clone(),
		});
		queue.settled().await;

		assert!(feature.peer("wg0", &peer.public_key).await.is_some());
		let status = feature.marshal().await;
		assert_eq!(status.len(), 1);
		assert_eq!(status[0].peers.len(), 1);
		assert!(filter.has_table("mesh-wg0").await);

		queue.on_event(&Event::PeerRemoved {
			interface: "wg0".to_string(),
			peer: peer.clone(),
		});
		queue.on_event(&Event::InterfaceRemoved(snapshot));
		queue.settled().await;

		assert!(feature.interface("wg0").await.is_none());
		assert!(!filter.has_table("mesh-wg0").await);
	}

	#[tokio::test]
	async fn peer_event_for_unknown_interface_is_ignored() {
		let client = Arc::new(MemoryWireGuard::new());
		let feature = feature(client, Arc::new(MemoryFilter::new()));
		feature
			.handle_event(&Event::PeerAdded {
				interface: "wg9".to_string(),
				peer: PeerSnapshot::new(WgPrivateKey::generate().public_key()),
			})
			.await;
		assert!(feature.interfaces().await.is_empty());
	}

	#[tokio::test]
	async fn close_stops_every_engine() {
		let client = Arc::new(MemoryWireGuard::new());
		let filter = Arc::new(MemoryFilter::new());
		let feature = feature(client.clone(), filter.clone());

		let snapshot = client
			.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 51820)
			.await
			.unwrap();
		feature.handle_event(&Event::InterfaceAdded(snapshot)).await;
		let mut engines = Vec::new();
		for _ in 0..3 {
			let peer = PeerSnapshot::new(WgPrivateKey::generate().public_key());
			feature
				.handle_event(&Event::PeerAdded {
					interface: "wg0".to_string(),
					peer: peer.clone(),
				})
				.await;
			engines.push(feature.peer("wg0", &peer.public_key).await.unwrap());
		}

		tokio::time::timeout(std::time::Duration::from_secs(5), feature.close())
			.await
			.unwrap();
		for engine in engines {
			assert_eq!(engine.state(), loom_mesh_common::ConnectionState::Closing);
		}
		assert!(!filter.has_table("mesh-wg0").await);
	}
}
