// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Two nodes on loopback discovering each other through one signaling hub.

use loom_mesh_common::{ConnectionState, Credentials, KeyPair, Message, WgPrivateKey, WgPublicKey};
use loom_mesh_conn::IceConfig;
use loom_mesh_device::{DeviceConfig, InterfaceType, MemoryBind, MemoryWireGuard, PeerConfig, WireGuardClient};
use loom_mesh_epdisc::{
	AddressConfigurator, EndpointDiscovery, EndpointDiscoveryConfig, EventQueue, PeerEngine, ProxyType,
};
use loom_mesh_nat::{MemoryFilter, Rule};
use loom_mesh_signaling::{Backend, InProcessBackend, InProcessHub};
use loom_mesh_watcher::{Watcher, WatcherConfig};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const DEADLINE: Duration = Duration::from_secs(10);

struct Node {
	key: WgPrivateKey,
	client: Arc<MemoryWireGuard>,
	filter: Arc<MemoryFilter>,
	backend: Arc<InProcessBackend>,
	bind: Option<Arc<MemoryBind>>,
	watcher: Arc<Watcher>,
	feature: Arc<EndpointDiscovery>,
	queue: Arc<EventQueue>,
	autocfg: Arc<EventQueue>,
}

impl Node {
	async fn new(hub: &InProcessHub, interface_type: InterfaceType) -> Self {
		Self::with_listen_port(hub, interface_type, 51820).await
	}

	async fn with_listen_port(hub: &InProcessHub, interface_type: InterfaceType, listen_port: u16) -> Self {
		let key = WgPrivateKey::generate();
		let client = Arc::new(MemoryWireGuard::new());
		client
			.add_device("wg0", interface_type, key.clone(), listen_port)
			.await
			.unwrap();
		let bind = match interface_type {
			InterfaceType::Userspace => {
				let bind = Arc::new(MemoryBind::new());
				client.set_user_bind("wg0", bind.clone()).await;
				Some(bind)
			}
			_ => None,
		};

		let filter = Arc::new(MemoryFilter::new());
		let backend = Arc::new(InProcessBackend::new(hub.clone()));
		let watcher = Arc::new(Watcher::new(
			client.clone(),
			WatcherConfig::default().with_watch_links(false),
		));

		let config = EndpointDiscoveryConfig::new(IceConfig {
			host_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
			..IceConfig::default()
		})
		.with_mux_ports(0, 0)
		.with_mux_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
		let feature = Arc::new(
			EndpointDiscovery::new(client.clone(), backend.clone(), watcher.events(), config)
				.with_packet_filter(filter.clone()),
		);

		let queue = EventQueue::spawn(feature.clone());
		watcher.on_all(queue.clone());
		let autocfg = EventQueue::spawn(Arc::new(AddressConfigurator::new(client.clone())));
		watcher.on_interface(autocfg.clone());

		Self {
			key,
			client,
			filter,
			backend,
			bind,
			watcher,
			feature,
			queue,
			autocfg,
		}
	}

	fn public_key(&self) -> WgPublicKey {
		self.key.public_key()
	}

	async fn add_peer(&self, other: &Node) {
		self.client
			.configure_device("wg0", DeviceConfig::new().with_peer(PeerConfig::new(other.public_key())))
			.await
			.unwrap();
	}

	async fn sync(&self) {
		self.watcher.sync().await.unwrap();
		self.queue.settled().await;
		self.autocfg.settled().await;
	}

	async fn engine(&self, peer: &Node) -> Arc<PeerEngine> {
		self.feature.peer("wg0", &peer.public_key()).await.unwrap()
	}

	async fn mux_addrs(&self) -> Vec<SocketAddr> {
		let intf = self.feature.interface("wg0").await.unwrap();
		vec![intf.mux_addr(), intf.mux_srflx_addr()]
	}

	async fn close(&self) {
		self.feature.close().await;
		self.queue.close().await;
		self.autocfg.close().await;
	}
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = Instant::now() + DEADLINE;
	while !check().await {
		assert!(Instant::now() < deadline, "timed out waiting for {what}");
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

async fn connected_pair(interface_type: InterfaceType) -> (Node, Node) {
	let hub = InProcessHub::new();
	let a = Node::new(&hub, interface_type).await;
	let b = Node::new(&hub, interface_type).await;
	a.add_peer(&b).await;
	b.add_peer(&a).await;
	a.sync().await;
	b.sync().await;

	let ab = a.engine(&b).await;
	let ba = b.engine(&a).await;
	eventually("both engines to connect", || async {
		ab.state() == ConnectionState::Connected && ba.state() == ConnectionState::Connected
	})
	.await;
	(a, b)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kernel_peers_connect_through_source_rewrite() {
	let (a, b) = connected_pair(InterfaceType::Kernel).await;
	let ab = a.engine(&b).await;
	let ba = b.engine(&a).await;

	let endpoint = ab.last_endpoint().unwrap();
	assert!(b.mux_addrs().await.contains(&endpoint));
	assert!(a.mux_addrs().await.contains(&ba.last_endpoint().unwrap()));

	let device = a.client.get_device("wg0").await.unwrap();
	assert_eq!(device.peer(&b.public_key()).unwrap().endpoint, Some(endpoint));
	assert_eq!(ab.marshal().proxy_type, ProxyType::KernelNat);

	let rules = a.filter.rules("mesh-wg0").await;
	assert!(rules.contains(&Rule::MasqueradeSource {
		listen_port: 51820,
		remote: endpoint,
		candidate_port: a.mux_addrs().await[0].port(),
	}));
	assert_eq!(
		rules.iter().filter(|r| matches!(r, Rule::RedirectNonStun { .. })).count(),
		2
	);

	a.close().await;
	b.close().await;
	assert!(!a.filter.has_table("mesh-wg0").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn userspace_peers_exchange_datagrams_over_bind() {
	let (a, b) = connected_pair(InterfaceType::Userspace).await;
	let ab = a.engine(&b).await;
	let ba = b.engine(&a).await;
	assert_eq!(ab.marshal().proxy_type, ProxyType::UserBind);
	assert!(a.filter.rules("mesh-wg0").await.is_empty());

	let endpoint = ab.last_endpoint().unwrap();
	let bind = a.bind.as_ref().unwrap();
	assert_eq!(bind.len().await, 1);
	bind.send_to(endpoint, b"wireguard handshake").await.unwrap();

	eventually("datagram to reach the remote agent", || async {
		ba.marshal()
			.agent
			.and_then(|stats| stats.selected_pair)
			.is_some_and(|pair| pair.packets_received > 0)
	})
	.await;

	a.close().await;
	b.close().await;
	assert_eq!(bind.len().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_endpoint_change_is_reported_not_reverted() {
	let (a, b) = connected_pair(InterfaceType::Kernel).await;
	let ab = a.engine(&b).await;
	let ours = ab.last_endpoint().unwrap();
	let calls = a.client.configure_calls();

	let foreign: SocketAddr = "192.0.2.10:51820".parse().unwrap();
	a.client
		.configure_device(
			"wg0",
			DeviceConfig::new().with_peer(PeerConfig::new(b.public_key()).with_endpoint(foreign)),
		)
		.await
		.unwrap();
	a.sync().await;

	assert!(ab.on_endpoint_modified(Some(foreign)));
	assert_eq!(ab.last_endpoint(), Some(ours));
	assert_eq!(ab.state(), ConnectionState::Connected);
	assert_eq!(a.client.configure_calls(), calls + 1);

	a.close().await;
	b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changed_remote_credentials_restart_the_session() {
	let (a, b) = connected_pair(InterfaceType::Kernel).await;
	let ab = a.engine(&b).await;
	let ufrag = ab.marshal().local_ufrag.unwrap();
	assert_eq!(ab.restart_count(), 0);

	// Credentials from a session b never started.
	b.backend
		.publish(
			&KeyPair::new(b.key.clone(), a.public_key()),
			&Message::Credentials(Credentials::generate()),
		)
		.await
		.unwrap();

	eventually("the session to restart", || async { ab.restart_count() >= 1 }).await;
	let ba = b.engine(&a).await;
	eventually("both engines to reconnect", || async {
		ab.state() == ConnectionState::Connected && ba.state() == ConnectionState::Connected
	})
	.await;
	assert_ne!(ab.marshal().local_ufrag.unwrap(), ufrag);

	a.close().await;
	b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listen_port_change_moves_nat_rules() {
	let (a, b) = connected_pair(InterfaceType::Kernel).await;
	let ab = a.engine(&b).await;
	let endpoint = ab.last_endpoint().unwrap();

	a.client
		.configure_device("wg0", DeviceConfig::new().with_listen_port(51999))
		.await
		.unwrap();
	a.sync().await;

	let intf = a.feature.interface("wg0").await.unwrap();
	assert_eq!(intf.listen_port(), 51999);
	let rules = a.filter.rules("mesh-wg0").await;
	assert_eq!(
		rules
			.iter()
			.filter(|r| matches!(r, Rule::RedirectNonStun { listen_port: 51999, .. }))
			.count(),
		2
	);
	assert!(rules.iter().all(|r| match r {
		Rule::RedirectNonStun { listen_port, .. } | Rule::MasqueradeSource { listen_port, .. } => {
			*listen_port == 51999
		}
	}));
	assert!(rules.contains(&Rule::MasqueradeSource {
		listen_port: 51999,
		remote: endpoint,
		candidate_port: intf.mux_addr().port(),
	}));
	assert_eq!(ab.last_endpoint(), Some(endpoint));

	a.close().await;
	b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_rotation_moves_subscription_and_addresses() {
	let hub = InProcessHub::new();
	let a = Node::new(&hub, InterfaceType::Kernel).await;
	let b = Node::new(&hub, InterfaceType::Kernel).await;
	a.add_peer(&b).await;
	a.sync().await;

	let old = a.public_key();
	let registry = a.backend.registry();
	assert!(registry.is_subscribed(&old).await);
	let addrs = a.client.addresses("wg0").await.unwrap();
	assert!(addrs.contains(&old.ipv4_address()));
	assert!(addrs.contains(&old.ipv6_address()));

	let rotated = WgPrivateKey::generate();
	let new = rotated.public_key();
	a.client
		.configure_device("wg0", DeviceConfig::new().with_private_key(rotated))
		.await
		.unwrap();
	a.sync().await;

	assert!(registry.is_subscribed(&new).await);
	assert!(!registry.is_subscribed(&old).await);
	assert_eq!(a.feature.interface("wg0").await.unwrap().public_key(), new);

	let addrs = a.client.addresses("wg0").await.unwrap();
	assert!(addrs.contains(&new.ipv4_address()));
	assert!(addrs.contains(&new.ipv6_address()));
	assert!(!addrs.contains(&old.ipv4_address()));
	assert!(!addrs.contains(&old.ipv6_address()));

	a.close().await;
	assert!(registry.is_empty().await);
	b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_peer_releases_its_subscription() {
	let hub = InProcessHub::new();
	let a = Node::new(&hub, InterfaceType::Kernel).await;
	let b = Node::new(&hub, InterfaceType::Kernel).await;
	a.add_peer(&b).await;
	a.sync().await;
	assert!(a.backend.registry().is_subscribed(&a.public_key()).await);

	a.client
		.configure_device("wg0", DeviceConfig::new().with_peer(PeerConfig::remove(b.public_key())))
		.await
		.unwrap();
	a.sync().await;

	assert!(a.feature.peer("wg0", &b.public_key()).await.is_none());
	assert!(a.backend.registry().is_empty().await);

	a.close().await;
	b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_added_with_listen_port_in_one_sync_gets_an_engine() {
	let hub = InProcessHub::new();
	let a = Node::with_listen_port(&hub, InterfaceType::Kernel, 0).await;
	let b = Node::new(&hub, InterfaceType::Kernel).await;
	a.sync().await;
	b.add_peer(&a).await;
	b.sync().await;

	a.client
		.configure_device(
			"wg0",
			DeviceConfig::new()
				.with_listen_port(51820)
				.with_peer(PeerConfig::new(b.public_key())),
		)
		.await
		.unwrap();
	a.sync().await;

	let ab = a.feature.peer("wg0", &b.public_key()).await;
	assert!(ab.is_some(), "peer added in the same sync as the listen port has no engine");
	assert!(a
		.filter
		.rules("mesh-wg0")
		.await
		.iter()
		.any(|r| matches!(r, Rule::RedirectNonStun { listen_port: 51820, .. })));

	let ba = b.engine(&a).await;
	eventually("engines to connect", || async {
		ab.as_ref().is_some_and(|e| e.state() == ConnectionState::Connected)
			&& ba.state() == ConnectionState::Connected
	})
	.await;

	a.close().await;
	b.close().await;
}
