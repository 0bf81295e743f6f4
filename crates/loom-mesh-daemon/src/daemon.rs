// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::{IceConfig as IceSection, MeshConfig};
use crate::error::Result;
use crate::keys::{KeyAssigner, PRIVATE_KEY_ENV};
use loom_mesh_common::{load_key_env, WgPrivateKey};
use loom_mesh_conn::{resolve_stun_servers, IceConfig};
use loom_mesh_device::{WgToolClient, WireGuardClient};
use loom_mesh_epdisc::{AddressConfigurator, EndpointDiscovery, EndpointDiscoveryConfig, EventQueue};
use loom_mesh_nat::{NftFilter, PacketFilter};
use loom_mesh_signaling::{backend_from_urls, Backend, BackendOptions};
use loom_mesh_watcher::{Watcher, WatcherConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Builds the library configuration. Resolves STUN server names.
pub async fn ice_config(section: &IceSection) -> IceConfig {
	let stun_servers = resolve_stun_servers(&section.stun_servers).await;
	if stun_servers.len() < section.stun_servers.len() {
		warn!(
			resolved = stun_servers.len(),
			configured = section.stun_servers.len(),
			"some STUN servers did not resolve"
		);
	}
	IceConfig {
		host_addresses: section.host_addresses.clone(),
		stun_servers,
		failed_timeout: Duration::from_secs(section.failed_timeout_secs),
		disconnected_timeout: Duration::from_secs(section.disconnected_timeout_secs),
		keepalive_interval: Duration::from_secs(section.keepalive_interval_secs),
	}
}

pub async fn endpoint_discovery_config(section: &IceSection) -> EndpointDiscoveryConfig {
	EndpointDiscoveryConfig::new(ice_config(section).await)
		.with_restart_on_disconnect(section.restart_on_disconnect)
		.with_mux_ports(section.mux_port_min, section.mux_port_max)
}

/// Collaborators the daemon is built from.
pub struct Components {
	pub client: Arc<dyn WireGuardClient>,
	pub backend: Arc<dyn Backend>,
	pub filter: Option<Arc<dyn PacketFilter>>,
	pub private_key: Option<WgPrivateKey>,
}

impl Components {
	/// The command line tools, the configured backends and the key from the environment.
	pub fn from_config(config: &MeshConfig) -> Result<Self> {
		let client: Arc<dyn WireGuardClient> =
			Arc::new(WgToolClient::new().with_socket_dir(config.watcher.userspace_socket_dir.clone()));
		let backend = backend_from_urls(&config.signaling.backends, &BackendOptions::default())?;
		let filter = config
			.nat
			.enabled
			.then(|| Arc::new(NftFilter::new().with_binary(config.nat.nft_binary.clone())) as Arc<dyn PacketFilter>);
		let private_key = load_key_env(PRIVATE_KEY_ENV)?.map(|kp| kp.private_key().clone());
		Ok(Self {
			client,
			backend,
			filter,
			private_key,
		})
	}
}

/// Watcher, endpoint discovery and address configuration wired together.
pub struct MeshDaemon {
	watcher: Arc<Watcher>,
	backend: Arc<dyn Backend>,
	epdisc: Arc<EndpointDiscovery>,
	queues: Vec<Arc<EventQueue>>,
	watcher_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MeshDaemon {
	pub async fn new(config: &MeshConfig, components: Components) -> Result<Self> {
		let Components {
			client,
			backend,
			filter,
			private_key,
		} = components;

		let watcher_config = WatcherConfig::new(&config.watcher.interface_filter)?
			.with_interval(Duration::from_secs(config.watcher.interval_secs))
			.with_socket_dir(config.watcher.userspace_socket_dir.clone())
			.with_watch_links(config.watcher.watch_links);
		let watcher = Arc::new(Watcher::new(Arc::clone(&client), watcher_config));

		let mut epdisc = EndpointDiscovery::new(
			Arc::clone(&client),
			Arc::clone(&backend),
			watcher.events(),
			endpoint_discovery_config(&config.ice).await,
		);
		if let Some(filter) = filter {
			epdisc = epdisc.with_packet_filter(filter);
		}
		let epdisc = Arc::new(epdisc);

		let mut queues = Vec::new();
		if let Some(key) = private_key {
			let queue = EventQueue::spawn(Arc::new(KeyAssigner::new(Arc::clone(&client), key)));
			watcher.on_interface(queue.clone());
			queues.push(queue);
		}
		let queue = EventQueue::spawn(epdisc.clone());
		watcher.on_all(queue.clone());
		queues.push(queue);
		if config.autocfg.link_local_addresses {
			let queue = EventQueue::spawn(Arc::new(AddressConfigurator::new(Arc::clone(&client))));
			watcher.on_interface(queue.clone());
			queues.push(queue);
		}

		info!(
			client = client.kind(),
			backend = backend.kind(),
			autocfg = config.autocfg.link_local_addresses,
			"mesh daemon ready"
		);
		Ok(Self {
			watcher,
			backend,
			epdisc,
			queues,
			watcher_task: tokio::sync::Mutex::new(None),
		})
	}

	pub fn endpoint_discovery(&self) -> &Arc<EndpointDiscovery> {
		&self.epdisc
	}

	pub fn watcher(&self) -> &Arc<Watcher> {
		&self.watcher
	}

	/// Waits until every event raised so far has been handled.
	pub async fn settled(&self) {
		for queue in &self.queues {
			queue.settled().await;
		}
	}

	/// Syncs once, then follows the devices until `shutdown` flips.
	///
	/// A non-zero `status_interval` logs the status of every interface.
	#[instrument(skip_all)]
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>, status_interval: Option<Duration>) -> Result<()> {
		self.watcher.sync().await?;
		*self.watcher_task.lock().await = Some(Arc::clone(&self.watcher).spawn());

		let mut status_tick = status_interval.map(tokio::time::interval);
		loop {
			tokio::select! {
				biased;

				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}

				_ = tick(&mut status_tick) => self.log_status().await,
			}
		}

		self.close().await;
		Ok(())
	}

	async fn log_status(&self) {
		for intf in self.epdisc.marshal().await {
			match serde_json::to_string(&intf) {
				Ok(status) => info!(intf = %intf.name, %status, "interface status"),
				Err(e) => warn!(intf = %intf.name, error = %e, "failed to encode status"),
			}
		}
	}

	/// Stops the watcher, drains queued events and closes endpoint discovery.
	pub async fn close(&self) {
		self.watcher.close();
		if let Some(task) = self.watcher_task.lock().await.take() {
			let _ = task.await;
		}
		self.settled().await;

		self.epdisc.close().await;
		for queue in &self.queues {
			queue.close().await;
		}
		if let Err(e) = self.backend.close().await {
			debug!(error = %e, "failed to close signaling backend");
		}
		info!("mesh daemon stopped");
	}
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
	match interval {
		Some(interval) => {
			interval.tick().await;
		}
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{AutocfgConfig, WatcherConfig as WatcherSection};
	use loom_mesh_common::ConnectionState;
	use loom_mesh_device::{DeviceConfig, InterfaceType, MemoryWireGuard, PeerConfig};
	use loom_mesh_nat::MemoryFilter;
	use loom_mesh_signaling::{InProcessBackend, InProcessHub};
	use std::net::{IpAddr, Ipv4Addr};

	fn config() -> MeshConfig {
		MeshConfig {
			watcher: WatcherSection {
				watch_links: false,
				userspace_socket_dir: "/nonexistent".into(),
				..Default::default()
			},
			ice: IceSection {
				stun_servers: Vec::new(),
				host_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
				mux_port_min: 0,
				mux_port_max: 0,
				..Default::default()
			},
			autocfg: AutocfgConfig {
				link_local_addresses: true,
			},
			..Default::default()
		}
	}

	#[tokio::test]
	async fn ice_config_carries_timeouts() {
		let section = IceSection {
			stun_servers: vec!["127.0.0.1:3478".to_string()],
			failed_timeout_secs: 40,
			..Default::default()
		};
		let ice = ice_config(&section).await;
		assert_eq!(ice.failed_timeout, Duration::from_secs(40));
		assert_eq!(ice.stun_servers, vec!["127.0.0.1:3478".parse().unwrap()]);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn daemon_follows_devices_until_shutdown() {
		let client = Arc::new(MemoryWireGuard::new());
		let key = WgPrivateKey::generate();
		client
			.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::from_bytes([0u8; 32]), 51820)
			.await
			.unwrap();
		let peer = WgPrivateKey::generate().public_key();
		client
			.configure_device("wg0", DeviceConfig::new().with_peer(PeerConfig::new(peer)))
			.await
			.unwrap();

		let filter = Arc::new(MemoryFilter::new());
		let daemon = Arc::new(
			MeshDaemon::new(
				&config(),
				Components {
					client: client.clone(),
					backend: Arc::new(InProcessBackend::new(InProcessHub::new())),
					filter: Some(filter.clone()),
					private_key: Some(key.clone()),
				},
			)
			.await
			.unwrap(),
		);

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let run = tokio::spawn({
			let daemon = daemon.clone();
			async move { daemon.run(shutdown_rx, Some(Duration::from_millis(100))).await }
		});

		let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
		loop {
			daemon.settled().await;
			let intf = daemon.endpoint_discovery().interface("wg0").await;
			let engine = daemon.endpoint_discovery().peer("wg0", &peer).await;
			if intf.as_ref().is_some_and(|i| i.public_key() == key.public_key())
				&& engine.is_some_and(|e| e.state() == ConnectionState::Idle)
			{
				break;
			}
			assert!(tokio::time::Instant::now() < deadline, "interface did not settle");
			tokio::time::sleep(Duration::from_millis(50)).await;
		}

		let addrs = client.addresses("wg0").await.unwrap();
		assert!(addrs.contains(&key.public_key().ipv4_address()));
		assert!(filter.has_table("mesh-wg0").await);

		shutdown_tx.send(true).unwrap();
		run.await.unwrap().unwrap();
		assert!(daemon.endpoint_discovery().interfaces().await.is_empty());
		assert!(!filter.has_table("mesh-wg0").await);
	}
}
