// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use crate::events::{Event, EventHandler, Handlers};
use crate::monitor::{monitor_links, watch_socket_dir};
use loom_mesh_device::{
	diff_interfaces, diff_peers, interface_modifier, peer_diff, InterfaceSnapshot, WireGuardClient,
	DEFAULT_SOCKET_DIR,
};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WatcherConfig {
	pub interval: Duration,
	pub filter: Regex,
	pub socket_dir: PathBuf,
	pub watch_links: bool,
	pub ip_binary: String,
}

impl WatcherConfig {
	pub fn new(filter: &str) -> Result<Self> {
		Ok(Self {
			filter: Regex::new(filter)?,
			..Self::default()
		})
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.socket_dir = dir.into();
		self
	}

	pub fn with_watch_links(mut self, watch_links: bool) -> Self {
		self.watch_links = watch_links;
		self
	}
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			interval: DEFAULT_INTERVAL,
			filter: Regex::new(".*").unwrap_or_else(|_| unreachable!("match-all pattern is valid")),
			socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
			watch_links: true,
			ip_binary: "ip".to_string(),
		}
	}
}

/// Reconciles observed devices against a cached snapshot and emits events.
pub struct Watcher {
	client: Arc<dyn WireGuardClient>,
	config: WatcherConfig,
	devices: Mutex<Vec<InterfaceSnapshot>>,
	handlers: Arc<Handlers>,
	trigger_tx: mpsc::Sender<()>,
	trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
	shutdown_tx: watch::Sender<bool>,
}

impl Watcher {
	pub fn new(client: Arc<dyn WireGuardClient>, config: WatcherConfig) -> Self {
		let (trigger_tx, trigger_rx) = mpsc::channel(1);
		let (shutdown_tx, _) = watch::channel(false);
		Self {
			client,
			config,
			devices: Mutex::new(Vec::new()),
			handlers: Arc::new(Handlers::new()),
			trigger_tx,
			trigger_rx: Mutex::new(Some(trigger_rx)),
			shutdown_tx,
		}
	}

	pub fn on_all(&self, handler: Arc<dyn EventHandler>) {
		self.handlers.on_all(handler);
	}

	pub fn on_interface(&self, handler: Arc<dyn EventHandler>) {
		self.handlers.on_interface(handler);
	}

	pub fn on_peer(&self, interface: &str, handler: Arc<dyn EventHandler>) {
		self.handlers.on_peer(interface, handler);
	}

	/// Sink for events raised outside the watcher, such as peer state changes.
	pub fn events(&self) -> Arc<dyn EventHandler> {
		Arc::clone(&self.handlers) as Arc<dyn EventHandler>
	}

	/// Requests a sync ahead of the next tick.
	pub fn trigger(&self) {
		let _ = self.trigger_tx.try_send(());
	}

	pub async fn interface(&self, name: &str) -> Option<InterfaceSnapshot> {
		self.devices.lock().await.iter().find(|i| i.name == name).cloned()
	}

	pub async fn interfaces(&self) -> Vec<InterfaceSnapshot> {
		self.devices.lock().await.clone()
	}

	/// Fetches devices once and emits the resulting events.
	#[instrument(skip(self))]
	pub async fn sync(&self) -> Result<()> {
		let mut fresh: Vec<InterfaceSnapshot> = self
			.client
			.list_devices()
			.await?
			.into_iter()
			.filter(|i| self.config.filter.is_match(&i.name))
			.collect();
		fresh.sort_by(|a, b| a.name.cmp(&b.name));
		for intf in &mut fresh {
			intf.sort_peers();
		}

		let mut cache = self.devices.lock().await;
		let diff = diff_interfaces(&cache, &fresh);

		for intf in &diff.added {
			info!(intf = %intf.name, kind = %intf.interface_type, "interface added");
			self.emit(Event::InterfaceAdded(intf.clone()));
			for peer in &intf.peers {
				self.emit(Event::PeerAdded {
					interface: intf.name.clone(),
					peer: peer.clone(),
				});
			}
		}

		for (old, new) in &diff.kept {
			self.sync_interface(old, new);
		}

		for intf in &diff.removed {
			info!(intf = %intf.name, "interface removed");
			for peer in &intf.peers {
				self.emit(Event::PeerRemoved {
					interface: intf.name.clone(),
					peer: peer.clone(),
				});
			}
			self.emit(Event::InterfaceRemoved(intf.clone()));
		}

		*cache = fresh;
		Ok(())
	}

	/// Interface changes are reported before peer changes, so handlers see
	/// the new listen port and key when they set up added peers.
	fn sync_interface(&self, old: &InterfaceSnapshot, new: &InterfaceSnapshot) {
		let modified = interface_modifier(old, new);
		let peers = diff_peers(&old.peers, &new.peers);

		if !modified.is_empty() {
			debug!(intf = %new.name, %modified, "interface modified");
			self.emit(Event::InterfaceModified {
				interface: new.clone(),
				old: old.clone(),
				modified,
			});
		}

		for peer in &peers.removed {
			debug!(intf = %new.name, peer = %peer.public_key, "peer removed");
			self.emit(Event::PeerRemoved {
				interface: new.name.clone(),
				peer: peer.clone(),
			});
		}

		for peer in &peers.added {
			debug!(intf = %new.name, peer = %peer.public_key, "peer added");
			self.emit(Event::PeerAdded {
				interface: new.name.clone(),
				peer: peer.clone(),
			});
		}

		for (old_peer, new_peer) in &peers.kept {
			let diff = peer_diff(old_peer, new_peer);
			if diff.modified.is_empty() {
				continue;
			}
			self.emit(Event::PeerModified {
				interface: new.name.clone(),
				peer: new_peer.clone(),
				old: old_peer.clone(),
				modified: diff.modified,
				ips_added: diff.ips_added,
				ips_removed: diff.ips_removed,
			});
		}
	}

	fn emit(&self, event: Event) {
		self.handlers.dispatch(&event);
	}

	/// Runs until [`Watcher::close`].
	pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
		tokio::spawn(async move { self.run().await })
	}

	pub async fn run(self: Arc<Self>) {
		let Some(mut trigger_rx) = self.trigger_rx.lock().await.take() else {
			warn!("watcher already running");
			return;
		};
		let mut shutdown_rx = self.shutdown_tx.subscribe();

		if self.config.watch_links {
			tokio::spawn(monitor_links(
				self.config.ip_binary.clone(),
				self.trigger_tx.clone(),
				self.shutdown_tx.subscribe(),
			));
		}

		let _socket_watch = if self.config.socket_dir.is_dir() {
			match watch_socket_dir(&self.config.socket_dir, self.trigger_tx.clone()) {
				Ok(w) => Some(w),
				Err(e) => {
					warn!(error = %e, "failed to watch userspace socket directory");
					None
				}
			}
		} else {
			None
		};

		let mut ticker = tokio::time::interval(self.config.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		info!(interval = ?self.config.interval, filter = %self.config.filter, "watcher started");

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						info!("watcher stopped");
						break;
					}
				}

				_ = ticker.tick() => {}

				Some(()) = trigger_rx.recv() => {
					debug!("sync triggered");
				}
			}

			if let Err(e) = self.sync().await {
				warn!(error = %e, "failed to synchronize devices");
			}
		}
	}

	pub fn close(&self) {
		let _ = self.shutdown_tx.send(true);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_mesh_common::WgPrivateKey;
	use loom_mesh_device::{InterfaceType, MemoryWireGuard};
	use std::sync::Mutex as StdMutex;

	#[derive(Default)]
	struct Recorder(StdMutex<Vec<Event>>);

	impl EventHandler for Recorder {
		fn on_event(&self, event: &Event) {
			self.0.lock().unwrap().push(event.clone());
		}
	}

	#[tokio::test]
	async fn filter_excludes_unmatched_interfaces() {
		let wg = Arc::new(MemoryWireGuard::new());
		wg.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 0)
			.await
			.unwrap();
		wg.add_device("eth-wg", InterfaceType::Kernel, WgPrivateKey::generate(), 0)
			.await
			.unwrap();

		let watcher = Watcher::new(wg, WatcherConfig::new("^wg").unwrap().with_watch_links(false));
		let recorder = Arc::new(Recorder::default());
		watcher.on_all(recorder.clone());
		watcher.sync().await.unwrap();

		let events = recorder.0.lock().unwrap();
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].interface_name(), "wg0");
	}

	#[tokio::test]
	async fn unchanged_devices_emit_nothing() {
		let wg = Arc::new(MemoryWireGuard::new());
		wg.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 51820)
			.await
			.unwrap();

		let watcher = Watcher::new(wg, WatcherConfig::default().with_watch_links(false));
		watcher.sync().await.unwrap();

		let recorder = Arc::new(Recorder::default());
		watcher.on_all(recorder.clone());
		watcher.sync().await.unwrap();
		assert!(recorder.0.lock().unwrap().is_empty());
	}

	#[test]
	fn invalid_filter_is_rejected() {
		assert!(WatcherConfig::new("(unclosed").is_err());
	}

	#[tokio::test]
	async fn close_stops_run_loop() {
		let wg = Arc::new(MemoryWireGuard::new());
		let config = WatcherConfig::default()
			.with_watch_links(false)
			.with_interval(Duration::from_millis(10))
			.with_socket_dir("/nonexistent");
		let watcher = Arc::new(Watcher::new(wg, config));
		let handle = Arc::clone(&watcher).spawn();

		tokio::time::sleep(Duration::from_millis(30)).await;
		watcher.close();
		tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.unwrap()
			.unwrap();
	}
}
