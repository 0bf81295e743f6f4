// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::EndpointDiscoveryConfig;
use crate::error::{EpdiscError, Result};
use crate::peer::PeerEngine;
use crate::status::{InterfaceStatus, NatType};
use loom_mesh_common::{KeyPair, WgPrivateKey, WgPublicKey};
use loom_mesh_conn::{IceConfig, UdpMux};
use loom_mesh_device::{InterfaceSnapshot, InterfaceType, PeerSnapshot, UserBind, WireGuardClient};
use loom_mesh_nat::{Nat, NatRule, PacketFilter};
use loom_mesh_signaling::Backend;
use loom_mesh_watcher::EventHandler;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Collaborators shared by every interface of the feature.
#[derive(Clone)]
pub(crate) struct Services {
	pub client: Arc<dyn WireGuardClient>,
	pub backend: Arc<dyn Backend>,
	pub events: Arc<dyn EventHandler>,
	pub filter: Option<Arc<dyn PacketFilter>>,
	pub config: EndpointDiscoveryConfig,
}

/// What a peer engine needs from its interface.
pub(crate) struct InterfaceContext {
	pub name: String,
	pub interface_type: InterfaceType,
	pub client: Arc<dyn WireGuardClient>,
	pub backend: Arc<dyn Backend>,
	pub events: Arc<dyn EventHandler>,
	pub mux: Arc<UdpMux>,
	pub mux_srflx: Arc<UdpMux>,
	pub nat: Option<Arc<Nat>>,
	pub user_bind: Option<Arc<dyn UserBind>>,
	pub ice: IceConfig,
	pub restart_on_disconnect: bool,
	private_key: StdRwLock<WgPrivateKey>,
	listen_port: AtomicU16,
}

impl InterfaceContext {
	pub fn private_key(&self) -> WgPrivateKey {
		self.private_key.read().unwrap_or_else(|e| e.into_inner()).clone()
	}

	pub fn public_key(&self) -> WgPublicKey {
		self.private_key.read().unwrap_or_else(|e| e.into_inner()).public_key()
	}

	fn set_private_key(&self, key: WgPrivateKey) {
		*self.private_key.write().unwrap_or_else(|e| e.into_inner()) = key;
	}

	pub fn listen_port(&self) -> u16 {
		self.listen_port.load(Ordering::Acquire)
	}

	pub fn key_pair(&self, theirs: WgPublicKey) -> KeyPair {
		KeyPair::new(self.private_key(), theirs)
	}
}

/// A WireGuard device under endpoint discovery.
///
/// Owns the two muxes, the NAT table and the engines of its peers.
pub struct Interface {
	ctx: Arc<InterfaceContext>,
	ingress: Mutex<Vec<NatRule>>,
	peers: RwLock<HashMap<WgPublicKey, Arc<PeerEngine>>>,
}

impl Interface {
	#[instrument(skip_all, fields(intf = %snapshot.name))]
	pub(crate) async fn new(snapshot: &InterfaceSnapshot, services: &Services) -> Result<Self> {
		let config = &services.config;
		let (mux, mux_srflx) = bind_muxes(config).await?;

		let user_bind = services.client.user_bind(&snapshot.name).await;
		let nat = match (&user_bind, &services.filter) {
			(None, Some(filter)) => match Nat::new(Arc::clone(filter), &snapshot.name).await {
				Ok(nat) => Some(Arc::new(nat)),
				Err(e) => {
					warn!(error = %e, "failed to set up NAT, using loopback proxy");
					None
				}
			},
			_ => None,
		};

		let ctx = Arc::new(InterfaceContext {
			name: snapshot.name.clone(),
			interface_type: snapshot.interface_type,
			client: Arc::clone(&services.client),
			backend: Arc::clone(&services.backend),
			events: Arc::clone(&services.events),
			mux,
			mux_srflx,
			nat,
			user_bind,
			ice: config.ice.clone(),
			restart_on_disconnect: config.restart_on_disconnect,
			private_key: StdRwLock::new(snapshot.private_key.clone()),
			listen_port: AtomicU16::new(snapshot.listen_port),
		});

		let intf = Self {
			ctx,
			ingress: Mutex::new(Vec::new()),
			peers: RwLock::new(HashMap::new()),
		};
		intf.install_ingress(snapshot.listen_port).await;

		info!(
			mux_port = intf.ctx.mux.port(),
			mux_srflx_port = intf.ctx.mux_srflx.port(),
			nat = intf.ctx.nat.is_some(),
			user_bind = intf.ctx.user_bind.is_some(),
			"added interface"
		);
		Ok(intf)
	}

	pub fn name(&self) -> &str {
		&self.ctx.name
	}

	pub fn public_key(&self) -> WgPublicKey {
		self.ctx.public_key()
	}

	pub fn listen_port(&self) -> u16 {
		self.ctx.listen_port()
	}

	pub fn mux_addr(&self) -> SocketAddr {
		self.ctx.mux.local_addr()
	}

	pub fn mux_srflx_addr(&self) -> SocketAddr {
		self.ctx.mux_srflx.local_addr()
	}

	pub fn nat(&self) -> Option<&Arc<Nat>> {
		self.ctx.nat.as_ref()
	}

	/// Number of installed ingress redirects.
	pub async fn ingress_rules(&self) -> usize {
		self.ingress.lock().await.len()
	}

	/// Replaces the ingress redirects of both muxes with ones for `listen_port`.
	///
	/// The new rules are added before the old ones are removed. If any add
	/// fails, the rules added so far are withdrawn, the previous rules stay
	/// and the NAT is marked degraded.
	async fn install_ingress(&self, listen_port: u16) {
		let Some(nat) = &self.ctx.nat else {
			return;
		};
		let mut ingress = self.ingress.lock().await;

		let mut added = Vec::with_capacity(2);
		if listen_port != 0 {
			for mux in [&self.ctx.mux, &self.ctx.mux_srflx] {
				match nat.redirect_non_stun(mux.port(), listen_port).await {
					Ok(rule) => added.push(rule),
					Err(e) => {
						warn!(
							intf = %self.ctx.name,
							mux_port = mux.port(),
							error = %e,
							"failed to install ingress rule, peers fall back to loopback proxy"
						);
						nat.set_degraded(true);
						for rule in added {
							let _ = rule.delete().await;
						}
						return;
					}
				}
			}
		}

		for rule in std::mem::replace(&mut *ingress, added) {
			if let Err(e) = rule.delete().await {
				warn!(intf = %self.ctx.name, handle = rule.handle(), error = %e, "failed to remove ingress rule");
			}
		}
		nat.set_degraded(false);
		debug!(intf = %self.ctx.name, listen_port, rules = ingress.len(), "installed ingress rules");
	}

	/// Starts an engine for a peer. An existing engine is kept.
	#[instrument(skip_all, fields(intf = %self.ctx.name, peer = %peer.public_key))]
	pub async fn add_peer(&self, peer: &PeerSnapshot) -> Result<Arc<PeerEngine>> {
		if let Some(engine) = self.peers.read().await.get(&peer.public_key) {
			return Ok(Arc::clone(engine));
		}

		let engine = Arc::new(PeerEngine::new(peer, Arc::clone(&self.ctx)).await?);
		let mut peers = self.peers.write().await;
		if let Some(existing) = peers.get(&peer.public_key) {
			let existing = Arc::clone(existing);
			drop(peers);
			engine.close().await;
			return Ok(existing);
		}
		peers.insert(peer.public_key, Arc::clone(&engine));
		Ok(engine)
	}

	pub async fn remove_peer(&self, public_key: &WgPublicKey) -> Result<()> {
		let engine = self
			.peers
			.write()
			.await
			.remove(public_key)
			.ok_or(EpdiscError::PeerNotFound(*public_key))?;
		engine.close().await;
		info!(intf = %self.ctx.name, peer = %public_key, "removed peer");
		Ok(())
	}

	pub async fn peer(&self, public_key: &WgPublicKey) -> Option<Arc<PeerEngine>> {
		self.peers.read().await.get(public_key).cloned()
	}

	pub async fn peers(&self) -> Vec<Arc<PeerEngine>> {
		let mut peers: Vec<_> = self.peers.read().await.values().cloned().collect();
		peers.sort_by_key(|p| p.public_key());
		peers
	}

	/// Moves ingress redirects and every engine's path to a new listen port.
	#[instrument(skip(self), fields(intf = %self.ctx.name))]
	pub async fn update_listen_port(&self, listen_port: u16) {
		let old = self.ctx.listen_port.swap(listen_port, Ordering::AcqRel);
		if old == listen_port {
			return;
		}
		info!(old, new = listen_port, "listen port changed");

		self.install_ingress(listen_port).await;
		for engine in self.peers().await {
			engine.update_listen_port(listen_port).await;
		}
	}

	/// Switches every engine's signaling subscription to a new private key.
	///
	/// All engines are attempted. The first failure is returned.
	#[instrument(skip_all, fields(intf = %self.ctx.name))]
	pub async fn update_private_key(&self, private_key: WgPrivateKey) -> Result<()> {
		self.ctx.set_private_key(private_key);
		info!(public_key = %self.ctx.public_key(), "private key changed");

		let mut result = Ok(());
		for engine in self.peers().await {
			if let Err(e) = engine.resubscribe().await {
				warn!(peer = %engine.public_key(), error = %e, "failed to resubscribe");
				if result.is_ok() {
					result = Err(e);
				}
			}
		}
		result
	}

	/// Keeps engines from restarting their sessions.
	pub async fn mark_closing(&self) {
		for engine in self.peers().await {
			engine.mark_closing();
		}
	}

	/// Closes all engines, the muxes and the NAT table.
	#[instrument(skip(self), fields(intf = %self.ctx.name))]
	pub async fn close(&self) -> Result<()> {
		let engines: Vec<_> = self.peers.write().await.drain().map(|(_, e)| e).collect();
		for engine in &engines {
			engine.mark_closing();
		}
		for engine in engines {
			engine.close().await;
		}

		for rule in self.ingress.lock().await.drain(..) {
			let _ = rule.delete().await;
		}
		let result = match &self.ctx.nat {
			Some(nat) => nat.close().await.map_err(EpdiscError::from),
			None => Ok(()),
		};
		self.ctx.mux.close();
		self.ctx.mux_srflx.close();
		info!("closed interface");
		result
	}

	pub async fn marshal(&self) -> InterfaceStatus {
		let mut peers = Vec::new();
		for engine in self.peers().await {
			peers.push(engine.marshal());
		}

		InterfaceStatus {
			name: self.ctx.name.clone(),
			interface_type: self.ctx.interface_type,
			public_key: self.ctx.public_key(),
			listen_port: self.ctx.listen_port(),
			mux_port: self.ctx.mux.port(),
			mux_srflx_port: self.ctx.mux_srflx.port(),
			nat_type: if self.ctx.nat.is_some() {
				NatType::NfTables
			} else {
				NatType::None
			},
			peers,
		}
	}
}

async fn bind_muxes(config: &EndpointDiscoveryConfig) -> Result<(Arc<UdpMux>, Arc<UdpMux>)> {
	let ip = config.mux_bind_address;
	if config.mux_port_min == 0 {
		let mux = UdpMux::bind(SocketAddr::new(ip, 0)).await?;
		let mux_srflx = UdpMux::bind(SocketAddr::new(ip, 0)).await?;
		return Ok((mux, mux_srflx));
	}

	let mux = UdpMux::bind_in_range(ip, config.mux_port_min, config.mux_port_max).await?;
	match UdpMux::bind_in_range(ip, mux.port().saturating_add(1), config.mux_port_max).await {
		Ok(mux_srflx) => Ok((mux, mux_srflx)),
		Err(e) => {
			mux.close();
			Err(e.into())
		}
	}
}
