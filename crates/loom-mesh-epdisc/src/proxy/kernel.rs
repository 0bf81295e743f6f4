// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use super::Proxy;
use crate::error::{EpdiscError, Result};
use crate::status::ProxyType;
use async_trait::async_trait;
use loom_mesh_common::{CandidateType, PacketConn, WgPublicKey};
use loom_mesh_conn::CandidatePair;
use loom_mesh_nat::{Nat, NatRule};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tracing::{debug, instrument, trace, warn};

const MAX_DATAGRAM: usize = 65535;

struct Masquerade {
	rule: NatRule,
	remote: SocketAddr,
	candidate_port: u16,
	listen_port: u16,
}

/// Loopback socket WireGuard talks to when the path needs userspace relaying.
struct Shim {
	socket: Arc<UdpSocket>,
	stop_tx: watch::Sender<bool>,
}

impl Shim {
	fn stop(&self) {
		let _ = self.stop_tx.send(true);
	}
}

struct KernelState {
	listen_port: u16,
	conn: Option<Arc<dyn PacketConn>>,
	/// Remote address and candidate port of a pair WireGuard could reach
	/// directly, whether or not the masquerade rule is installed.
	direct: Option<(SocketAddr, u16)>,
	masquerade: Option<Masquerade>,
	shim: Option<Shim>,
}

/// Proxy for kernel WireGuard devices.
///
/// Host and server reflexive pairs are expressed as a source port rewrite,
/// so WireGuard sends straight to the remote candidate. Other pairs, and all
/// pairs when no NAT is available, go through a loopback shim that copies
/// datagrams to and from the ICE connection.
pub struct KernelProxy {
	peer: WgPublicKey,
	nat: Option<Arc<Nat>>,
	state: Mutex<KernelState>,
	proxy_type: StdMutex<ProxyType>,
}

impl KernelProxy {
	pub fn new(peer: WgPublicKey, nat: Option<Arc<Nat>>, listen_port: u16) -> Self {
		Self {
			peer,
			nat,
			state: Mutex::new(KernelState {
				listen_port,
				conn: None,
				direct: None,
				masquerade: None,
				shim: None,
			}),
			proxy_type: StdMutex::new(ProxyType::NoProxy),
		}
	}

	/// The NAT, unless its ingress redirects are incomplete.
	fn usable_nat(&self) -> Option<&Arc<Nat>> {
		self.nat.as_ref().filter(|nat| !nat.is_degraded())
	}

	fn set_proxy_type(&self, proxy_type: ProxyType) {
		*self.proxy_type.lock().unwrap_or_else(|e| e.into_inner()) = proxy_type;
	}

	async fn masquerade(
		&self,
		nat: &Nat,
		state: &mut KernelState,
		remote: SocketAddr,
		candidate_port: u16,
	) -> Result<()> {
		let listen_port = state.listen_port;
		if let Some(m) = &state.masquerade {
			if m.remote == remote && m.candidate_port == candidate_port && m.listen_port == listen_port {
				return Ok(());
			}
		}
		remove_masquerade(state).await;

		let rule = nat.masquerade_source(listen_port, remote, candidate_port).await?;
		state.masquerade = Some(Masquerade {
			rule,
			remote,
			candidate_port,
			listen_port,
		});
		Ok(())
	}

	async fn start_shim(&self, state: &mut KernelState, conn: Arc<dyn PacketConn>) -> Result<SocketAddr> {
		let (stop_tx, stop_rx) = watch::channel(false);
		let socket = match state.shim.take() {
			Some(shim) => {
				shim.stop();
				shim.socket
			}
			None => {
				let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
					.await
					.map_err(|e| EpdiscError::ProxyInit(e.to_string()))?;
				socket
					.connect((Ipv4Addr::LOCALHOST, state.listen_port))
					.await
					.map_err(|e| EpdiscError::ProxyInit(e.to_string()))?;
				Arc::new(socket)
			}
		};

		let addr = socket.local_addr()?;
		tokio::spawn(device_to_conn(
			Arc::clone(&socket),
			Arc::clone(&conn),
			stop_rx.clone(),
		));
		tokio::spawn(conn_to_device(Arc::clone(&socket), conn, stop_rx));
		state.shim = Some(Shim { socket, stop_tx });
		debug!(peer = %self.peer, %addr, "loopback proxy started");
		Ok(addr)
	}
}

async fn remove_masquerade(state: &mut KernelState) {
	if let Some(m) = state.masquerade.take() {
		if let Err(e) = m.rule.delete().await {
			warn!(handle = m.rule.handle(), error = %e, "failed to remove masquerade rule");
		}
	}
}

fn stop_shim(state: &mut KernelState) {
	if let Some(shim) = state.shim.take() {
		shim.stop();
	}
}

#[async_trait]
impl Proxy for KernelProxy {
	#[instrument(skip(self, pair, conn), fields(peer = %self.peer, local = %pair.local, remote = %pair.remote))]
	async fn update_candidate_pair(&self, pair: &CandidatePair, conn: Arc<dyn PacketConn>) -> Result<SocketAddr> {
		let mut state = self.state.lock().await;
		state.conn = Some(Arc::clone(&conn));
		let local = &pair.local;
		let remote = pair.remote.socket_addr();

		let direct = matches!(
			local.candidate_type,
			CandidateType::Host | CandidateType::ServerReflexive
		);
		// A server reflexive candidate is mapped from the port of its base.
		let candidate_port = local.related_address.map(|r| r.port).unwrap_or(local.port);
		state.direct = direct.then_some((remote, candidate_port));
		if let (true, Some(nat)) = (direct, self.usable_nat()) {
			match self.masquerade(nat, &mut state, remote, candidate_port).await {
				Ok(()) => {
					stop_shim(&mut state);
					self.set_proxy_type(ProxyType::KernelNat);
					debug!(candidate_port, "WireGuard sends to remote candidate directly");
					return Ok(remote);
				}
				Err(e) => warn!(error = %e, "failed to install masquerade rule, using loopback proxy"),
			}
		}

		remove_masquerade(&mut state).await;
		let addr = self.start_shim(&mut state, conn).await?;
		self.set_proxy_type(ProxyType::KernelConn);
		Ok(addr)
	}

	async fn update_listen_port(&self, listen_port: u16) -> Result<Option<SocketAddr>> {
		let mut state = self.state.lock().await;
		if state.listen_port == listen_port {
			return Ok(None);
		}
		state.listen_port = listen_port;

		if let Some(shim) = &state.shim {
			shim.socket.connect((Ipv4Addr::LOCALHOST, listen_port)).await?;
		}

		let Some((remote, candidate_port)) = state.direct else {
			debug!(peer = %self.peer, listen_port, "proxy follows new listen port");
			return Ok(None);
		};
		let was_direct = state.masquerade.is_some();
		if let Some(nat) = self.usable_nat() {
			match self.masquerade(nat, &mut state, remote, candidate_port).await {
				Ok(()) if was_direct => {
					debug!(peer = %self.peer, listen_port, "masquerade rule follows new listen port");
					return Ok(None);
				}
				Ok(()) => {
					stop_shim(&mut state);
					self.set_proxy_type(ProxyType::KernelNat);
					debug!(peer = %self.peer, listen_port, "NAT usable again, WireGuard sends to remote candidate directly");
					return Ok(Some(remote));
				}
				Err(e) => warn!(peer = %self.peer, error = %e, "failed to reinstall masquerade rule"),
			}
		}

		remove_masquerade(&mut state).await;
		if !was_direct {
			return Ok(None);
		}
		let Some(conn) = state.conn.clone() else {
			return Ok(None);
		};
		let addr = self.start_shim(&mut state, conn).await?;
		self.set_proxy_type(ProxyType::KernelConn);
		Ok(Some(addr))
	}

	fn proxy_type(&self) -> ProxyType {
		*self.proxy_type.lock().unwrap_or_else(|e| e.into_inner())
	}

	async fn close(&self) -> Result<()> {
		let mut state = self.state.lock().await;
		state.conn = None;
		state.direct = None;
		stop_shim(&mut state);
		remove_masquerade(&mut state).await;
		self.set_proxy_type(ProxyType::NoProxy);
		Ok(())
	}
}

impl Drop for KernelProxy {
	fn drop(&mut self) {
		// The masquerade rule removes itself when dropped.
		stop_shim(self.state.get_mut());
	}
}

async fn device_to_conn(socket: Arc<UdpSocket>, conn: Arc<dyn PacketConn>, mut stop_rx: watch::Receiver<bool>) {
	let mut buf = vec![0u8; MAX_DATAGRAM];
	loop {
		let n = tokio::select! {
			biased;

			_ = stop_rx.changed() => break,

			result = socket.recv(&mut buf) => match result {
				Ok(n) => n,
				Err(e) => {
					// Refused while WireGuard is not listening.
					trace!(error = %e, "loopback receive failed");
					continue;
				}
			}
		};

		if let Err(e) = conn.send(&buf[..n]).await {
			if e.kind() == io::ErrorKind::NotConnected {
				break;
			}
			trace!(error = %e, "failed to forward datagram to peer");
		}
	}
}

async fn conn_to_device(socket: Arc<UdpSocket>, conn: Arc<dyn PacketConn>, mut stop_rx: watch::Receiver<bool>) {
	let mut buf = vec![0u8; MAX_DATAGRAM];
	loop {
		let n = tokio::select! {
			biased;

			_ = stop_rx.changed() => break,

			result = conn.recv(&mut buf) => match result {
				Ok(n) => n,
				Err(e) => {
					debug!(error = %e, "peer connection closed, stopping loopback proxy");
					break;
				}
			}
		};

		if let Err(e) = socket.send(&buf[..n]).await {
			trace!(error = %e, "failed to forward datagram to WireGuard");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{candidate, pair, pipe};
	use loom_mesh_nat::{MemoryFilter, Rule};
	use std::time::Duration;

	async fn nat(filter: &Arc<MemoryFilter>) -> Arc<Nat> {
		Arc::new(Nat::new(filter.clone(), "wg0").await.unwrap())
	}

	fn peer() -> WgPublicKey {
		*loom_mesh_common::WgKeyPair::generate().public_key()
	}

	fn conn() -> (Arc<dyn PacketConn>, crate::testing::PipeConn) {
		let (ours, theirs) = pipe("127.0.0.1:40000".parse().unwrap(), "198.51.100.7:33000".parse().unwrap());
		(Arc::new(ours), theirs)
	}

	#[tokio::test]
	async fn host_pair_masquerades_listen_port() {
		let filter = Arc::new(MemoryFilter::new());
		let proxy = KernelProxy::new(peer(), Some(nat(&filter).await), 51820);
		let (conn, _remote) = conn();

		let p = pair(
			candidate(CandidateType::Host, "192.0.2.1:40000", None),
			candidate(CandidateType::Host, "198.51.100.7:33000", None),
		);
		let endpoint = proxy.update_candidate_pair(&p, conn).await.unwrap();
		assert_eq!(endpoint, "198.51.100.7:33000".parse().unwrap());
		assert_eq!(proxy.proxy_type(), ProxyType::KernelNat);
		assert_eq!(
			filter.rules("mesh-wg0").await,
			vec![Rule::MasqueradeSource {
				listen_port: 51820,
				remote: endpoint,
				candidate_port: 40000,
			}]
		);

		proxy.close().await.unwrap();
		assert!(filter.rules("mesh-wg0").await.is_empty());
		assert_eq!(proxy.proxy_type(), ProxyType::NoProxy);
	}

	#[tokio::test]
	async fn server_reflexive_pair_uses_base_port() {
		let filter = Arc::new(MemoryFilter::new());
		let proxy = KernelProxy::new(peer(), Some(nat(&filter).await), 51820);
		let (conn, _remote) = conn();

		let p = pair(
			candidate(CandidateType::ServerReflexive, "203.0.113.9:61000", Some("0.0.0.0:40001")),
			candidate(CandidateType::Host, "198.51.100.7:33000", None),
		);
		proxy.update_candidate_pair(&p, conn).await.unwrap();
		assert!(matches!(
			filter.rules("mesh-wg0").await.as_slice(),
			[Rule::MasqueradeSource { candidate_port: 40001, .. }]
		));
	}

	#[tokio::test]
	async fn listen_port_change_reinstalls_masquerade() {
		let filter = Arc::new(MemoryFilter::new());
		let proxy = KernelProxy::new(peer(), Some(nat(&filter).await), 51820);
		let (conn, _remote) = conn();
		let p = pair(
			candidate(CandidateType::Host, "192.0.2.1:40000", None),
			candidate(CandidateType::Host, "198.51.100.7:33000", None),
		);
		proxy.update_candidate_pair(&p, conn).await.unwrap();

		assert_eq!(proxy.update_listen_port(51900).await.unwrap(), None);
		assert!(matches!(
			filter.rules("mesh-wg0").await.as_slice(),
			[Rule::MasqueradeSource { listen_port: 51900, .. }]
		));
	}

	#[tokio::test]
	async fn peer_reflexive_pair_relays_through_loopback() {
		let wireguard = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let listen_port = wireguard.local_addr().unwrap().port();
		let filter = Arc::new(MemoryFilter::new());
		let proxy = KernelProxy::new(peer(), Some(nat(&filter).await), listen_port);
		let (conn, remote) = conn();

		let p = pair(
			candidate(CandidateType::PeerReflexive, "192.0.2.1:40000", None),
			candidate(CandidateType::Host, "198.51.100.7:33000", None),
		);
		let endpoint = proxy.update_candidate_pair(&p, conn).await.unwrap();
		assert!(endpoint.ip().is_loopback());
		assert_eq!(proxy.proxy_type(), ProxyType::KernelConn);
		assert!(filter.rules("mesh-wg0").await.is_empty());

		wireguard.send_to(b"handshake", endpoint).await.unwrap();
		let mut buf = [0u8; 64];
		let n = tokio::time::timeout(Duration::from_secs(1), remote.recv(&mut buf))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&buf[..n], b"handshake");

		remote.send(b"response").await.unwrap();
		let (n, from) = tokio::time::timeout(Duration::from_secs(1), wireguard.recv_from(&mut buf))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&buf[..n], b"response");
		assert_eq!(from, endpoint);
	}

	#[tokio::test]
	async fn rejected_rule_falls_back_to_loopback() {
		let filter = Arc::new(MemoryFilter::new());
		let proxy = KernelProxy::new(peer(), Some(nat(&filter).await), 51820);
		filter.reject_rules(true);
		let (conn, _remote) = conn();

		let p = pair(
			candidate(CandidateType::Host, "192.0.2.1:40000", None),
			candidate(CandidateType::Host, "198.51.100.7:33000", None),
		);
		let endpoint = proxy.update_candidate_pair(&p, conn).await.unwrap();
		assert!(endpoint.ip().is_loopback());
		assert_eq!(proxy.proxy_type(), ProxyType::KernelConn);
	}

	#[tokio::test]
	async fn degraded_nat_moves_peer_to_loopback() {
		let filter = Arc::new(MemoryFilter::new());
		let nat = nat(&filter).await;
		let proxy = KernelProxy::new(peer(), Some(nat.clone()), 51820);
		let (conn, _remote) = conn();
		let p = pair(
			candidate(CandidateType::Host, "192.0.2.1:40000", None),
			candidate(CandidateType::Host, "198.51.100.7:33000", None),
		);
		proxy.update_candidate_pair(&p, conn).await.unwrap();
		assert_eq!(proxy.proxy_type(), ProxyType::KernelNat);

		nat.set_degraded(true);
		let endpoint = proxy.update_listen_port(51900).await.unwrap().unwrap();
		assert!(endpoint.ip().is_loopback());
		assert_eq!(proxy.proxy_type(), ProxyType::KernelConn);
		assert!(filter.rules("mesh-wg0").await.is_empty());
	}

	#[tokio::test]
	async fn cleared_degradation_moves_peer_back_to_masquerade() {
		let filter = Arc::new(MemoryFilter::new());
		let nat = nat(&filter).await;
		nat.set_degraded(true);
		let proxy = KernelProxy::new(peer(), Some(nat.clone()), 51820);
		let (conn, _remote) = conn();
		let p = pair(
			candidate(CandidateType::ServerReflexive, "203.0.113.9:61000", Some("0.0.0.0:40001")),
			candidate(CandidateType::Host, "198.51.100.7:33000", None),
		);
		let endpoint = proxy.update_candidate_pair(&p, conn).await.unwrap();
		assert!(endpoint.ip().is_loopback());
		assert_eq!(proxy.proxy_type(), ProxyType::KernelConn);

		nat.set_degraded(false);
		let endpoint = proxy.update_listen_port(51900).await.unwrap();
		assert_eq!(endpoint, Some("198.51.100.7:33000".parse().unwrap()));
		assert_eq!(proxy.proxy_type(), ProxyType::KernelNat);
		assert_eq!(
			filter.rules("mesh-wg0").await,
			vec![Rule::MasqueradeSource {
				listen_port: 51900,
				remote: "198.51.100.7:33000".parse().unwrap(),
				candidate_port: 40001,
			}]
		);

		// A relayed pair stays on the loopback shim.
		let (conn, _remote) = self::conn();
		let relayed = pair(
			candidate(CandidateType::PeerReflexive, "192.0.2.1:40000", None),
			candidate(CandidateType::Host, "198.51.100.7:33000", None),
		);
		proxy.update_candidate_pair(&relayed, conn).await.unwrap();
		assert_eq!(proxy.update_listen_port(51901).await.unwrap(), None);
		assert_eq!(proxy.proxy_type(), ProxyType::KernelConn);
	}

	#[tokio::test]
	async fn without_nat_every_pair_uses_loopback() {
		let proxy = KernelProxy::new(peer(), None, 51820);
		let (conn, _remote) = conn();
		let p = pair(
			candidate(CandidateType::Host, "192.0.2.1:40000", None),
			candidate(CandidateType::Host, "198.51.100.7:33000", None),
		);
		let first = proxy.update_candidate_pair(&p, conn).await.unwrap();

		let (conn, _remote) = self::conn();
		let second = proxy.update_candidate_pair(&p, conn).await.unwrap();
		assert_eq!(first, second);
	}
}
