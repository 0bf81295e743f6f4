// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ConnError, Result};
use crate::stun::{self, build_binding_request, is_stun, new_transaction_id, StunError, TransactionId};
use stun_codec::MessageClass;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};

const RECEIVE_MTU: usize = 8192;
const CONN_QUEUE: usize = 256;
const DISCOVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct Datagram {
	pub data: Vec<u8>,
	pub from: SocketAddr,
}

/// Shares one UDP socket between ICE agents.
///
/// STUN requests are routed by the local ufrag in their USERNAME attribute.
/// Everything else is routed by source address, learned from requests and
/// from [`UdpMux::send_to`].
pub struct UdpMux {
	socket: Arc<UdpSocket>,
	local_addr: SocketAddr,
	conns: RwLock<HashMap<String, mpsc::Sender<Datagram>>>,
	addrs: RwLock<HashMap<SocketAddr, String>>,
	transactions: Mutex<HashMap<TransactionId, oneshot::Sender<SocketAddr>>>,
	shutdown_tx: watch::Sender<bool>,
}

impl UdpMux {
	#[instrument]
	pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
		let socket = UdpSocket::bind(addr).await?;
		Ok(Self::from_socket(socket)?)
	}

	/// Binds the first free port in `min..=max`.
	pub async fn bind_in_range(ip: IpAddr, min: u16, max: u16) -> Result<Arc<Self>> {
		for port in min..=max {
			match UdpSocket::bind(SocketAddr::new(ip, port)).await {
				Ok(socket) => return Ok(Self::from_socket(socket)?),
				Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
				Err(e) => return Err(e.into()),
			}
		}
		Err(ConnError::NoPortAvailable { min, max })
	}

	fn from_socket(socket: UdpSocket) -> io::Result<Arc<Self>> {
		let local_addr = socket.local_addr()?;
		let socket = Arc::new(socket);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let mux = Arc::new(Self {
			socket: Arc::clone(&socket),
			local_addr,
			conns: RwLock::new(HashMap::new()),
			addrs: RwLock::new(HashMap::new()),
			transactions: Mutex::new(HashMap::new()),
			shutdown_tx,
		});

		tokio::spawn(read_loop(Arc::downgrade(&mux), socket, shutdown_rx));
		debug!(%local_addr, "mux listening");
		Ok(mux)
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn port(&self) -> u16 {
		self.local_addr.port()
	}

	pub async fn register(&self, ufrag: &str) -> Result<mpsc::Receiver<Datagram>> {
		let mut conns = self.conns.write().await;
		if conns.contains_key(ufrag) {
			return Err(ConnError::UfragInUse(ufrag.to_string()));
		}
		let (tx, rx) = mpsc::channel(CONN_QUEUE);
		conns.insert(ufrag.to_string(), tx);
		Ok(rx)
	}

	pub async fn unregister(&self, ufrag: &str) {
		self.conns.write().await.remove(ufrag);
		self.addrs.write().await.retain(|_, u| u != ufrag);
	}

	pub async fn send_to(&self, ufrag: &str, data: &[u8], to: SocketAddr) -> io::Result<usize> {
		{
			let mut addrs = self.addrs.write().await;
			if addrs.get(&to).map(String::as_str) != Some(ufrag) {
				addrs.insert(to, ufrag.to_string());
			}
		}
		self.socket.send_to(data, to).await
	}

	/// Queries a STUN server for the mapped address of this socket.
	#[instrument(skip(self), fields(local = %self.local_addr))]
	pub async fn discover(&self, server: SocketAddr, wait: Duration) -> Result<SocketAddr> {
		let per_attempt = wait / DISCOVERY_ATTEMPTS;

		for attempt in 0..DISCOVERY_ATTEMPTS {
			let transaction_id = new_transaction_id();
			let (tx, rx) = oneshot::channel();
			self.transactions.lock().await.insert(transaction_id, tx);

			let request = build_binding_request(transaction_id)?;
			if let Err(e) = self.socket.send_to(&request, server).await {
				self.transactions.lock().await.remove(&transaction_id);
				return Err(e.into());
			}

			match timeout(per_attempt, rx).await {
				Ok(Ok(mapped)) => {
					debug!(%server, %mapped, "discovered server reflexive address");
					return Ok(mapped);
				}
				Ok(Err(_)) => return Err(StunError::NoMappedAddress.into()),
				Err(_) => {
					trace!(%server, attempt, "STUN request timed out");
					self.transactions.lock().await.remove(&transaction_id);
				}
			}
		}

		Err(StunError::Timeout.into())
	}

	pub fn close(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	async fn route(&self, data: &[u8], from: SocketAddr) {
		if is_stun(data) {
			if let Ok(msg) = stun::decode(data) {
				if matches!(msg.class(), MessageClass::SuccessResponse | MessageClass::ErrorResponse) {
					let pending = self.transactions.lock().await.remove(&msg.transaction_id());
					if let Some(tx) = pending {
						if let Some(mapped) = stun::mapped_address(&msg) {
							let _ = tx.send(mapped);
						}
						return;
					}
				}

				if let Some(ufrag) = stun::local_ufrag(&msg) {
					if self.deliver(ufrag, data, from).await {
						self.addrs.write().await.insert(from, ufrag.to_string());
					} else {
						trace!(%from, ufrag, "STUN request for unknown ufrag");
					}
					return;
				}
			}
		}

		let ufrag = self.addrs.read().await.get(&from).cloned();
		match ufrag {
			Some(ufrag) => {
				self.deliver(&ufrag, data, from).await;
			}
			None => trace!(%from, len = data.len(), "dropping datagram from unknown source"),
		}
	}

	async fn deliver(&self, ufrag: &str, data: &[u8], from: SocketAddr) -> bool {
		let conns = self.conns.read().await;
		let Some(tx) = conns.get(ufrag) else {
			return false;
		};
		if tx
			.try_send(Datagram {
				data: data.to_vec(),
				from,
			})
			.is_err()
		{
			trace!(ufrag, "mux queue full, dropping datagram");
		}
		true
	}
}

impl Drop for UdpMux {
	fn drop(&mut self) {
		let _ = self.shutdown_tx.send(true);
	}
}

async fn read_loop(mux: Weak<UdpMux>, socket: Arc<UdpSocket>, mut shutdown_rx: watch::Receiver<bool>) {
	let mut buf = vec![0u8; RECEIVE_MTU];

	loop {
		let (len, from) = tokio::select! {
			biased;

			_ = shutdown_rx.changed() => break,

			result = socket.recv_from(&mut buf) => match result {
				Ok(received) => received,
				Err(e) => {
					warn!(error = %e, "mux receive failed");
					continue;
				}
			}
		};

		let Some(mux) = mux.upgrade() else {
			break;
		};
		mux.route(&buf[..len], from).await;
	}

	trace!("mux read loop stopped");
}
