// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use async_trait::async_trait;
use loom_mesh_common::{PacketConn, WgPublicKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-process UDP bind of a userspace WireGuard device.
///
/// The device reads and writes a peer's datagrams directly on the attached
/// connection. The returned address is the endpoint to program for that peer.
#[async_trait]
pub trait UserBind: Send + Sync {
	async fn attach(&self, peer: WgPublicKey, conn: Arc<dyn PacketConn>) -> Result<SocketAddr>;

	async fn detach(&self, peer: &WgPublicKey);
}

/// A bind that records attached connections.
#[derive(Default)]
pub struct MemoryBind {
	conns: RwLock<HashMap<WgPublicKey, (SocketAddr, Arc<dyn PacketConn>)>>,
}

impl MemoryBind {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn conn(&self, peer: &WgPublicKey) -> Option<Arc<dyn PacketConn>> {
		self.conns.read().await.get(peer).map(|(_, c)| Arc::clone(c))
	}

	/// Sends as the device would towards `endpoint`.
	pub async fn send_to(&self, endpoint: SocketAddr, data: &[u8]) -> std::io::Result<usize> {
		let conn = {
			let conns = self.conns.read().await;
			conns
				.values()
				.find(|(addr, _)| *addr == endpoint)
				.map(|(_, c)| Arc::clone(c))
		};
		match conn {
			Some(conn) => conn.send(data).await,
			None => Err(std::io::Error::new(
				std::io::ErrorKind::NotConnected,
				format!("no connection for endpoint {}", endpoint),
			)),
		}
	}

	pub async fn len(&self) -> usize {
		self.conns.read().await.len()
	}
}

#[async_trait]
impl UserBind for MemoryBind {
	async fn attach(&self, peer: WgPublicKey, conn: Arc<dyn PacketConn>) -> Result<SocketAddr> {
		let endpoint = conn.remote_addr();
		debug!(%peer, %endpoint, "attached connection to bind");
		self.conns.write().await.insert(peer, (endpoint, conn));
		Ok(endpoint)
	}

	async fn detach(&self, peer: &WgPublicKey) {
		self.conns.write().await.remove(peer);
	}
}
