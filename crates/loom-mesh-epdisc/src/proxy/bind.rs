// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use super::Proxy;
use crate::error::Result;
use crate::status::ProxyType;
use async_trait::async_trait;
use loom_mesh_common::{PacketConn, WgPublicKey};
use loom_mesh_conn::CandidatePair;
use loom_mesh_device::UserBind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Hands the ICE connection to the in-process bind of a userspace device.
pub struct UserBindProxy {
	peer: WgPublicKey,
	bind: Arc<dyn UserBind>,
	attached: AtomicBool,
}

impl UserBindProxy {
	pub fn new(peer: WgPublicKey, bind: Arc<dyn UserBind>) -> Self {
		Self {
			peer,
			bind,
			attached: AtomicBool::new(false),
		}
	}
}

#[async_trait]
impl Proxy for UserBindProxy {
	async fn update_candidate_pair(&self, pair: &CandidatePair, conn: Arc<dyn PacketConn>) -> Result<SocketAddr> {
		let endpoint = self.bind.attach(self.peer, conn).await?;
		self.attached.store(true, Ordering::Release);
		debug!(peer = %self.peer, %pair, %endpoint, "attached connection to bind");
		Ok(endpoint)
	}

	async fn update_listen_port(&self, _listen_port: u16) -> Result<Option<SocketAddr>> {
		Ok(None)
	}

	fn proxy_type(&self) -> ProxyType {
		if self.attached.load(Ordering::Acquire) {
			ProxyType::UserBind
		} else {
			ProxyType::NoProxy
		}
	}

	async fn close(&self) -> Result<()> {
		if self.attached.swap(false, Ordering::AcqRel) {
			self.bind.detach(&self.peer).await;
		}
		Ok(())
	}
}
