// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Paths between WireGuard and the ICE connection of a peer.
//!
//! A proxy turns the selected candidate pair into the endpoint WireGuard
//! should use for the peer.

mod bind;
mod kernel;

pub use bind::UserBindProxy;
pub use kernel::KernelProxy;

use crate::error::Result;
use crate::status::ProxyType;
use async_trait::async_trait;
use loom_mesh_common::PacketConn;
use loom_mesh_conn::CandidatePair;
use std::net::SocketAddr;
use std::sync::Arc;

#[async_trait]
pub trait Proxy: Send + Sync {
	/// Routes the peer over `conn` and returns the endpoint to program.
	async fn update_candidate_pair(&self, pair: &CandidatePair, conn: Arc<dyn PacketConn>) -> Result<SocketAddr>;

	/// Follows a change of the WireGuard listen port. Returns the new
	/// endpoint when the peer had to move to another path.
	async fn update_listen_port(&self, listen_port: u16) -> Result<Option<SocketAddr>>;

	fn proxy_type(&self) -> ProxyType;

	async fn close(&self) -> Result<()>;
}
