// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// A connected datagram path to one remote peer.
///
/// Implemented by the ICE connection once a candidate pair is selected and
/// consumed by the WireGuard proxies.
#[async_trait]
pub trait PacketConn: Send + Sync {
	async fn send(&self, data: &[u8]) -> io::Result<usize>;

	/// Waits for the next datagram. Returns `ErrorKind::NotConnected` once closed.
	async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

	fn local_addr(&self) -> SocketAddr;

	fn remote_addr(&self) -> SocketAddr;
}
