// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use loom_mesh_common::{Candidate, CandidateType, NetworkType, PacketConn, RelatedAddress};
use loom_mesh_conn::CandidatePair;
use std::io;
use std::net::SocketAddr;
use tokio::sync::{mpsc, Mutex};

/// One end of an in-memory datagram pipe.
pub(crate) struct PipeConn {
	tx: mpsc::Sender<Vec<u8>>,
	rx: Mutex<mpsc::Receiver<Vec<u8>>>,
	local: SocketAddr,
	remote: SocketAddr,
}

pub(crate) fn pipe(a: SocketAddr, b: SocketAddr) -> (PipeConn, PipeConn) {
	let (a_tx, b_rx) = mpsc::channel(64);
	let (b_tx, a_rx) = mpsc::channel(64);
	(
		PipeConn {
			tx: a_tx,
			rx: Mutex::new(a_rx),
			local: a,
			remote: b,
		},
		PipeConn {
			tx: b_tx,
			rx: Mutex::new(b_rx),
			local: b,
			remote: a,
		},
	)
}

#[async_trait]
impl PacketConn for PipeConn {
	async fn send(&self, data: &[u8]) -> io::Result<usize> {
		self.tx
			.send(data.to_vec())
			.await
			.map_err(|_| io::Error::from(io::ErrorKind::NotConnected))?;
		Ok(data.len())
	}

	async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
		let data = self
			.rx
			.lock()
			.await
			.recv()
			.await
			.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
		let n = data.len().min(buf.len());
		buf[..n].copy_from_slice(&data[..n]);
		Ok(n)
	}

	fn local_addr(&self) -> SocketAddr {
		self.local
	}

	fn remote_addr(&self) -> SocketAddr {
		self.remote
	}
}

pub(crate) fn candidate(candidate_type: CandidateType, addr: &str, base: Option<&str>) -> Candidate {
	let addr: SocketAddr = addr.parse().unwrap();
	Candidate {
		candidate_type,
		foundation: "1".to_string(),
		component: 1,
		network_type: NetworkType::for_addr(false, &addr.ip()),
		priority: 1,
		address: addr.ip(),
		port: addr.port(),
		tcp_type: None,
		related_address: base.map(|b| {
			let b: SocketAddr = b.parse().unwrap();
			RelatedAddress {
				address: b.ip(),
				port: b.port(),
			}
		}),
		relay_protocol: None,
	}
}

pub(crate) fn pair(local: Candidate, remote: Candidate) -> CandidatePair {
	CandidatePair { local, remote }
}
