// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use loom_mesh_common::{KeyError, WgPrivateKey, WgPublicKey, KEY_LENGTH};
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use zeroize::{Zeroize, Zeroizing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
	Kernel,
	Userspace,
}

impl fmt::Display for InterfaceType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			InterfaceType::Kernel => f.write_str("kernel"),
			InterfaceType::Userspace => f.write_str("userspace"),
		}
	}
}

/// Symmetric key mixed into the WireGuard handshake.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct PresharedKey {
	bytes: [u8; KEY_LENGTH],
}

impl PresharedKey {
	pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self, KeyError> {
		let bytes = Zeroizing::new(STANDARD.decode(s)?);
		if bytes.len() != KEY_LENGTH {
			return Err(KeyError::InvalidLength(bytes.len()));
		}
		let mut out = [0u8; KEY_LENGTH];
		out.copy_from_slice(&bytes);
		Ok(Self { bytes: out })
	}

	pub fn to_base64(&self) -> Zeroizing<String> {
		Zeroizing::new(STANDARD.encode(self.bytes))
	}
}

impl fmt::Debug for PresharedKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("PresharedKey([REDACTED])")
	}
}

impl Serialize for PresharedKey {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str("[REDACTED]")
	}
}

/// Observed state of one WireGuard peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
	pub public_key: WgPublicKey,
	pub name: Option<String>,
	pub preshared_key: Option<PresharedKey>,
	pub endpoint: Option<SocketAddr>,
	/// Seconds. `None` when disabled.
	pub persistent_keepalive: Option<u16>,
	pub last_handshake: Option<DateTime<Utc>>,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
	pub allowed_ips: Vec<IpNet>,
	pub protocol_version: u32,
}

impl PeerSnapshot {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			name: None,
			preshared_key: None,
			endpoint: None,
			persistent_keepalive: None,
			last_handshake: None,
			rx_bytes: 0,
			tx_bytes: 0,
			allowed_ips: Vec::new(),
			protocol_version: 1,
		}
	}

	pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
		self.endpoint = Some(endpoint);
		self
	}

	pub fn with_allowed_ips(mut self, allowed_ips: Vec<IpNet>) -> Self {
		self.allowed_ips = allowed_ips;
		self
	}
}

/// Observed state of one WireGuard interface.
///
/// `public_key` is derived from `private_key` whenever the latter is set.
/// Peers are kept sorted by public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceSnapshot {
	pub name: String,
	pub interface_type: InterfaceType,
	pub private_key: WgPrivateKey,
	pub public_key: WgPublicKey,
	pub listen_port: u16,
	pub firewall_mark: u32,
	pub peers: Vec<PeerSnapshot>,
}

impl InterfaceSnapshot {
	pub fn new(name: impl Into<String>, interface_type: InterfaceType, private_key: WgPrivateKey) -> Self {
		let public_key = if private_key.is_set() {
			private_key.public_key()
		} else {
			WgPublicKey::ZERO
		};
		Self {
			name: name.into(),
			interface_type,
			private_key,
			public_key,
			listen_port: 0,
			firewall_mark: 0,
			peers: Vec::new(),
		}
	}

	pub fn with_listen_port(mut self, listen_port: u16) -> Self {
		self.listen_port = listen_port;
		self
	}

	pub fn with_peers(mut self, peers: Vec<PeerSnapshot>) -> Self {
		self.peers = peers;
		self.sort_peers();
		self
	}

	pub fn sort_peers(&mut self) {
		self.peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
	}

	pub fn peer(&self, public_key: &WgPublicKey) -> Option<&PeerSnapshot> {
		self.peers
			.binary_search_by(|p| p.public_key.cmp(public_key))
			.ok()
			.map(|idx| &self.peers[idx])
	}

	pub fn peer_mut(&mut self, public_key: &WgPublicKey) -> Option<&mut PeerSnapshot> {
		self.peers.iter_mut().find(|p| p.public_key == *public_key)
	}

	/// Recomputes `public_key` after a private key change.
	pub fn set_private_key(&mut self, private_key: WgPrivateKey) {
		self.public_key = if private_key.is_set() {
			private_key.public_key()
		} else {
			WgPublicKey::ZERO
		};
		self.private_key = private_key;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_mesh_common::WgKeyPair;

	#[test]
	fn public_key_follows_private_key() {
		let key = WgKeyPair::generate();
		let mut intf = InterfaceSnapshot::new("wg0", InterfaceType::Kernel, key.private_key().clone());
		assert_eq!(intf.public_key, *key.public_key());

		let rotated = WgKeyPair::generate();
		intf.set_private_key(rotated.private_key().clone());
		assert_eq!(intf.public_key, *rotated.public_key());

		intf.set_private_key(WgPrivateKey::from_bytes([0u8; 32]));
		assert_eq!(intf.public_key, WgPublicKey::ZERO);
	}

	#[test]
	fn peers_are_sorted_and_searchable() {
		let keys: Vec<WgPublicKey> = (0..5).map(|_| *WgKeyPair::generate().public_key()).collect();
		let peers = keys.iter().map(|k| PeerSnapshot::new(*k)).collect();
		let intf = InterfaceSnapshot::new("wg0", InterfaceType::Kernel, WgPrivateKey::generate()).with_peers(peers);

		assert!(intf.peers.windows(2).all(|w| w[0].public_key < w[1].public_key));
		for key in &keys {
			assert_eq!(intf.peer(key).unwrap().public_key, *key);
		}
		assert!(intf.peer(&WgPublicKey::ZERO).is_none());
	}

	#[test]
	fn preshared_key_is_redacted() {
		let psk = PresharedKey::from_bytes([7u8; 32]);
		assert_eq!(format!("{:?}", psk), "PresharedKey([REDACTED])");
		assert_eq!(serde_json::to_string(&psk).unwrap(), "\"[REDACTED]\"");
		let restored = PresharedKey::from_base64(&psk.to_base64()).unwrap();
		assert_eq!(restored, psk);
	}

	#[test]
	fn preshared_key_rejects_wrong_length() {
		assert!(matches!(
			PresharedKey::from_base64("AAAA"),
			Err(KeyError::InvalidLength(3))
		));
	}
}
