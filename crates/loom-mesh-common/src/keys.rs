// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LENGTH: usize = 32;

/// Key for the keyed hash that maps public keys onto interface addresses.
const ADDR_HASH_KEY: [u8; 16] = [
	0x67, 0x67, 0x2c, 0x05, 0xd1, 0x3e, 0x11, 0x94, 0xbb, 0x38, 0x91, 0xff, 0x4f, 0x80, 0xb3, 0x97,
];

/// 169.254.0.0/16
pub fn link_local_v4() -> Ipv4Net {
	Ipv4Net::new(Ipv4Addr::new(169, 254, 0, 0), 16)
		.unwrap_or_else(|_| unreachable!("16 is a valid IPv4 prefix length"))
}

/// fe80::/64
pub fn link_local_v6() -> Ipv6Net {
	Ipv6Net::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 64)
		.unwrap_or_else(|_| unreachable!("64 is a valid IPv6 prefix length"))
}

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),

	#[error("invalid hex encoding: {0}")]
	InvalidHex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode_base64(s: &str) -> Result<[u8; KEY_LENGTH]> {
	let bytes = match STANDARD.decode(s) {
		Ok(bytes) => bytes,
		Err(_) => STANDARD_NO_PAD.decode(s)?,
	};
	to_array(bytes)
}

fn decode_hex(s: &str) -> Result<[u8; KEY_LENGTH]> {
	to_array(hex::decode(s)?)
}

fn to_array(bytes: Vec<u8>) -> Result<[u8; KEY_LENGTH]> {
	if bytes.len() != KEY_LENGTH {
		return Err(KeyError::InvalidLength(bytes.len()));
	}
	let mut arr = [0u8; KEY_LENGTH];
	arr.copy_from_slice(&bytes);
	Ok(arr)
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPrivateKey {
	bytes: [u8; KEY_LENGTH],
}

impl WgPrivateKey {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		Self {
			bytes: secret.to_bytes(),
		}
	}

	pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
		Self { bytes }
	}

	/// Accepts both the padded encoding used by `wg(8)` and the unpadded form.
	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_base64(s)?,
		})
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_hex(s)?,
		})
	}

	pub fn to_base64(&self) -> Zeroizing<String> {
		Zeroizing::new(STANDARD.encode(self.bytes))
	}

	pub fn to_hex(&self) -> Zeroizing<String> {
		Zeroizing::new(hex::encode(self.bytes))
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.bytes);
		let public = PublicKey::from(&secret);
		WgPublicKey {
			bytes: *public.as_bytes(),
		}
	}

	/// An all-zero private key means "no key configured".
	pub fn is_set(&self) -> bool {
		self.bytes != [0u8; KEY_LENGTH]
	}

	pub fn expose_bytes(&self) -> &[u8; KEY_LENGTH] {
		&self.bytes
	}

	/// X25519 shared secret between this key and `theirs`.
	pub fn shared_secret(&self, theirs: &WgPublicKey) -> Zeroizing<[u8; KEY_LENGTH]> {
		let secret = StaticSecret::from(self.bytes);
		let shared = secret.diffie_hellman(&PublicKey::from(theirs.bytes));
		Zeroizing::new(*shared.as_bytes())
	}
}

impl PartialEq for WgPrivateKey {
	fn eq(&self, other: &Self) -> bool {
		self.public_key() == other.public_key()
	}
}

impl Eq for WgPrivateKey {}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPrivateKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

impl fmt::Display for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

impl Serialize for WgPrivateKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str("[REDACTED]")
	}
}

impl<'de> Deserialize<'de> for WgPrivateKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = Zeroizing::new(String::deserialize(deserializer)?);
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// Public half of a Curve25519 key.
///
/// Ordering is byte-lexicographic, which is what the ICE role election relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WgPublicKey {
	bytes: [u8; KEY_LENGTH],
}

impl WgPublicKey {
	/// The unset key. Subscriptions use it as the wildcard sender.
	pub const ZERO: WgPublicKey = WgPublicKey {
		bytes: [0u8; KEY_LENGTH],
	};

	pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
		Self { bytes }
	}

	pub fn from_slice(bytes: &[u8]) -> Result<Self> {
		Ok(Self {
			bytes: to_array(bytes.to_vec())?,
		})
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_base64(s)?,
		})
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_hex(s)?,
		})
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
		&self.bytes
	}

	pub fn is_set(&self) -> bool {
		self.bytes != [0u8; KEY_LENGTH]
	}

	/// Places a keyed hash of this key into the host part of `net`.
	pub fn ip_address(&self, net: IpNet) -> IpNet {
		let digest = self.address_digest();
		match net {
			IpNet::V4(net) => {
				let prefix = net.prefix_len();
				let mut hash = [0u8; 4];
				hash.copy_from_slice(&digest[..4]);
				let host = u32::from_be_bytes(hash).checked_shr(prefix as u32).unwrap_or(0);
				let network = u32::from(net.network());
				let addr = Ipv4Addr::from(network | host);
				IpNet::V4(Ipv4Net::new(addr, prefix).unwrap_or(net))
			}
			IpNet::V6(net) => {
				let prefix = net.prefix_len();
				let mut hash = [0u8; 16];
				hash.copy_from_slice(&digest[..16]);
				let host = u128::from_be_bytes(hash).checked_shr(prefix as u32).unwrap_or(0);
				let network = u128::from(net.network());
				let addr = Ipv6Addr::from(network | host);
				IpNet::V6(Ipv6Net::new(addr, prefix).unwrap_or(net))
			}
		}
	}

	/// Link-local IPv4 address for this key, as a host route.
	pub fn ipv4_address(&self) -> IpNet {
		IpNet::from(self.ip_address(IpNet::V4(link_local_v4())).addr())
	}

	/// Link-local IPv6 address for this key, as a host route.
	pub fn ipv6_address(&self) -> IpNet {
		IpNet::from(self.ip_address(IpNet::V6(link_local_v6())).addr())
	}

	fn address_digest(&self) -> [u8; 32] {
		let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&ADDR_HASH_KEY)
			.unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
		mac.update(&self.bytes);
		let mut digest = [0u8; 32];
		digest.copy_from_slice(&mac.finalize().into_bytes());
		digest
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let b64 = self.to_base64();
		let prefix = if b64.len() >= 8 { &b64[..8] } else { &b64 };
		f.debug_struct("WgPublicKey")
			.field("prefix", &format!("{}...", prefix))
			.finish()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl std::str::FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// Identity of a WireGuard interface.
#[derive(Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		let private = WgPrivateKey::generate();
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_base64(private_key_base64: &str) -> Result<Self> {
		let private = WgPrivateKey::from_base64(private_key_base64)?;
		Ok(Self::from_private_key(private))
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("private", &self.private)
			.field("public", &self.public)
			.finish()
	}
}

/// Subscription identity: our private key and the remote public key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
	pub ours: WgPrivateKey,
	pub theirs: WgPublicKey,
}

impl KeyPair {
	pub fn new(ours: WgPrivateKey, theirs: WgPublicKey) -> Self {
		Self { ours, theirs }
	}

	pub fn public(&self) -> PublicKeyPair {
		PublicKeyPair {
			ours: self.ours.public_key(),
			theirs: self.theirs,
		}
	}

	pub fn shared_secret(&self) -> Zeroizing<[u8; KEY_LENGTH]> {
		self.ours.shared_secret(&self.theirs)
	}
}

impl fmt::Debug for KeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyPair")
			.field("ours", &self.ours.public_key())
			.field("theirs", &self.theirs)
			.finish()
	}
}

/// Transport identity: both public keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyPair {
	pub ours: WgPublicKey,
	pub theirs: WgPublicKey,
}

impl PublicKeyPair {
	pub fn new(ours: WgPublicKey, theirs: WgPublicKey) -> Self {
		Self { ours, theirs }
	}

	pub fn reversed(&self) -> Self {
		Self {
			ours: self.theirs,
			theirs: self.ours,
		}
	}

	/// The side with the numerically smaller public key controls the ICE session.
	pub fn is_controlling(&self) -> bool {
		self.ours < self.theirs
	}
}

impl fmt::Display for PublicKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} <-> {}", self.ours, self.theirs)
	}
}
