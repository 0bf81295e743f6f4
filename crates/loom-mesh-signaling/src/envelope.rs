// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Authenticated encryption of signaling messages.
//!
//! The sealing key is the X25519 agreement between the sender's private key
//! and the recipient's public key, so only the two peers can open an envelope.

use crate::error::{Result, SignalingError};
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use loom_mesh_common::{KeyPair, Message, WgPrivateKey, WgPublicKey, KEY_LENGTH};
use serde::{Deserialize, Serialize};

pub const NONCE_LENGTH: usize = 24;

/// Fixed part of the wire encoding: two keys and the nonce length.
const HEADER_LENGTH: usize = 2 * KEY_LENGTH + 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
	pub sender: WgPublicKey,
	pub recipient: WgPublicKey,
	#[serde(with = "base64_bytes")]
	pub nonce: Vec<u8>,
	#[serde(with = "base64_bytes")]
	pub ciphertext: Vec<u8>,
}

impl Envelope {
	/// Encrypts `msg` from `kp.ours` to `kp.theirs`.
	pub fn seal(msg: &Message, kp: &KeyPair) -> Result<Self> {
		let plaintext = serde_json::to_vec(msg)?;
		let salsa = salsa_box(&kp.ours, &kp.theirs);
		let nonce = SalsaBox::generate_nonce(&mut OsRng);
		let ciphertext = salsa
			.encrypt(&nonce, plaintext.as_slice())
			.map_err(|_| SignalingError::EncryptFailed)?;

		Ok(Self {
			sender: kp.ours.public_key(),
			recipient: kp.theirs,
			nonce: nonce.to_vec(),
			ciphertext,
		})
	}

	/// Decrypts with our private key and the sender's public key.
	pub fn open(&self, ours: &WgPrivateKey) -> Result<Message> {
		let nonce: [u8; NONCE_LENGTH] = self
			.nonce
			.as_slice()
			.try_into()
			.map_err(|_| SignalingError::DecryptFailed(self.sender))?;
		let salsa = salsa_box(ours, &self.sender);
		let nonce = crypto_box::Nonce::from(nonce);
		let plaintext = salsa
			.decrypt(&nonce, self.ciphertext.as_slice())
			.map_err(|_| SignalingError::DecryptFailed(self.sender))?;
		Ok(serde_json::from_slice(&plaintext)?)
	}

	/// `sender | recipient | nonce_len (u16 BE) | nonce | ciphertext`
	pub fn to_bytes(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(HEADER_LENGTH + self.nonce.len() + self.ciphertext.len());
		out.extend_from_slice(self.sender.as_bytes());
		out.extend_from_slice(self.recipient.as_bytes());
		out.extend_from_slice(&(self.nonce.len() as u16).to_be_bytes());
		out.extend_from_slice(&self.nonce);
		out.extend_from_slice(&self.ciphertext);
		out
	}

	pub fn from_bytes(data: &[u8]) -> Result<Self> {
		if data.len() < HEADER_LENGTH {
			return Err(SignalingError::InvalidEnvelope(format!(
				"too short: {} bytes",
				data.len()
			)));
		}
		let invalid_key = |e| SignalingError::InvalidEnvelope(format!("bad key: {}", e));
		let sender = WgPublicKey::from_slice(&data[..KEY_LENGTH]).map_err(invalid_key)?;
		let recipient =
			WgPublicKey::from_slice(&data[KEY_LENGTH..2 * KEY_LENGTH]).map_err(invalid_key)?;
		let nonce_len =
			u16::from_be_bytes([data[2 * KEY_LENGTH], data[2 * KEY_LENGTH + 1]]) as usize;
		if data.len() < HEADER_LENGTH + nonce_len {
			return Err(SignalingError::InvalidEnvelope("truncated nonce".to_string()));
		}
		let nonce = data[HEADER_LENGTH..HEADER_LENGTH + nonce_len].to_vec();
		let ciphertext = data[HEADER_LENGTH + nonce_len..].to_vec();

		Ok(Self {
			sender,
			recipient,
			nonce,
			ciphertext,
		})
	}
}

fn salsa_box(ours: &WgPrivateKey, theirs: &WgPublicKey) -> SalsaBox {
	let secret = SecretKey::from(*ours.expose_bytes());
	let public = PublicKey::from(*theirs.as_bytes());
	SalsaBox::new(&public, &secret)
}

mod base64_bytes {
	use base64::engine::general_purpose::STANDARD;
	use base64::Engine;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(deserializer)?;
		STANDARD.decode(s).map_err(serde::de::Error::custom)
	}
}
