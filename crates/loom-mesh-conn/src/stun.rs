// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! STUN binding messages for server reflexive discovery, keepalives and
//! routing of connectivity checks by USERNAME.
//!
//! Connectivity checks themselves are built and verified by the ICE agent.

use bytecodec::{DecodeExt, EncodeExt};
use std::net::SocketAddr;
use stun_codec::rfc5245::attributes::{IceControlled, IceControlling, Priority, UseCandidate};
use stun_codec::rfc5389::attributes::{
	ErrorCode, Fingerprint, MappedAddress, MessageIntegrity, Software, Username, XorMappedAddress,
};
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder};
use thiserror::Error;
use tracing::warn;

pub use stun_codec::TransactionId;

pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
	"stun.l.google.com:19302",
	"stun1.l.google.com:19302",
	"stun.cloudflare.com:3478",
];

stun_codec::define_attribute_enums!(
	Attribute,
	AttributeDecoder,
	AttributeEncoder,
	[
		MappedAddress,
		XorMappedAddress,
		Username,
		MessageIntegrity,
		Fingerprint,
		ErrorCode,
		Software,
		Priority,
		UseCandidate,
		IceControlled,
		IceControlling
	]
);

pub type StunMessage = Message<Attribute>;

#[derive(Debug, Error)]
pub enum StunError {
	#[error("timeout waiting for STUN response")]
	Timeout,

	#[error("STUN codec error: {0}")]
	Codec(#[from] bytecodec::Error),

	#[error("malformed STUN message")]
	Malformed,

	#[error("not a binding success response")]
	NotBindingResponse,

	#[error("STUN response carries no mapped address")]
	NoMappedAddress,

	#[error("STUN response for another transaction")]
	TransactionMismatch,
}

pub type Result<T> = std::result::Result<T, StunError>;

pub fn new_transaction_id() -> TransactionId {
	let mut id = [0u8; 12];
	id[..8].copy_from_slice(&fastrand::u64(..).to_le_bytes());
	id[8..].copy_from_slice(&fastrand::u32(..).to_le_bytes());
	TransactionId::new(id)
}

/// Whether a datagram looks like STUN: top two bits clear and the magic
/// cookie in bytes 4..8.
pub fn is_stun(data: &[u8]) -> bool {
	data.len() >= HEADER_LEN && data[0] & 0xC0 == 0 && data[4..8] == STUN_MAGIC_COOKIE.to_be_bytes()
}

fn encode(message: StunMessage) -> Result<Vec<u8>> {
	Ok(MessageEncoder::new().encode_into_bytes(message)?)
}

pub fn decode(data: &[u8]) -> Result<StunMessage> {
	MessageDecoder::<Attribute>::new()
		.decode_from_bytes(data)?
		.map_err(|_| StunError::Malformed)
}

pub fn build_binding_request(transaction_id: TransactionId) -> Result<Vec<u8>> {
	encode(Message::new(MessageClass::Request, BINDING, transaction_id))
}

/// Binding indication used to keep NAT mappings on a selected pair open.
pub fn build_binding_indication() -> Result<Vec<u8>> {
	encode(Message::new(MessageClass::Indication, BINDING, new_transaction_id()))
}

/// What a STUN server answers to [`build_binding_request`].
pub fn build_binding_response(transaction_id: TransactionId, mapped: SocketAddr) -> Result<Vec<u8>> {
	let mut message = Message::new(MessageClass::SuccessResponse, BINDING, transaction_id);
	message.add_attribute(Attribute::XorMappedAddress(XorMappedAddress::new(mapped)));
	encode(message)
}

pub fn mapped_address(message: &StunMessage) -> Option<SocketAddr> {
	message
		.get_attribute::<XorMappedAddress>()
		.map(|a| a.address())
		.or_else(|| message.get_attribute::<MappedAddress>().map(|a| a.address()))
}

pub fn parse_binding_response(data: &[u8], expected: TransactionId) -> Result<SocketAddr> {
	let message = decode(data)?;
	if message.class() != MessageClass::SuccessResponse || message.method() != BINDING {
		return Err(StunError::NotBindingResponse);
	}
	if message.transaction_id() != expected {
		return Err(StunError::TransactionMismatch);
	}
	mapped_address(&message).ok_or(StunError::NoMappedAddress)
}

/// Local ufrag of a connectivity check, the part of USERNAME before the colon.
pub fn local_ufrag(message: &StunMessage) -> Option<&str> {
	message
		.get_attribute::<Username>()
		.and_then(|u| u.name().split(':').next())
		.filter(|u| !u.is_empty())
}

pub async fn resolve_stun_servers(servers: &[String]) -> Vec<SocketAddr> {
	let mut addrs = Vec::new();

	for server in servers {
		match tokio::net::lookup_host(server.as_str()).await {
			Ok(resolved) => {
				if let Some(addr) = resolved.into_iter().find(|a| a.is_ipv4()) {
					addrs.push(addr);
				}
			}
			Err(e) => {
				warn!(server, error = %e, "failed to resolve STUN server");
			}
		}
	}

	addrs
}
