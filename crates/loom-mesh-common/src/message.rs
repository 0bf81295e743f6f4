// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Signaling payloads exchanged between peers.
//!
//! A [`Message`] is serialized to JSON and sealed inside an envelope by the
//! signaling layer. Exactly one variant is carried per envelope.

use crate::keys::WgPublicKey;
use ipnet::IpNet;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub const UFRAG_LENGTH: usize = 16;
pub const PWD_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
	Credentials(Credentials),
	Candidate(Candidate),
	PeerDescription(PeerDescription),
}

impl Message {
	pub fn kind(&self) -> &'static str {
		match self {
			Message::Credentials(_) => "credentials",
			Message::Candidate(_) => "candidate",
			Message::PeerDescription(_) => "peer_description",
		}
	}
}

impl From<Credentials> for Message {
	fn from(creds: Credentials) -> Self {
		Message::Credentials(creds)
	}
}

impl From<Candidate> for Message {
	fn from(candidate: Candidate) -> Self {
		Message::Candidate(candidate)
	}
}

impl From<PeerDescription> for Message {
	fn from(pd: PeerDescription) -> Self {
		Message::PeerDescription(pd)
	}
}

/// ICE short-term credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
	pub ufrag: String,
	pub pwd: String,
	#[serde(default)]
	pub need_creds: bool,
}

impl Credentials {
	pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
		Self {
			ufrag: ufrag.into(),
			pwd: pwd.into(),
			need_creds: false,
		}
	}

	/// Fresh random credentials made of ASCII letters.
	pub fn generate() -> Self {
		Self::new(random_letters(UFRAG_LENGTH), random_letters(PWD_LENGTH))
	}

	pub fn with_need_creds(mut self, need_creds: bool) -> Self {
		self.need_creds = need_creds;
		self
	}

	pub fn is_empty(&self) -> bool {
		self.ufrag.is_empty() && self.pwd.is_empty()
	}

	/// Same session: the flag is not part of the identity.
	pub fn same_session(&self, other: &Credentials) -> bool {
		self.ufrag == other.ufrag && self.pwd == other.pwd
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("ufrag", &self.ufrag)
			.field("pwd", &"[REDACTED]")
			.field("need_creds", &self.need_creds)
			.finish()
	}
}

fn random_letters(len: usize) -> String {
	const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
	let mut rng = rand::thread_rng();
	(0..len)
		.map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
		.collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
	Host,
	ServerReflexive,
	PeerReflexive,
	Relay,
}

impl CandidateType {
	/// Abbreviation used in candidate attribute lines.
	pub fn as_str(&self) -> &'static str {
		match self {
			CandidateType::Host => "host",
			CandidateType::ServerReflexive => "srflx",
			CandidateType::PeerReflexive => "prflx",
			CandidateType::Relay => "relay",
		}
	}
}

impl fmt::Display for CandidateType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
	Udp4,
	Udp6,
	Tcp4,
	Tcp6,
}

impl NetworkType {
	pub fn for_addr(tcp: bool, addr: &IpAddr) -> Self {
		match (tcp, addr.is_ipv4()) {
			(false, true) => NetworkType::Udp4,
			(false, false) => NetworkType::Udp6,
			(true, true) => NetworkType::Tcp4,
			(true, false) => NetworkType::Tcp6,
		}
	}

	pub fn is_tcp(&self) -> bool {
		matches!(self, NetworkType::Tcp4 | NetworkType::Tcp6)
	}
}

impl fmt::Display for NetworkType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			NetworkType::Udp4 => "udp4",
			NetworkType::Udp6 => "udp6",
			NetworkType::Tcp4 => "tcp4",
			NetworkType::Tcp6 => "tcp6",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpType {
	Active,
	Passive,
	SimultaneousOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayProtocol {
	Udp,
	Tcp,
	Tls,
	Dtls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelatedAddress {
	pub address: IpAddr,
	pub port: u16,
}

/// An ICE candidate as carried over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
	pub candidate_type: CandidateType,
	pub foundation: String,
	pub component: u16,
	#[serde(rename = "network")]
	pub network_type: NetworkType,
	pub priority: u32,
	pub address: IpAddr,
	pub port: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tcp_type: Option<TcpType>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub related_address: Option<RelatedAddress>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub relay_protocol: Option<RelayProtocol>,
}

impl Candidate {
	pub fn socket_addr(&self) -> SocketAddr {
		SocketAddr::new(self.address, self.port)
	}
}

impl fmt::Display for Candidate {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} {} {} {}",
			self.candidate_type,
			self.network_type,
			self.socket_addr(),
			self.priority
		)?;
		if let Some(related) = &self.related_address {
			write!(f, " related {}", SocketAddr::new(related.address, related.port))?;
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerDescriptionChange {
	Add,
	Update,
	Remove,
}

/// Announcement of a peer's WireGuard configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescription {
	pub change: PeerDescriptionChange,
	pub public_key: WgPublicKey,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub public_key_new: Option<WgPublicKey>,
	#[serde(default)]
	pub allowed_ips: Vec<IpNet>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub endpoint: Option<SocketAddr>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub persistent_keepalive: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub hostname: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::keys::WgKeyPair;
	use std::net::Ipv4Addr;

	fn host_candidate() -> Candidate {
		Candidate {
			candidate_type: CandidateType::Host,
			foundation: "1".to_string(),
			component: 1,
			network_type: NetworkType::Udp4,
			priority: 2130706431,
			address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
			port: 51820,
			tcp_type: None,
			related_address: None,
			relay_protocol: None,
		}
	}

	#[test]
	fn generated_credentials_are_letters_of_fixed_length() {
		let creds = Credentials::generate();
		assert_eq!(creds.ufrag.len(), UFRAG_LENGTH);
		assert_eq!(creds.pwd.len(), PWD_LENGTH);
		assert!(creds.ufrag.chars().all(|c| c.is_ascii_alphabetic()));
		assert!(creds.pwd.chars().all(|c| c.is_ascii_alphabetic()));
		assert!(!creds.need_creds);
	}

	#[test]
	fn generated_credentials_differ() {
		assert!(!Credentials::generate().same_session(&Credentials::generate()));
	}

	#[test]
	fn same_session_ignores_need_flag() {
		let a = Credentials::new("ufrag", "pwd");
		let b = a.clone().with_need_creds(true);
		assert!(a.same_session(&b));
		assert_ne!(a, b);
	}

	#[test]
	fn credentials_debug_hides_password() {
		let creds = Credentials::new("ufrag", "supersecretpassword");
		let debug = format!("{:?}", creds);
		assert!(debug.contains("ufrag"));
		assert!(!debug.contains("supersecretpassword"));
	}

	#[test]
	fn message_is_tagged_by_variant() {
		let msg = Message::from(Credentials::new("u", "p").with_need_creds(true));
		let json = serde_json::to_value(&msg).unwrap();
		assert_eq!(json["type"], "credentials");
		assert_eq!(json["need_creds"], true);
		assert_eq!(msg.kind(), "credentials");
	}

	#[test]
	fn candidate_omits_absent_optionals() {
		let json = serde_json::to_value(Message::from(host_candidate())).unwrap();
		assert_eq!(json["type"], "candidate");
		assert!(json.get("related_address").is_none());
		assert!(json.get("tcp_type").is_none());
	}

	#[test]
	fn candidate_display_includes_related_address() {
		let mut candidate = host_candidate();
		candidate.candidate_type = CandidateType::ServerReflexive;
		candidate.related_address = Some(RelatedAddress {
			address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			port: 40000,
		});
		let shown = candidate.to_string();
		assert!(shown.starts_with("srflx udp4 192.0.2.10:51820"));
		assert!(shown.ends_with("related 0.0.0.0:40000"));
	}

	#[test]
	fn peer_description_decodes_with_defaults() {
		let key = *WgKeyPair::generate().public_key();
		let json = format!(r#"{{"type":"peer_description","change":"add","public_key":"{}"}}"#, key);
		let msg: Message = serde_json::from_str(&json).unwrap();
		match msg {
			Message::PeerDescription(pd) => {
				assert_eq!(pd.change, PeerDescriptionChange::Add);
				assert_eq!(pd.public_key, key);
				assert!(pd.allowed_ips.is_empty());
				assert!(pd.endpoint.is_none());
			}
			other => panic!("unexpected message {:?}", other),
		}
	}

	#[test]
	fn network_type_for_addr() {
		let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
		let v6: IpAddr = "::1".parse().unwrap();
		assert_eq!(NetworkType::for_addr(false, &v4), NetworkType::Udp4);
		assert_eq!(NetworkType::for_addr(true, &v6), NetworkType::Tcp6);
		assert!(NetworkType::Tcp4.is_tcp());
		assert!(!NetworkType::Udp6.is_tcp());
	}
}
