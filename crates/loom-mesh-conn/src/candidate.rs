// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Candidates as carried over signaling, and their conversion to and from
//! the ICE agent's candidates through the `candidate:` attribute syntax.

use crate::error::{ConnError, Result};
use loom_mesh_common::{Candidate, CandidateType, NetworkType, RelatedAddress, TcpType};
use serde::Serialize;
use std::fmt;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const COMPONENT: u16 = 1;

const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;
const MAX_FOUNDATION_LEN: usize = 32;

pub fn type_preference(candidate_type: CandidateType) -> u32 {
	match candidate_type {
		CandidateType::Host => 126,
		CandidateType::PeerReflexive => 110,
		CandidateType::ServerReflexive => 100,
		CandidateType::Relay => 0,
	}
}

pub fn candidate_priority(candidate_type: CandidateType, local_preference: u16, component: u16) -> u32 {
	(type_preference(candidate_type) << 24) + ((local_preference as u32) << 8) + (256 - component as u32)
}

/// A remote candidate learned from the source of a connectivity check.
pub fn peer_reflexive_candidate(addr: SocketAddr) -> Candidate {
	let mut foundation: String = addr
		.ip()
		.to_string()
		.chars()
		.filter(char::is_ascii_alphanumeric)
		.collect();
	foundation.truncate(MAX_FOUNDATION_LEN);
	Candidate {
		candidate_type: CandidateType::PeerReflexive,
		foundation,
		component: COMPONENT,
		network_type: NetworkType::for_addr(false, &addr.ip()),
		priority: candidate_priority(CandidateType::PeerReflexive, DEFAULT_LOCAL_PREFERENCE, COMPONENT),
		address: addr.ip(),
		port: addr.port(),
		tcp_type: None,
		related_address: None,
		relay_protocol: None,
	}
}

/// Renders a candidate as `candidate:<foundation> <component> <proto> ...`.
pub fn to_sdp(c: &Candidate) -> String {
	let proto = if c.network_type.is_tcp() { "tcp" } else { "udp" };
	let mut line = format!(
		"candidate:{} {} {} {} {} {} typ {}",
		c.foundation, c.component, proto, c.priority, c.address, c.port, c.candidate_type
	);
	if let Some(related) = &c.related_address {
		let _ = write!(line, " raddr {} rport {}", related.address, related.port);
	}
	if let Some(tcp_type) = c.tcp_type {
		let tcp_type = match tcp_type {
			TcpType::Active => "active",
			TcpType::Passive => "passive",
			TcpType::SimultaneousOpen => "so",
		};
		let _ = write!(line, " tcptype {tcp_type}");
	}
	line
}

/// Parses a candidate attribute, with or without the `a=` and `candidate:`
/// prefixes. Unknown extension attributes are skipped.
pub fn from_sdp(line: &str) -> Result<Candidate> {
	let trimmed = line.trim();
	let trimmed = trimmed.strip_prefix("a=").unwrap_or(trimmed);
	let trimmed = trimmed.strip_prefix("candidate:").unwrap_or(trimmed);
	let invalid = || ConnError::InvalidCandidate(line.to_string());

	let mut fields = trimmed.split_whitespace();
	let foundation = fields.next().ok_or_else(invalid)?.to_string();
	let component: u16 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
	let tcp = match fields.next().map(str::to_ascii_lowercase).as_deref() {
		Some("udp") => false,
		Some("tcp") => true,
		_ => return Err(invalid()),
	};
	let priority: u32 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
	let address: IpAddr = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
	let port: u16 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
	if fields.next() != Some("typ") {
		return Err(invalid());
	}
	let candidate_type = match fields.next() {
		Some("host") => CandidateType::Host,
		Some("srflx") => CandidateType::ServerReflexive,
		Some("prflx") => CandidateType::PeerReflexive,
		Some("relay") => CandidateType::Relay,
		_ => return Err(invalid()),
	};

	let mut related_ip: Option<IpAddr> = None;
	let mut related_port: Option<u16> = None;
	let mut tcp_type = None;
	while let (Some(key), Some(value)) = (fields.next(), fields.next()) {
		match key {
			"raddr" => related_ip = value.parse().ok(),
			"rport" => related_port = value.parse().ok(),
			"tcptype" => {
				tcp_type = match value {
					"active" => Some(TcpType::Active),
					"passive" => Some(TcpType::Passive),
					"so" => Some(TcpType::SimultaneousOpen),
					_ => None,
				}
			}
			_ => {}
		}
	}

	Ok(Candidate {
		candidate_type,
		foundation,
		component,
		network_type: NetworkType::for_addr(tcp, &address),
		priority,
		address,
		port,
		tcp_type,
		related_address: related_ip.zip(related_port).map(|(address, port)| RelatedAddress { address, port }),
		relay_protocol: None,
	})
}

pub fn to_ice(c: &Candidate) -> Result<str0m::Candidate> {
	str0m::Candidate::from_sdp_string(&to_sdp(c)).map_err(|e| ConnError::InvalidCandidate(e.to_string()))
}

pub fn from_ice(c: &str0m::Candidate) -> Result<Candidate> {
	from_sdp(&c.to_sdp_string())
}

/// Addresses to advertise as host candidates when none are configured: the
/// source address of the default IPv4 route, or loopback without one.
pub fn detect_host_addresses() -> Vec<IpAddr> {
	let route = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).and_then(|socket| {
		socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
		socket.local_addr()
	});
	match route {
		Ok(addr) if !addr.ip().is_unspecified() => vec![addr.ip()],
		_ => vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidatePair {
	pub local: Candidate,
	pub remote: Candidate,
}

impl fmt::Display for CandidatePair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} <-> {}", self.local, self.remote)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateStats {
	pub candidate_type: CandidateType,
	pub network_type: NetworkType,
	pub address: IpAddr,
	pub port: u16,
	pub priority: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub related_address: Option<SocketAddr>,
}

impl From<&Candidate> for CandidateStats {
	fn from(c: &Candidate) -> Self {
		Self {
			candidate_type: c.candidate_type,
			network_type: c.network_type,
			address: c.address,
			port: c.port,
			priority: c.priority,
			related_address: c
				.related_address
				.map(|r| SocketAddr::new(r.address, r.port)),
		}
	}
}
