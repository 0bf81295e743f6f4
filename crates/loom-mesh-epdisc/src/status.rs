// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Serializable snapshots of engines and interfaces.

use chrono::{DateTime, Utc};
use loom_mesh_common::{CandidateType, ConnectionState, WgPublicKey};
use loom_mesh_conn::{AgentStats, CandidatePair};
use loom_mesh_device::InterfaceType;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;

/// How a peer is reached once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
	None,
	DirectUdp,
	DirectTcp,
	RelayUdp,
	RelayTcp,
}

impl Reachability {
	pub fn classify(state: ConnectionState, pair: Option<&CandidatePair>) -> Self {
		if !state.is_established() {
			return Reachability::None;
		}
		let Some(pair) = pair else {
			return Reachability::None;
		};

		let relayed = pair.local.candidate_type == CandidateType::Relay
			|| pair.remote.candidate_type == CandidateType::Relay;
		match (relayed, pair.remote.network_type.is_tcp()) {
			(false, false) => Reachability::DirectUdp,
			(false, true) => Reachability::DirectTcp,
			(true, false) => Reachability::RelayUdp,
			(true, true) => Reachability::RelayTcp,
		}
	}
}

impl fmt::Display for Reachability {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Reachability::None => "none",
			Reachability::DirectUdp => "direct-udp",
			Reachability::DirectTcp => "direct-tcp",
			Reachability::RelayUdp => "relay-udp",
			Reachability::RelayTcp => "relay-tcp",
		};
		f.write_str(s)
	}
}

/// The path WireGuard datagrams take for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
	NoProxy,
	UserBind,
	KernelConn,
	KernelNat,
}

impl fmt::Display for ProxyType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ProxyType::NoProxy => "none",
			ProxyType::UserBind => "user-bind",
			ProxyType::KernelConn => "kernel-conn",
			ProxyType::KernelNat => "kernel-nat",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
	None,
	NfTables,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
	pub public_key: WgPublicKey,
	pub state: ConnectionState,
	pub restart_count: u32,
	pub last_state_change: DateTime<Utc>,
	pub proxy_type: ProxyType,
	pub reachability: Reachability,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_endpoint: Option<SocketAddr>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub local_ufrag: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub agent: Option<AgentStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
	pub name: String,
	pub interface_type: InterfaceType,
	pub public_key: WgPublicKey,
	pub listen_port: u16,
	pub mux_port: u16,
	pub mux_srflx_port: u16,
	pub nat_type: NatType,
	pub peers: Vec<PeerStatus>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_mesh_common::{Candidate, NetworkType};
	use std::net::{IpAddr, Ipv4Addr};

	fn candidate(candidate_type: CandidateType, network_type: NetworkType) -> Candidate {
		Candidate {
			candidate_type,
			foundation: "1".to_string(),
			component: 1,
			network_type,
			priority: 1,
			address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
			port: 1,
			tcp_type: None,
			related_address: None,
			relay_protocol: None,
		}
	}

	fn pair(local: CandidateType, remote: CandidateType, network: NetworkType) -> CandidatePair {
		CandidatePair {
			local: candidate(local, NetworkType::Udp4),
			remote: candidate(remote, network),
		}
	}

	#[test]
	fn unconnected_is_unreachable() {
		let p = pair(CandidateType::Host, CandidateType::Host, NetworkType::Udp4);
		assert_eq!(Reachability::classify(ConnectionState::Connecting, Some(&p)), Reachability::None);
		assert_eq!(Reachability::classify(ConnectionState::Connected, None), Reachability::None);
	}

	#[test]
	fn relay_on_either_side_is_relayed() {
		let p = pair(CandidateType::Relay, CandidateType::Host, NetworkType::Udp4);
		assert_eq!(Reachability::classify(ConnectionState::Connected, Some(&p)), Reachability::RelayUdp);
		let p = pair(CandidateType::Host, CandidateType::Relay, NetworkType::Tcp4);
		assert_eq!(Reachability::classify(ConnectionState::Connected, Some(&p)), Reachability::RelayTcp);
	}

	#[test]
	fn peer_status_omits_missing_fields() {
		let status = PeerStatus {
			public_key: loom_mesh_common::WgPrivateKey::generate().public_key(),
			state: ConnectionState::Idle,
			restart_count: 2,
			last_state_change: Utc::now(),
			proxy_type: ProxyType::KernelNat,
			reachability: Reachability::None,
			last_endpoint: None,
			local_ufrag: Some("abcd".to_string()),
			agent: None,
		};
		let json = serde_json::to_value(&status).unwrap();
		assert_eq!(json["proxy_type"], "kernel_nat");
		assert_eq!(json["restart_count"], 2);
		assert_eq!(json["local_ufrag"], "abcd");
		assert!(json.get("last_endpoint").is_none());
		assert!(json.get("agent").is_none());
	}

	#[test]
	fn direct_follows_remote_protocol() {
		let p = pair(CandidateType::ServerReflexive, CandidateType::PeerReflexive, NetworkType::Udp6);
		assert_eq!(Reachability::classify(ConnectionState::Connected, Some(&p)), Reachability::DirectUdp);
		let p = pair(CandidateType::Host, CandidateType::Host, NetworkType::Tcp6);
		assert_eq!(Reachability::classify(ConnectionState::Completed, Some(&p)), Reachability::DirectTcp);
	}
}
