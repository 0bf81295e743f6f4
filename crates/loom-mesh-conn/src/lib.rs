// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! ICE connectivity for mesh peers.
//!
//! Each WireGuard interface owns two [`UdpMux`]es, one for host and one for
//! server reflexive candidates. Every peer gets an [`IceAgent`] registered
//! on both under its own ufrag, driving a str0m ICE agent. Once a candidate
//! pair is selected the agent's [`IceConn`] carries WireGuard datagrams.
//!
//! ```ignore
//! let (tx, mut events) = mpsc::channel(64);
//! let agent = IceAgent::new(IceConfig::default(), host_mux, srflx_mux, tx).await?;
//! agent.set_remote_credentials(remote_creds)?;
//! agent.gather_candidates()?;
//! let conn = agent.dial().await?;
//! ```

pub mod agent;
pub mod candidate;
pub mod error;
pub mod mux;
pub mod stun;

pub use agent::{
	AgentEvent, AgentStats, IceAgent, IceConfig, IceConn, PairStats, DEFAULT_DISCONNECTED_TIMEOUT,
	DEFAULT_FAILED_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL,
};
pub use candidate::{
	candidate_priority, detect_host_addresses, from_sdp, peer_reflexive_candidate, to_sdp, CandidatePair,
	CandidateStats,
};
pub use error::{ConnError, Result};
pub use mux::{Datagram, UdpMux};
pub use stun::{
	build_binding_request, is_stun, parse_binding_response, resolve_stun_servers, StunError, DEFAULT_STUN_SERVERS,
	STUN_MAGIC_COOKIE,
};
