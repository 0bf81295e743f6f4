// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! ICE agent for a single UDP component.
//!
//! Connectivity checks, nomination and consent freshness are run by str0m's
//! sans-IO agent. This module drives it: datagrams from the host and server
//! reflexive muxes are fed in, its transmits go out through the mux that owns
//! the source address, and its events become [`AgentEvent`]s. On top of that
//! the agent reports `Failed` after `failed_timeout` without a usable pair,
//! `Disconnected` after `disconnected_timeout` of silence, and keeps NAT
//! mappings of the selected pair open with binding indications.

use crate::candidate::{detect_host_addresses, from_ice, peer_reflexive_candidate, to_ice, CandidatePair, CandidateStats};
use crate::error::{ConnError, Result};
use crate::mux::{Datagram, UdpMux};
use crate::stun::{build_binding_indication, is_stun};
use async_trait::async_trait;
use loom_mesh_common::{Candidate, CandidateType, ConnectionState, Credentials, PacketConn};
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use str0m::ice::{IceAgent as Ice, IceAgentEvent, IceCreds, StunMessage, StunPacket};
use str0m::net::Protocol;
use str0m::IceConnectionState;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

pub const DEFAULT_FAILED_TIMEOUT: Duration = Duration::from_secs(25);
pub const DEFAULT_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

const STUN_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const DATA_QUEUE: usize = 256;
const IDLE_WAKEUP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct IceConfig {
	/// Addresses advertised as host candidates. Detected when empty.
	pub host_addresses: Vec<IpAddr>,
	pub stun_servers: Vec<SocketAddr>,
	pub failed_timeout: Duration,
	pub disconnected_timeout: Duration,
	pub keepalive_interval: Duration,
}

impl Default for IceConfig {
	fn default() -> Self {
		Self {
			host_addresses: Vec::new(),
			stun_servers: Vec::new(),
			failed_timeout: DEFAULT_FAILED_TIMEOUT,
			disconnected_timeout: DEFAULT_DISCONNECTED_TIMEOUT,
			keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
		}
	}
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
	Candidate(Candidate),
	GatheringComplete,
	StateChange(ConnectionState),
	SelectedPairChange(CandidatePair),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxKind {
	Host,
	Srflx,
}

struct LocalCandidate {
	candidate: Candidate,
	base: SocketAddr,
	mux: MuxKind,
	/// The host candidate on the server reflexive mux is only used for
	/// checks and never signaled.
	advertised: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
	packets_sent: u64,
	bytes_sent: u64,
	packets_received: u64,
	bytes_received: u64,
}

struct Selected {
	pair: CandidatePair,
	destination: SocketAddr,
	mux: MuxKind,
	counters: Counters,
}

struct Driver {
	ice: Ice,
	remote_credentials: Option<Credentials>,
	controlling: Option<bool>,
	gathering: bool,
	local: Vec<LocalCandidate>,
	remote: Vec<Candidate>,
	/// Remote sources that passed a connectivity check.
	sources: HashSet<SocketAddr>,
	selected: Option<Selected>,
	/// Set while str0m itself considers the session disconnected.
	ice_disconnected: bool,
	/// When the agent entered `Checking` or `Disconnected`.
	since: Option<Instant>,
	last_received: Option<Instant>,
	last_keepalive: Option<Instant>,
}

impl Driver {
	fn is_known(&self, from: SocketAddr) -> bool {
		self.sources.contains(&from) || self.selected.as_ref().is_some_and(|s| s.destination == from)
	}

	fn owns(local: &LocalCandidate, addr: SocketAddr) -> bool {
		local.base == addr || local.candidate.socket_addr() == addr
	}

	fn mux_for(&self, source: SocketAddr) -> MuxKind {
		self.local
			.iter()
			.find(|l| Self::owns(l, source))
			.map_or(MuxKind::Host, |l| l.mux)
	}

	/// Local base a datagram from `from` arrived on. The mux socket does not
	/// report the destination address, so a base with the sender's address
	/// is preferred, then any base of the same family.
	fn local_base(&self, mux: MuxKind, from: SocketAddr) -> Option<SocketAddr> {
		let bases: Vec<SocketAddr> = self
			.local
			.iter()
			.filter(|l| l.mux == mux && l.base.is_ipv4() == from.is_ipv4())
			.map(|l| l.base)
			.collect();
		bases
			.iter()
			.find(|b| b.ip() == from.ip())
			.or_else(|| bases.first())
			.copied()
	}

	/// Signaled candidate behind the address str0m sends from.
	fn local_for(&self, source: SocketAddr) -> Option<&LocalCandidate> {
		self.local
			.iter()
			.filter(|l| Self::owns(l, source))
			.max_by_key(|l| (l.advertised, l.candidate.candidate_type == CandidateType::ServerReflexive))
	}
}

enum Action {
	Send {
		mux: MuxKind,
		to: SocketAddr,
		data: Vec<u8>,
	},
	Emit(AgentEvent),
}

struct Shared {
	config: IceConfig,
	host_mux: Arc<UdpMux>,
	srflx_mux: Arc<UdpMux>,
	local_credentials: Credentials,
	state_tx: watch::Sender<ConnectionState>,
	driver: Mutex<Driver>,
	wake: Notify,
	events: mpsc::Sender<AgentEvent>,
	data_tx: mpsc::Sender<Vec<u8>>,
	data_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
	shutdown_tx: watch::Sender<bool>,
}

impl Shared {
	fn lock(&self) -> MutexGuard<'_, Driver> {
		self.driver.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn state(&self) -> ConnectionState {
		*self.state_tx.borrow()
	}

	fn set_state(&self, state: ConnectionState, actions: &mut Vec<Action>) {
		// A closed agent stays closed.
		let mut prev = None;
		self.state_tx.send_if_modified(|current| {
			if *current == state || *current == ConnectionState::Closed {
				return false;
			}
			prev = Some(std::mem::replace(current, state));
			true
		});
		if let Some(prev) = prev {
			debug!(ufrag = %self.local_credentials.ufrag, %prev, %state, "ICE state changed");
			actions.push(Action::Emit(AgentEvent::StateChange(state)));
		}
	}

	fn mux(&self, kind: MuxKind) -> &Arc<UdpMux> {
		match kind {
			MuxKind::Host => &self.host_mux,
			MuxKind::Srflx => &self.srflx_mux,
		}
	}

	async fn execute(&self, actions: Vec<Action>) {
		for action in actions {
			match action {
				Action::Send { mux, to, data } => {
					if let Err(e) = self
						.mux(mux)
						.send_to(&self.local_credentials.ufrag, &data, to)
						.await
					{
						debug!(%to, error = %e, "failed to send STUN message");
					}
				}
				Action::Emit(event) => {
					let _ = self.events.send(event).await;
				}
			}
		}
	}

	fn add_local(&self, ice_candidate: str0m::Candidate, base: SocketAddr, mux: MuxKind, advertised: bool) -> Vec<Action> {
		let candidate = match from_ice(&ice_candidate) {
			Ok(candidate) => candidate,
			Err(e) => {
				debug!(error = %e, "skipping local candidate");
				return Vec::new();
			}
		};

		let mut driver = self.lock();
		if driver.local.iter().any(|l| {
			l.candidate.socket_addr() == candidate.socket_addr() && l.candidate.candidate_type == candidate.candidate_type
		}) {
			return Vec::new();
		}
		let _ = driver.ice.add_local_candidate(ice_candidate);
		driver.local.push(LocalCandidate {
			candidate: candidate.clone(),
			base,
			mux,
			advertised,
		});
		self.wake.notify_one();

		if !advertised {
			return Vec::new();
		}
		debug!(%candidate, "gathered local candidate");
		vec![Action::Emit(AgentEvent::Candidate(candidate))]
	}

	/// Collects what str0m wants sent and reacts to its events.
	fn drain(&self, driver: &mut Driver, now: Instant) -> Vec<Action> {
		let mut actions = Vec::new();

		while let Some(transmit) = driver.ice.poll_transmit() {
			let mux = driver.mux_for(transmit.source);
			actions.push(Action::Send {
				mux,
				to: transmit.destination,
				data: transmit.contents.into(),
			});
		}

		while let Some(event) = driver.ice.poll_event() {
			match event {
				IceAgentEvent::DiscoveredRecv { source, .. } => {
					trace!(%source, "remote source verified");
					driver.sources.insert(source);
				}
				IceAgentEvent::NominatedSend {
					source, destination, ..
				} => self.select(driver, source, destination, now, &mut actions),
				IceAgentEvent::IceConnectionStateChange(state) => self.on_ice_state(driver, state, now, &mut actions),
				_ => {}
			}
		}

		actions
	}

	fn select(&self, driver: &mut Driver, source: SocketAddr, destination: SocketAddr, now: Instant, actions: &mut Vec<Action>) {
		let Some(local) = driver.local_for(source) else {
			warn!(%source, "nominated pair from unknown local address");
			return;
		};
		let mux = local.mux;
		let local = local.candidate.clone();
		let remote = driver
			.remote
			.iter()
			.find(|c| c.socket_addr() == destination)
			.cloned()
			.unwrap_or_else(|| peer_reflexive_candidate(destination));
		let pair = CandidatePair { local, remote };

		driver.ice_disconnected = false;
		driver.since = None;
		driver.last_received = Some(now);
		driver.sources.insert(destination);

		if driver.selected.as_ref().map(|s| &s.pair) != Some(&pair) {
			info!(ufrag = %self.local_credentials.ufrag, %pair, "selected candidate pair");
			driver.selected = Some(Selected {
				pair: pair.clone(),
				destination,
				mux,
				counters: Counters::default(),
			});
			actions.push(Action::Emit(AgentEvent::SelectedPairChange(pair)));
		}
		self.set_state(ConnectionState::Connected, actions);
	}

	fn on_ice_state(&self, driver: &mut Driver, state: IceConnectionState, now: Instant, actions: &mut Vec<Action>) {
		trace!(ufrag = %self.local_credentials.ufrag, ?state, "str0m state changed");
		match state {
			IceConnectionState::New | IceConnectionState::Checking => {}
			IceConnectionState::Connected | IceConnectionState::Completed => {
				driver.ice_disconnected = false;
				if driver.selected.is_some() {
					driver.since = None;
					self.set_state(ConnectionState::Connected, actions);
				}
			}
			IceConnectionState::Disconnected => {
				driver.ice_disconnected = true;
				driver.since.get_or_insert(now);
				if self.state() == ConnectionState::Connected {
					self.set_state(ConnectionState::Disconnected, actions);
				}
			}
		}
	}

	fn handle_datagram(&self, datagram: Datagram, mux: MuxKind) -> Vec<Action> {
		let Datagram { data, from } = datagram;
		let now = Instant::now();
		let mut driver = self.lock();

		if is_stun(&data) {
			if let Ok(message) = StunMessage::parse(&data) {
				if driver.ice.accepts_message(&message) {
					let Some(destination) = driver.local_base(mux, from) else {
						trace!(%from, "check before any local candidate");
						return Vec::new();
					};
					driver.ice.handle_packet(
						now,
						StunPacket {
							proto: Protocol::Udp,
							source: from,
							destination,
							message,
						},
					);
					driver.last_received = Some(now);
					let mut actions = self.drain(&mut driver, now);
					self.recover(&mut driver, &mut actions);
					return actions;
				}
			}
			// Keepalive indications.
			if driver.is_known(from) {
				driver.last_received = Some(now);
			}
			let mut actions = Vec::new();
			self.recover(&mut driver, &mut actions);
			return actions;
		}

		if !driver.is_known(from) {
			trace!(%from, "dropping data from unverified source");
			return Vec::new();
		}
		driver.last_received = Some(now);
		if let Some(selected) = driver.selected.as_mut() {
			selected.counters.packets_received += 1;
			selected.counters.bytes_received += data.len() as u64;
		}
		if self.data_tx.try_send(data).is_err() {
			trace!("receive queue full, dropping datagram");
		}

		let mut actions = Vec::new();
		self.recover(&mut driver, &mut actions);
		actions
	}

	/// Moves an agent that went silent back to connected once traffic resumes.
	fn recover(&self, driver: &mut Driver, actions: &mut Vec<Action>) {
		if self.state() == ConnectionState::Disconnected && driver.selected.is_some() && !driver.ice_disconnected {
			driver.since = None;
			self.set_state(ConnectionState::Connected, actions);
		}
	}

	fn flush(&self) -> Vec<Action> {
		let mut driver = self.lock();
		self.drain(&mut driver, Instant::now())
	}

	fn handle_timeout(&self, now: Instant) -> Vec<Action> {
		if matches!(self.state(), ConnectionState::Closed | ConnectionState::Failed) {
			return Vec::new();
		}

		let mut driver = self.lock();
		driver.ice.handle_timeout(now);
		let mut actions = self.drain(&mut driver, now);

		let state = self.state();
		match state {
			ConnectionState::Checking | ConnectionState::Disconnected => {
				if driver
					.since
					.is_some_and(|t| now.saturating_duration_since(t) >= self.config.failed_timeout)
				{
					warn!(ufrag = %self.local_credentials.ufrag, %state, "connectivity checks timed out");
					self.set_state(ConnectionState::Failed, &mut actions);
					return actions;
				}
			}
			ConnectionState::Connected => {
				let silent = driver
					.last_received
					.map_or(true, |t| now.saturating_duration_since(t) >= self.config.disconnected_timeout);
				if silent {
					warn!(ufrag = %self.local_credentials.ufrag, "no traffic on selected pair");
					driver.since = Some(now);
					self.set_state(ConnectionState::Disconnected, &mut actions);
				}
			}
			_ => {}
		}

		if matches!(self.state(), ConnectionState::Connected | ConnectionState::Disconnected) {
			self.keepalive(&mut driver, now, &mut actions);
		}
		actions
	}

	fn keepalive(&self, driver: &mut Driver, now: Instant, actions: &mut Vec<Action>) {
		let Some(selected) = &driver.selected else {
			return;
		};
		if driver
			.last_keepalive
			.is_some_and(|t| now.saturating_duration_since(t) < self.config.keepalive_interval)
		{
			return;
		}
		let (mux, to) = (selected.mux, selected.destination);
		driver.last_keepalive = Some(now);
		match build_binding_indication() {
			Ok(data) => actions.push(Action::Send { mux, to, data }),
			Err(e) => debug!(error = %e, "failed to encode keepalive"),
		}
	}

	/// Next instant [`Shared::handle_timeout`] has work to do.
	fn deadline(&self, now: Instant) -> Instant {
		let state = self.state();
		if matches!(state, ConnectionState::Closed | ConnectionState::Failed) {
			return now + IDLE_WAKEUP;
		}

		let mut driver = self.lock();
		let mut next = driver.ice.poll_timeout();
		let mut consider = |at: Instant| next = Some(next.map_or(at, |n| n.min(at)));

		match state {
			ConnectionState::Checking | ConnectionState::Disconnected => {
				if let Some(since) = driver.since {
					consider(since + self.config.failed_timeout);
				}
			}
			ConnectionState::Connected => {
				consider(driver.last_received.unwrap_or(now) + self.config.disconnected_timeout);
			}
			_ => {}
		}
		if driver.selected.is_some() {
			consider(driver.last_keepalive.map_or(now, |t| t + self.config.keepalive_interval));
		}

		next.unwrap_or(now + IDLE_WAKEUP)
	}
}

async fn run(
	shared: Arc<Shared>,
	mut host_rx: mpsc::Receiver<Datagram>,
	mut srflx_rx: mpsc::Receiver<Datagram>,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	loop {
		let deadline = tokio::time::Instant::from_std(shared.deadline(Instant::now()));

		let actions = tokio::select! {
			biased;

			_ = shutdown_rx.changed() => break,

			Some(datagram) = host_rx.recv() => shared.handle_datagram(datagram, MuxKind::Host),

			Some(datagram) = srflx_rx.recv() => shared.handle_datagram(datagram, MuxKind::Srflx),

			_ = shared.wake.notified() => shared.flush(),

			_ = tokio::time::sleep_until(deadline) => shared.handle_timeout(Instant::now()),
		};
		shared.execute(actions).await;
	}

	trace!(ufrag = %shared.local_credentials.ufrag, "agent loop stopped");
}

async fn gather(shared: Arc<Shared>) {
	let addresses: Vec<IpAddr> = if shared.config.host_addresses.is_empty() {
		detect_host_addresses()
	} else {
		shared.config.host_addresses.clone()
	};
	let addresses: Vec<IpAddr> = addresses.into_iter().filter(IpAddr::is_ipv4).collect();

	for ip in &addresses {
		let addr = SocketAddr::new(*ip, shared.host_mux.port());
		match str0m::Candidate::host(addr, Protocol::Udp) {
			Ok(candidate) => {
				let actions = shared.add_local(candidate, addr, MuxKind::Host, true);
				shared.execute(actions).await;
			}
			Err(e) => debug!(%addr, error = %e, "skipping host address"),
		}
	}

	let base_ip = addresses
		.first()
		.copied()
		.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
	let base = SocketAddr::new(base_ip, shared.srflx_mux.port());
	match str0m::Candidate::host(base, Protocol::Udp) {
		Ok(candidate) => {
			shared.add_local(candidate, base, MuxKind::Srflx, false);
		}
		Err(e) => debug!(%base, error = %e, "skipping server reflexive base"),
	}

	for server in &shared.config.stun_servers {
		let mapped = match shared.srflx_mux.discover(*server, STUN_DISCOVERY_TIMEOUT).await {
			Ok(mapped) => mapped,
			Err(e) => {
				debug!(%server, error = %e, "server reflexive discovery failed");
				continue;
			}
		};
		match str0m::Candidate::server_reflexive(mapped, base, Protocol::Udp) {
			Ok(candidate) => {
				let actions = shared.add_local(candidate, base, MuxKind::Srflx, true);
				shared.execute(actions).await;
			}
			Err(e) => debug!(%mapped, error = %e, "skipping server reflexive address"),
		}
	}

	debug!(ufrag = %shared.local_credentials.ufrag, "candidate gathering complete");
	let _ = shared.events.send(AgentEvent::GatheringComplete).await;
}

#[derive(Debug, Clone, Serialize)]
pub struct PairStats {
	pub local: CandidateStats,
	pub remote: CandidateStats,
	pub packets_sent: u64,
	pub bytes_sent: u64,
	pub packets_received: u64,
	pub bytes_received: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
	pub state: ConnectionState,
	pub local_candidates: Vec<CandidateStats>,
	pub remote_candidates: Vec<CandidateStats>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub selected_pair: Option<PairStats>,
}

/// One ICE session towards one remote agent.
///
/// Dropping the agent stops its tasks; [`IceAgent::close`] additionally
/// releases its ufrag on both muxes.
pub struct IceAgent {
	shared: Arc<Shared>,
}

impl IceAgent {
	pub async fn new(
		config: IceConfig,
		host_mux: Arc<UdpMux>,
		srflx_mux: Arc<UdpMux>,
		events: mpsc::Sender<AgentEvent>,
	) -> Result<Self> {
		let local_credentials = Credentials::generate();
		let host_rx = host_mux.register(&local_credentials.ufrag).await?;
		let srflx_rx = match srflx_mux.register(&local_credentials.ufrag).await {
			Ok(rx) => rx,
			Err(e) => {
				host_mux.unregister(&local_credentials.ufrag).await;
				return Err(e);
			}
		};

		let ice = Ice::with_local_credentials(IceCreds {
			ufrag: local_credentials.ufrag.clone(),
			pass: local_credentials.pwd.clone(),
		});

		let (state_tx, _) = watch::channel(ConnectionState::New);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);

		let shared = Arc::new(Shared {
			config,
			host_mux,
			srflx_mux,
			local_credentials,
			state_tx,
			driver: Mutex::new(Driver {
				ice,
				remote_credentials: None,
				controlling: None,
				gathering: false,
				local: Vec::new(),
				remote: Vec::new(),
				sources: HashSet::new(),
				selected: None,
				ice_disconnected: false,
				since: None,
				last_received: None,
				last_keepalive: None,
			}),
			wake: Notify::new(),
			events,
			data_tx,
			data_rx: tokio::sync::Mutex::new(data_rx),
			shutdown_tx,
		});

		tokio::spawn(run(Arc::clone(&shared), host_rx, srflx_rx, shutdown_rx));
		debug!(ufrag = %shared.local_credentials.ufrag, "created ICE agent");

		Ok(Self { shared })
	}

	pub fn local_credentials(&self) -> Credentials {
		self.shared.local_credentials.clone()
	}

	pub fn remote_credentials(&self) -> Option<Credentials> {
		self.shared.lock().remote_credentials.clone()
	}

	pub fn set_remote_credentials(&self, credentials: Credentials) -> Result<()> {
		self.ensure_open()?;
		let mut driver = self.shared.lock();
		driver.ice.set_remote_credentials(IceCreds {
			ufrag: credentials.ufrag.clone(),
			pass: credentials.pwd.clone(),
		});
		driver.remote_credentials = Some(credentials.with_need_creds(false));
		self.shared.wake.notify_one();
		Ok(())
	}

	pub fn state(&self) -> ConnectionState {
		self.shared.state()
	}

	fn ensure_open(&self) -> Result<()> {
		if self.shared.state() == ConnectionState::Closed {
			return Err(ConnError::Closed);
		}
		Ok(())
	}

	/// Starts gathering local candidates; each is reported as an event.
	pub fn gather_candidates(&self) -> Result<()> {
		self.ensure_open()?;
		{
			let mut driver = self.shared.lock();
			if driver.gathering {
				return Ok(());
			}
			driver.gathering = true;
		}

		let shared = Arc::clone(&self.shared);
		let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
		tokio::spawn(async move {
			tokio::select! {
				biased;
				_ = shutdown_rx.changed() => {}
				_ = gather(shared) => {}
			}
		});
		Ok(())
	}

	/// Adds a remote candidate. Adding a known candidate again has no effect.
	pub fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
		self.ensure_open()?;
		if candidate.network_type.is_tcp() {
			debug!(%candidate, "ignoring TCP candidate");
			return Ok(());
		}

		let mut driver = self.shared.lock();
		let addr = candidate.socket_addr();
		if let Some(existing) = driver.remote.iter_mut().find(|c| c.socket_addr() == addr) {
			if existing.candidate_type == CandidateType::PeerReflexive
				&& candidate.candidate_type != existing.candidate_type
			{
				*existing = candidate;
			}
			return Ok(());
		}

		let ice_candidate = to_ice(&candidate)?;
		driver.ice.add_remote_candidate(ice_candidate);
		debug!(%candidate, "added remote candidate");
		driver.remote.push(candidate);
		self.shared.wake.notify_one();
		Ok(())
	}

	/// Begins connectivity checks in the given role without waiting.
	pub fn start(&self, controlling: bool) -> Result<()> {
		self.ensure_open()?;
		let mut actions = Vec::new();
		{
			let mut driver = self.shared.lock();
			if driver.remote_credentials.is_none() {
				return Err(ConnError::NoRemoteCredentials);
			}
			if driver.controlling.is_some() {
				return Ok(());
			}
			driver.controlling = Some(controlling);
			driver.ice.set_controlling(controlling);
			driver.since = Some(Instant::now());
			self.shared.set_state(ConnectionState::Checking, &mut actions);
		}
		debug!(ufrag = %self.shared.local_credentials.ufrag, controlling, "starting connectivity checks");
		self.shared.wake.notify_one();

		let shared = Arc::clone(&self.shared);
		tokio::spawn(async move { shared.execute(actions).await });
		Ok(())
	}

	/// Starts checks as the controlling agent and waits for a selected pair.
	pub async fn dial(&self) -> Result<IceConn> {
		self.start(true)?;
		self.wait_connected().await
	}

	/// Starts checks as the controlled agent and waits for a selected pair.
	pub async fn accept(&self) -> Result<IceConn> {
		self.start(false)?;
		self.wait_connected().await
	}

	async fn wait_connected(&self) -> Result<IceConn> {
		let mut state_rx = self.shared.state_tx.subscribe();
		loop {
			let state = *state_rx.borrow_and_update();
			match state {
				ConnectionState::Connected => return Ok(self.conn()),
				ConnectionState::Failed => return Err(ConnError::Failed),
				ConnectionState::Closed => return Err(ConnError::Closed),
				_ => {}
			}
			if state_rx.changed().await.is_err() {
				return Err(ConnError::Closed);
			}
		}
	}

	pub fn conn(&self) -> IceConn {
		IceConn {
			shared: Arc::clone(&self.shared),
		}
	}

	pub fn selected_pair(&self) -> Option<CandidatePair> {
		self.shared.lock().selected.as_ref().map(|s| s.pair.clone())
	}

	pub fn stats(&self) -> AgentStats {
		let driver = self.shared.lock();
		AgentStats {
			state: self.shared.state(),
			local_candidates: driver
				.local
				.iter()
				.filter(|l| l.advertised)
				.map(|l| CandidateStats::from(&l.candidate))
				.collect(),
			remote_candidates: driver.remote.iter().map(CandidateStats::from).collect(),
			selected_pair: driver.selected.as_ref().map(|s| PairStats {
				local: CandidateStats::from(&s.pair.local),
				remote: CandidateStats::from(&s.pair.remote),
				packets_sent: s.counters.packets_sent,
				bytes_sent: s.counters.bytes_sent,
				packets_received: s.counters.packets_received,
				bytes_received: s.counters.bytes_received,
			}),
		}
	}

	/// Stops checks and releases the ufrag. Reports `Closed` through the
	/// event channel if there is room for it.
	pub async fn close(&self) {
		let prev = self.shared.state_tx.send_replace(ConnectionState::Closed);
		if prev == ConnectionState::Closed {
			return;
		}
		let _ = self.shared.shutdown_tx.send(true);

		let ufrag = &self.shared.local_credentials.ufrag;
		self.shared.host_mux.unregister(ufrag).await;
		self.shared.srflx_mux.unregister(ufrag).await;

		let _ = self
			.shared
			.events
			.try_send(AgentEvent::StateChange(ConnectionState::Closed));
		debug!(%ufrag, "closed ICE agent");
	}
}

impl Drop for IceAgent {
	fn drop(&mut self) {
		let _ = self.shared.shutdown_tx.send(true);
	}
}

/// Datagram path over the selected candidate pair.
#[derive(Clone)]
pub struct IceConn {
	shared: Arc<Shared>,
}

impl IceConn {
	fn target(&self, len: usize) -> Option<(MuxKind, SocketAddr)> {
		let mut driver = self.shared.lock();
		let selected = driver.selected.as_mut()?;
		selected.counters.packets_sent += 1;
		selected.counters.bytes_sent += len as u64;
		Some((selected.mux, selected.destination))
	}
}

#[async_trait]
impl PacketConn for IceConn {
	async fn send(&self, data: &[u8]) -> io::Result<usize> {
		if self.shared.state() == ConnectionState::Closed {
			return Err(io::ErrorKind::NotConnected.into());
		}
		let Some((mux, to)) = self.target(data.len()) else {
			return Err(io::ErrorKind::NotConnected.into());
		};
		self.shared
			.mux(mux)
			.send_to(&self.shared.local_credentials.ufrag, data, to)
			.await
	}

	async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
		let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
		if *shutdown_rx.borrow() {
			return Err(io::ErrorKind::NotConnected.into());
		}
		let mut data_rx = self.shared.data_rx.lock().await;

		tokio::select! {
			biased;

			_ = shutdown_rx.changed() => Err(io::ErrorKind::NotConnected.into()),

			data = data_rx.recv() => match data {
				Some(data) => {
					let n = data.len().min(buf.len());
					buf[..n].copy_from_slice(&data[..n]);
					Ok(n)
				}
				None => Err(io::ErrorKind::NotConnected.into()),
			},
		}
	}

	fn local_addr(&self) -> SocketAddr {
		match &self.shared.lock().selected {
			Some(selected) => selected.pair.local.socket_addr(),
			None => self.shared.host_mux.local_addr(),
		}
	}

	fn remote_addr(&self) -> SocketAddr {
		match &self.shared.lock().selected {
			Some(selected) => selected.destination,
			None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
		}
	}
}
