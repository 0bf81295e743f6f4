// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-peer connection engine.
//!
//! Each engine runs one task that owns the ICE session of its peer. Signaling
//! messages and agent events reach that task only through channels, and the
//! shared connection state changes by compare-and-swap on the transitions
//! that depend on the previous state.

use crate::backoff::Backoff;
use crate::error::{EpdiscError, Result};
use crate::interface::InterfaceContext;
use crate::proxy::{KernelProxy, Proxy, UserBindProxy};
use crate::status::{PeerStatus, Reachability};
use chrono::{DateTime, Utc};
use loom_mesh_common::{
	AtomicConnectionState, Candidate, ConnectionState, Credentials, KeyPair, Message, PacketConn,
	PublicKeyPair, WgPrivateKey, WgPublicKey,
};
use loom_mesh_conn::{AgentEvent, CandidatePair, IceAgent};
use loom_mesh_device::{DeviceConfig, PeerConfig, PeerSnapshot};
use loom_mesh_signaling::{
	publish_with_timeout, MessageHandler, SignalingError, CANDIDATE_PUBLISH_TIMEOUT,
	CREDENTIALS_PUBLISH_TIMEOUT,
};
use loom_mesh_watcher::Event;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

use ConnectionState::*;

const MESSAGE_QUEUE: usize = 64;
const AGENT_EVENT_QUEUE: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Queues signaling messages for the engine loop.
struct Forwarder {
	peer: WgPublicKey,
	tx: mpsc::Sender<Message>,
}

impl MessageHandler for Forwarder {
	fn on_signaling_message(&self, _kp: &PublicKeyPair, msg: &Message) {
		if let Err(e) = self.tx.try_send(msg.clone()) {
			match e {
				mpsc::error::TrySendError::Full(msg) => {
					warn!(peer = %self.peer, kind = msg.kind(), "signaling queue full, dropping message")
				}
				mpsc::error::TrySendError::Closed(_) => {
					trace!(peer = %self.peer, "engine gone, dropping message")
				}
			}
		}
	}
}

struct Shared {
	public_key: WgPublicKey,
	intf: Arc<InterfaceContext>,
	state: AtomicConnectionState,
	restart_count: AtomicU32,
	last_state_change: StdMutex<DateTime<Utc>>,
	last_endpoint: StdMutex<Option<SocketAddr>>,
	agent: StdMutex<Option<Arc<IceAgent>>>,
	proxy: Arc<dyn Proxy>,
	handler: Arc<dyn MessageHandler>,
	/// Private key the signaling subscription is registered under.
	subscription: Mutex<WgPrivateKey>,
}

impl Shared {
	fn state(&self) -> ConnectionState {
		self.state.load()
	}

	fn agent(&self) -> Option<Arc<IceAgent>> {
		lock(&self.agent).clone()
	}

	fn take_agent(&self) -> Option<Arc<IceAgent>> {
		lock(&self.agent).take()
	}

	fn last_endpoint(&self) -> Option<SocketAddr> {
		*lock(&self.last_endpoint)
	}

	fn key_pair(&self) -> KeyPair {
		self.intf.key_pair(self.public_key)
	}

	fn is_controlling(&self) -> bool {
		PublicKeyPair::new(self.intf.public_key(), self.public_key).is_controlling()
	}

	fn cas_state(&self, expected: ConnectionState, new: ConnectionState) -> bool {
		let swapped = self.state.set_if(expected, new);
		if swapped {
			self.state_changed(expected, new);
		}
		swapped
	}

	fn set_state_unless(&self, new: ConnectionState, excluded: &[ConnectionState]) -> Option<ConnectionState> {
		let prev = self.state.set_if_not(new, excluded)?;
		self.state_changed(prev, new);
		Some(prev)
	}

	fn state_changed(&self, prev: ConnectionState, new: ConnectionState) {
		if prev == new {
			return;
		}
		*lock(&self.last_state_change) = Utc::now();
		info!(intf = %self.intf.name, peer = %self.public_key, %prev, state = %new, "connection state changed");
		self.intf.events.on_event(&Event::PeerStateChanged {
			interface: self.intf.name.clone(),
			peer: self.public_key,
			new_state: new,
			prev_state: prev,
		});
	}

	/// Programs `endpoint` as the peer's WireGuard endpoint.
	async fn write_endpoint(&self, endpoint: SocketAddr) -> Result<()> {
		if self.last_endpoint() == Some(endpoint) {
			trace!(%endpoint, "endpoint unchanged");
			return Ok(());
		}

		let config =
			DeviceConfig::new().with_peer(PeerConfig::new(self.public_key).update_only().with_endpoint(endpoint));
		self.intf
			.client
			.configure_device(&self.intf.name, config)
			.await
			.map_err(EpdiscError::ConfigureDevice)?;

		*lock(&self.last_endpoint) = Some(endpoint);
		info!(intf = %self.intf.name, peer = %self.public_key, %endpoint, "updated peer endpoint");
		Ok(())
	}
}

/// Engine for one WireGuard peer of an interface.
pub struct PeerEngine {
	shared: Arc<Shared>,
	closed: AtomicBool,
	shutdown_tx: watch::Sender<bool>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerEngine {
	/// Subscribes to signaling for the peer and starts the engine loop.
	#[instrument(skip_all, fields(intf = %intf.name, peer = %peer.public_key))]
	pub(crate) async fn new(peer: &PeerSnapshot, intf: Arc<InterfaceContext>) -> Result<Self> {
		let public_key = peer.public_key;

		let proxy: Arc<dyn Proxy> = match &intf.user_bind {
			Some(bind) => Arc::new(UserBindProxy::new(public_key, Arc::clone(bind))),
			None => {
				let listen_port = intf.listen_port();
				if listen_port == 0 {
					return Err(EpdiscError::ProxyInit(format!("{} has no listen port", intf.name)));
				}
				Arc::new(KernelProxy::new(public_key, intf.nat.clone(), listen_port))
			}
		};

		let (messages_tx, messages) = mpsc::channel(MESSAGE_QUEUE);
		let handler: Arc<dyn MessageHandler> = Arc::new(Forwarder {
			peer: public_key,
			tx: messages_tx,
		});
		let private_key = intf.private_key();
		intf.backend
			.subscribe(&KeyPair::new(private_key.clone(), public_key), Arc::clone(&handler))
			.await
			.map_err(EpdiscError::Subscribe)?;

		let shared = Arc::new(Shared {
			public_key,
			intf: Arc::clone(&intf),
			state: AtomicConnectionState::new(Closed),
			restart_count: AtomicU32::new(0),
			last_state_change: StdMutex::new(Utc::now()),
			last_endpoint: StdMutex::new(None),
			agent: StdMutex::new(None),
			proxy,
			handler,
			subscription: Mutex::new(private_key),
		});

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let engine_loop = EngineLoop {
			shared: Arc::clone(&shared),
			messages,
			shutdown_rx,
			agent_events: None,
			remote_credentials: Credentials::default(),
			pending_candidates: Vec::new(),
			backoff: Backoff::default(),
			retry_at: None,
		};
		let span = info_span!("peer", intf = %intf.name, peer = %public_key);
		let task = tokio::spawn(engine_loop.run().instrument(span));

		info!(proxy = %shared.proxy.proxy_type(), controlling = shared.is_controlling(), "created peer engine");
		Ok(Self {
			shared,
			closed: AtomicBool::new(false),
			shutdown_tx,
			task: Mutex::new(Some(task)),
		})
	}

	pub fn public_key(&self) -> WgPublicKey {
		self.shared.public_key
	}

	pub fn state(&self) -> ConnectionState {
		self.shared.state()
	}

	pub fn restart_count(&self) -> u32 {
		self.shared.restart_count.load(Ordering::Acquire)
	}

	pub fn last_state_change(&self) -> DateTime<Utc> {
		*lock(&self.shared.last_state_change)
	}

	/// The endpoint this engine last wrote to the device.
	pub fn last_endpoint(&self) -> Option<SocketAddr> {
		self.shared.last_endpoint()
	}

	pub fn is_controlling(&self) -> bool {
		self.shared.is_controlling()
	}

	pub fn selected_pair(&self) -> Option<CandidatePair> {
		self.shared.agent().and_then(|a| a.selected_pair())
	}

	pub fn reachability(&self) -> Reachability {
		Reachability::classify(self.state(), self.selected_pair().as_ref())
	}

	/// Stops the engine from starting new sessions.
	pub fn mark_closing(&self) {
		self.shared.set_state_unless(Closing, &[Closing]);
	}

	/// Closes the agent and the proxy and stops the loop. Idempotent.
	#[instrument(skip(self), fields(intf = %self.shared.intf.name, peer = %self.shared.public_key))]
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.mark_closing();
		let _ = self.shutdown_tx.send(true);

		if let Some(mut task) = self.task.lock().await.take() {
			if timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
				warn!("engine loop did not stop in time, aborting");
				task.abort();
			}
		}

		if let Some(agent) = self.shared.take_agent() {
			agent.close().await;
		}
		if let Err(e) = self.shared.proxy.close().await {
			warn!(error = %e, "failed to close proxy");
		}

		let private_key = self.shared.subscription.lock().await.clone();
		if let Err(e) = self
			.shared
			.intf
			.backend
			.unsubscribe(&KeyPair::new(private_key, self.shared.public_key), &self.shared.handler)
			.await
		{
			warn!(error = %e, "failed to unsubscribe from signaling");
		}
		info!("closed peer engine");
	}

	/// Moves the signaling subscription to the interface's current private key.
	///
	/// Subscribes under the new key before leaving the old one. If leaving
	/// fails the new subscription is withdrawn again.
	#[instrument(skip(self), fields(intf = %self.shared.intf.name, peer = %self.shared.public_key))]
	pub async fn resubscribe(&self) -> Result<()> {
		let mut current = self.shared.subscription.lock().await;
		let private_key = self.shared.intf.private_key();
		if private_key.public_key() == current.public_key() {
			return Ok(());
		}

		let backend = &self.shared.intf.backend;
		let handler = &self.shared.handler;
		let theirs = self.shared.public_key;
		let new_kp = KeyPair::new(private_key.clone(), theirs);

		backend
			.subscribe(&new_kp, Arc::clone(handler))
			.await
			.map_err(EpdiscError::Subscribe)?;

		if let Err(e) = backend.unsubscribe(&KeyPair::new(current.clone(), theirs), handler).await {
			if let Err(rollback) = backend.unsubscribe(&new_kp, handler).await {
				error!(error = %rollback, "failed to withdraw new subscription");
			}
			return Err(EpdiscError::Subscribe(e));
		}

		debug!(old = %current.public_key(), new = %private_key.public_key(), "moved signaling subscription");
		*current = private_key;
		Ok(())
	}

	/// Follows a change of the interface listen port.
	pub async fn update_listen_port(&self, listen_port: u16) {
		match self.shared.proxy.update_listen_port(listen_port).await {
			Ok(Some(endpoint)) => {
				if let Err(e) = self.shared.write_endpoint(endpoint).await {
					error!(peer = %self.shared.public_key, error = %e, "failed to update endpoint after listen port change");
				}
			}
			Ok(None) => {}
			Err(e) => warn!(peer = %self.shared.public_key, listen_port, error = %e, "proxy failed to follow listen port"),
		}
	}

	/// Checks an endpoint observed on the device against the one this
	/// engine wrote. Returns true if something else changed it.
	pub fn on_endpoint_modified(&self, endpoint: Option<SocketAddr>) -> bool {
		let expected = self.shared.last_endpoint();
		if endpoint == expected {
			return false;
		}
		warn!(
			intf = %self.shared.intf.name,
			peer = %self.shared.public_key,
			observed = ?endpoint,
			expected = ?expected,
			"peer endpoint was modified externally"
		);
		true
	}

	pub fn marshal(&self) -> PeerStatus {
		let state = self.state();
		let agent = self.shared.agent();
		let pair = agent.as_ref().and_then(|a| a.selected_pair());

		PeerStatus {
			public_key: self.shared.public_key,
			state,
			restart_count: self.restart_count(),
			last_state_change: self.last_state_change(),
			proxy_type: self.shared.proxy.proxy_type(),
			reachability: Reachability::classify(state, pair.as_ref()),
			last_endpoint: self.last_endpoint(),
			local_ufrag: agent.as_ref().map(|a| a.local_credentials().ufrag),
			agent: agent.map(|a| a.stats()),
		}
	}
}

impl Drop for PeerEngine {
	fn drop(&mut self) {
		let _ = self.shutdown_tx.send(true);
	}
}

async fn next_agent_event(events: &mut Option<mpsc::Receiver<AgentEvent>>) -> Option<AgentEvent> {
	match events {
		Some(rx) => rx.recv().await,
		None => std::future::pending().await,
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

/// State owned by the engine task.
struct EngineLoop {
	shared: Arc<Shared>,
	messages: mpsc::Receiver<Message>,
	shutdown_rx: watch::Receiver<bool>,
	agent_events: Option<mpsc::Receiver<AgentEvent>>,
	/// Last remote credentials accepted for the current agent.
	remote_credentials: Credentials,
	/// Candidates received before the remote credentials.
	pending_candidates: Vec<Candidate>,
	backoff: Backoff,
	retry_at: Option<Instant>,
}

impl EngineLoop {
	async fn run(mut self) {
		self.on_closed().await;

		loop {
			tokio::select! {
				biased;

				_ = self.shutdown_rx.changed() => break,

				Some(msg) = self.messages.recv() => self.on_message(msg).await,

				event = next_agent_event(&mut self.agent_events) => match event {
					Some(event) => self.on_agent_event(event).await,
					None => self.agent_events = None,
				},

				_ = sleep_until(self.retry_at) => {
					self.retry_at = None;
					self.on_retry().await;
				}
			}
		}

		debug!("engine loop stopped");
	}

	fn schedule_retry(&mut self) {
		let delay = self.backoff.next_delay();
		trace!(?delay, "scheduled retry");
		self.retry_at = Some(Instant::now() + delay);
	}

	fn clear_retry(&mut self) {
		self.retry_at = None;
		self.backoff.reset();
	}

	async fn on_closed(&mut self) {
		if !self.shared.cas_state(Closed, Creating) {
			return;
		}
		self.create_agent().await;
	}

	async fn create_agent(&mut self) {
		let intf = &self.shared.intf;
		let (events_tx, events_rx) = mpsc::channel(AGENT_EVENT_QUEUE);
		let created = IceAgent::new(
			intf.ice.clone(),
			Arc::clone(&intf.mux),
			Arc::clone(&intf.mux_srflx),
			events_tx,
		)
		.await;

		let agent = match created {
			Ok(agent) => Arc::new(agent),
			Err(e) => {
				let e = EpdiscError::AgentCreate(e);
				error!(error = %e, "agent creation failed, will retry");
				self.schedule_retry();
				return;
			}
		};

		self.remote_credentials = Credentials::default();
		self.pending_candidates.clear();
		self.agent_events = Some(events_rx);
		*lock(&self.shared.agent) = Some(Arc::clone(&agent));
		self.clear_retry();

		if self.shared.cas_state(Creating, Idle) {
			debug!(ufrag = %agent.local_credentials().ufrag, "created agent");
			self.send_credentials(&agent, true).await;
			self.schedule_retry();
		}
	}

	async fn send_credentials(&self, agent: &IceAgent, need_creds: bool) -> bool {
		let creds = agent.local_credentials().with_need_creds(need_creds);
		let msg = Message::Credentials(creds);
		let backend = &self.shared.intf.backend;
		match publish_with_timeout(backend.as_ref(), &self.shared.key_pair(), &msg, CREDENTIALS_PUBLISH_TIMEOUT).await {
			Ok(()) => {
				trace!(need_creds, "sent credentials");
				true
			}
			Err(SignalingError::Closed) => {
				debug!("signaling backend closed");
				false
			}
			Err(e) => {
				error!(error = %e, "failed to send credentials");
				true
			}
		}
	}

	async fn on_retry(&mut self) {
		match self.shared.state() {
			Creating => self.create_agent().await,
			Idle => {
				let Some(agent) = self.shared.agent() else {
					return;
				};
				debug!("no answer yet, sending credentials again");
				if self.send_credentials(&agent, true).await {
					self.schedule_retry();
				}
			}
			Connecting | Connected | Disconnected => {
				let connected = self
					.shared
					.agent()
					.map(|a| a.state().is_established())
					.unwrap_or(false);
				if connected {
					self.establish().await;
				}
			}
			_ => {}
		}
	}

	async fn on_message(&mut self, msg: Message) {
		match msg {
			Message::Credentials(creds) => self.on_credentials(creds).await,
			Message::Candidate(candidate) => self.on_candidate(candidate).await,
			Message::PeerDescription(desc) => debug!(change = ?desc.change, "ignoring peer description"),
		}
	}

	async fn on_credentials(&mut self, creds: Credentials) {
		let Some(agent) = self.shared.agent() else {
			debug!(state = %self.shared.state(), "no agent, dropping credentials");
			return;
		};

		if !self.remote_credentials.is_empty() && !creds.is_empty() && !self.remote_credentials.same_session(&creds) {
			info!(old = %self.remote_credentials.ufrag, new = %creds.ufrag, "remote credentials changed");
			self.restart("remote session restarted").await;
			return;
		}

		if creds.need_creds {
			self.send_credentials(&agent, false).await;
		}

		if !self.shared.cas_state(Idle, New) {
			trace!(ufrag = %creds.ufrag, "credentials already known");
			return;
		}

		if let Err(e) = agent.set_remote_credentials(creds.clone()) {
			warn!(error = %e, "failed to set remote credentials");
			return;
		}
		self.remote_credentials = creds.with_need_creds(false);
		self.clear_retry();

		if let Err(e) = agent.gather_candidates() {
			warn!(error = %e, "failed to start gathering");
		}

		let pending = std::mem::take(&mut self.pending_candidates);
		if !pending.is_empty() {
			for candidate in pending {
				if let Err(e) = agent.add_remote_candidate(candidate) {
					warn!(error = %e, "failed to add buffered candidate");
				}
			}
			self.connect(&agent);
		}
	}

	async fn on_candidate(&mut self, candidate: Candidate) {
		match self.shared.state() {
			Idle => {
				trace!(%candidate, "buffering candidate until credentials arrive");
				if !self.pending_candidates.contains(&candidate) {
					self.pending_candidates.push(candidate);
				}
			}
			Creating | Closed | Closing => trace!(%candidate, "dropping candidate"),
			state => {
				let Some(agent) = self.shared.agent() else {
					return;
				};
				debug!(%candidate, "received remote candidate");
				if let Err(e) = agent.add_remote_candidate(candidate) {
					warn!(error = %e, "failed to add remote candidate");
					return;
				}
				if state == New {
					self.connect(&agent);
				}
			}
		}
	}

	fn connect(&self, agent: &IceAgent) {
		if !self.shared.cas_state(New, Connecting) {
			return;
		}
		let controlling = self.shared.is_controlling();
		match agent.start(controlling) {
			Ok(()) => debug!(controlling, "started connectivity checks"),
			Err(e) => warn!(error = %e, "failed to start connectivity checks"),
		}
	}

	async fn on_agent_event(&mut self, event: AgentEvent) {
		match event {
			AgentEvent::Candidate(candidate) => {
				debug!(%candidate, "gathered local candidate");
				let backend = &self.shared.intf.backend;
				let msg = Message::Candidate(candidate);
				if let Err(e) =
					publish_with_timeout(backend.as_ref(), &self.shared.key_pair(), &msg, CANDIDATE_PUBLISH_TIMEOUT).await
				{
					error!(error = %e, "failed to send candidate");
				}
			}
			AgentEvent::GatheringComplete => debug!("candidate gathering complete"),
			AgentEvent::SelectedPairChange(pair) => {
				debug!(%pair, "selected candidate pair changed");
				if self.shared.state().is_established() {
					self.establish().await;
				}
			}
			AgentEvent::StateChange(state) => self.on_agent_state(state).await,
		}
	}

	async fn on_agent_state(&mut self, state: ConnectionState) {
		debug!(agent_state = %state, "agent state changed");
		match state {
			Connected | Completed => {
				if matches!(self.shared.state(), Connecting | Connected | Disconnected) {
					self.establish().await;
				}
			}
			Failed => {
				self.shared.set_state_unless(Failed, &[Closing, Closed, Creating]);
				self.restart("connectivity checks failed").await;
			}
			Disconnected => {
				self.shared.set_state_unless(Disconnected, &[Closing, Closed, Creating, Idle, New]);
				if self.shared.intf.restart_on_disconnect {
					self.restart("connection lost").await;
				}
			}
			Closed => self.restart("agent closed").await,
			_ => {}
		}
	}

	/// Points WireGuard at the selected pair and enters `Connected`.
	async fn establish(&mut self) {
		match self.update_endpoint().await {
			Ok(()) => {
				self.clear_retry();
				self.shared
					.set_state_unless(Connected, &[Closing, Closed, Creating, Idle, New]);
			}
			Err(e) => {
				error!(error = %e, "failed to update endpoint, will retry");
				self.schedule_retry();
			}
		}
	}

	async fn update_endpoint(&self) -> Result<()> {
		let agent = self.shared.agent().ok_or(EpdiscError::Closed)?;
		let pair = agent.selected_pair().ok_or(EpdiscError::NoSelectedPair)?;
		let conn: Arc<dyn PacketConn> = Arc::new(agent.conn());
		let endpoint = self.shared.proxy.update_candidate_pair(&pair, conn).await?;
		self.shared.write_endpoint(endpoint).await
	}

	/// Replaces the agent with a fresh one.
	async fn restart(&mut self, reason: &str) {
		let state = self.shared.state();
		if matches!(state, Closing | Closed | Creating) {
			return;
		}
		info!(reason, %state, "restarting session");

		self.agent_events = None;
		self.clear_retry();
		if let Some(agent) = self.shared.take_agent() {
			agent.close().await;
		}
		self.shared.restart_count.fetch_add(1, Ordering::AcqRel);

		if self.shared.set_state_unless(Closed, &[Closing]).is_none() {
			return;
		}
		self.on_closed().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::EndpointDiscoveryConfig;
	use crate::interface::{Interface, Services};
	use async_trait::async_trait;
	use loom_mesh_conn::IceConfig;
	use loom_mesh_device::{InterfaceType, MemoryWireGuard, WireGuardClient};
	use loom_mesh_signaling::{Backend, InProcessBackend, InProcessHub, Result as SignalingResult};
	use loom_mesh_watcher::Handlers;
	use std::net::{IpAddr, Ipv4Addr};

	/// Backend that refuses a number of unsubscribe calls.
	struct FlakyBackend {
		inner: InProcessBackend,
		refuse_unsubscribe: AtomicU32,
	}

	#[async_trait]
	impl Backend for FlakyBackend {
		async fn publish(&self, kp: &KeyPair, msg: &Message) -> SignalingResult<()> {
			self.inner.publish(kp, msg).await
		}

		async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> SignalingResult<bool> {
			self.inner.subscribe(kp, handler).await
		}

		async fn unsubscribe(&self, kp: &KeyPair, handler: &Arc<dyn MessageHandler>) -> SignalingResult<bool> {
			let refused = self
				.refuse_unsubscribe
				.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
				.is_ok();
			if refused {
				return Err(SignalingError::Transport("unsubscribe refused".to_string()));
			}
			self.inner.unsubscribe(kp, handler).await
		}

		async fn close(&self) -> SignalingResult<()> {
			self.inner.close().await
		}

		fn kind(&self) -> &'static str {
			"flaky"
		}
	}

	fn config() -> EndpointDiscoveryConfig {
		EndpointDiscoveryConfig::new(IceConfig {
			host_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
			..IceConfig::default()
		})
		.with_mux_ports(0, 0)
		.with_mux_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
	}

	async fn setup(listen_port: u16, backend: Arc<dyn Backend>) -> (Arc<MemoryWireGuard>, Interface) {
		let client = Arc::new(MemoryWireGuard::new());
		let snapshot = client
			.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), listen_port)
			.await
			.unwrap();
		let services = Services {
			client: Arc::clone(&client) as Arc<dyn WireGuardClient>,
			backend,
			events: Arc::new(Handlers::new()),
			filter: None,
			config: config(),
		};
		let intf = Interface::new(&snapshot, &services).await.unwrap();
		(client, intf)
	}

	async fn wait_for_state(engine: &PeerEngine, state: ConnectionState) {
		timeout(Duration::from_secs(5), async {
			while engine.state() != state {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn new_engine_waits_idle_for_credentials() {
		let backend = Arc::new(InProcessBackend::new(InProcessHub::new()));
		let (_client, intf) = setup(51820, backend.clone()).await;
		let peer = PeerSnapshot::new(WgPrivateKey::generate().public_key());
		let engine = intf.add_peer(&peer).await.unwrap();

		wait_for_state(&engine, Idle).await;
		assert!(backend.registry().is_subscribed(&intf.public_key()).await);
		let status = engine.marshal();
		assert_eq!(status.reachability, Reachability::None);
		assert!(status.local_ufrag.is_some());
		assert_eq!(status.restart_count, 0);
	}

	#[tokio::test]
	async fn kernel_device_without_listen_port_fails_proxy_init() {
		let backend = Arc::new(InProcessBackend::new(InProcessHub::new()));
		let (_client, intf) = setup(0, backend).await;
		let peer = PeerSnapshot::new(WgPrivateKey::generate().public_key());
		assert!(matches!(intf.add_peer(&peer).await, Err(EpdiscError::ProxyInit(_))));
		assert!(intf.peers().await.is_empty());
	}

	#[tokio::test]
	async fn close_releases_subscription_and_agent() {
		let backend = Arc::new(InProcessBackend::new(InProcessHub::new()));
		let (_client, intf) = setup(51820, backend.clone()).await;
		let peer = PeerSnapshot::new(WgPrivateKey::generate().public_key());
		let engine = intf.add_peer(&peer).await.unwrap();
		wait_for_state(&engine, Idle).await;

		timeout(Duration::from_secs(5), engine.close()).await.unwrap();
		assert_eq!(engine.state(), Closing);
		assert!(engine.marshal().agent.is_none());
		assert!(backend.registry().is_empty().await);

		engine.close().await;
	}

	#[tokio::test]
	async fn agent_is_replaced_on_restart_and_dropped_on_close() {
		let backend = Arc::new(InProcessBackend::new(InProcessHub::new()));
		let (_client, intf) = setup(51820, backend.clone()).await;
		let remote = WgPrivateKey::generate();
		let peer = PeerSnapshot::new(remote.public_key());
		let engine = intf.add_peer(&peer).await.unwrap();
		wait_for_state(&engine, Idle).await;
		let first = engine.shared.agent().unwrap();

		let kp = KeyPair::new(remote, intf.public_key());
		let creds = Message::Credentials(Credentials::new("aaaaaaaa", "first-session-password"));
		backend.publish(&kp, &creds).await.unwrap();
		wait_for_state(&engine, New).await;
		assert!(Arc::ptr_eq(&first, &engine.shared.agent().unwrap()));

		let restarted = Message::Credentials(Credentials::new("bbbbbbbb", "second-session-password"));
		backend.publish(&kp, &restarted).await.unwrap();
		timeout(Duration::from_secs(5), async {
			while engine.restart_count() == 0 || engine.state() != Idle {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.unwrap();

		let second = engine.shared.agent().unwrap();
		assert!(!Arc::ptr_eq(&first, &second));
		assert_ne!(
			first.local_credentials().ufrag,
			second.local_credentials().ufrag
		);
		assert_eq!(engine.restart_count(), 1);

		engine.close().await;
		assert_eq!(engine.state(), Closing);
		assert!(engine.shared.agent().is_none());
	}

	#[tokio::test]
	async fn resubscribe_moves_subscription_to_new_key() {
		let backend = Arc::new(InProcessBackend::new(InProcessHub::new()));
		let (_client, intf) = setup(51820, backend.clone()).await;
		let old = intf.public_key();
		let peer = PeerSnapshot::new(WgPrivateKey::generate().public_key());
		intf.add_peer(&peer).await.unwrap();

		let private_key = WgPrivateKey::generate();
		let new = private_key.public_key();
		intf.update_private_key(private_key).await.unwrap();

		assert!(backend.registry().is_subscribed(&new).await);
		assert!(!backend.registry().is_subscribed(&old).await);
	}

	#[tokio::test]
	async fn failed_unsubscribe_rolls_back_new_subscription() {
		let flaky = Arc::new(FlakyBackend {
			inner: InProcessBackend::new(InProcessHub::new()),
			refuse_unsubscribe: AtomicU32::new(0),
		});
		let (_client, intf) = setup(51820, flaky.clone()).await;
		let old = intf.public_key();
		let peer = PeerSnapshot::new(WgPrivateKey::generate().public_key());
		intf.add_peer(&peer).await.unwrap();

		flaky.refuse_unsubscribe.store(1, Ordering::Relaxed);
		let private_key = WgPrivateKey::generate();
		let new = private_key.public_key();
		let result = intf.update_private_key(private_key).await;

		assert!(matches!(result, Err(EpdiscError::Subscribe(_))));
		assert!(flaky.inner.registry().is_subscribed(&old).await);
		assert!(!flaky.inner.registry().is_subscribed(&new).await);
	}

	#[tokio::test]
	async fn external_endpoint_is_reported_once_it_differs() {
		let backend = Arc::new(InProcessBackend::new(InProcessHub::new()));
		let (_client, intf) = setup(51820, backend).await;
		let peer = PeerSnapshot::new(WgPrivateKey::generate().public_key());
		let engine = intf.add_peer(&peer).await.unwrap();

		assert!(!engine.on_endpoint_modified(None));
		assert!(engine.on_endpoint_modified(Some("203.0.113.9:51820".parse().unwrap())));
		assert_eq!(engine.last_endpoint(), None);
	}
}
