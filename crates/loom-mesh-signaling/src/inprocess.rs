// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Loopback signaling between daemons sharing one process.

use crate::backend::Backend;
use crate::envelope::Envelope;
use crate::error::{Result, SignalingError};
use crate::registry::{MessageHandler, SubscriptionRegistry};
use async_trait::async_trait;
use loom_mesh_common::{KeyPair, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, instrument, trace, warn};

const HUB_CAPACITY: usize = 1024;

/// Broadcast medium shared by all in-process backends.
#[derive(Clone)]
pub struct InProcessHub {
	tx: broadcast::Sender<Arc<Vec<u8>>>,
}

impl InProcessHub {
	pub fn new() -> Self {
		let (tx, _) = broadcast::channel(HUB_CAPACITY);
		Self { tx }
	}

	fn send(&self, frame: Vec<u8>) {
		// No receivers just means nobody is listening yet.
		let _ = self.tx.send(Arc::new(frame));
	}

	fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
		self.tx.subscribe()
	}
}

impl Default for InProcessHub {
	fn default() -> Self {
		Self::new()
	}
}

pub struct InProcessBackend {
	hub: InProcessHub,
	registry: Arc<SubscriptionRegistry>,
	closed: AtomicBool,
	shutdown_tx: watch::Sender<bool>,
}

impl InProcessBackend {
	pub fn new(hub: InProcessHub) -> Self {
		let registry = Arc::new(SubscriptionRegistry::new());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		tokio::spawn(receive_loop(hub.subscribe(), Arc::clone(&registry), shutdown_rx));

		Self {
			hub,
			registry,
			closed: AtomicBool::new(false),
			shutdown_tx,
		}
	}

	pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
		&self.registry
	}
}

async fn receive_loop(
	mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
	registry: Arc<SubscriptionRegistry>,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	loop {
		tokio::select! {
			biased;

			_ = shutdown_rx.changed() => {
				debug!("in-process backend receive loop stopped");
				return;
			}

			frame = rx.recv() => {
				let frame = match frame {
					Ok(frame) => frame,
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!(skipped, "in-process backend lagged, envelopes dropped");
						continue;
					}
					Err(broadcast::error::RecvError::Closed) => return,
				};

				let env = match Envelope::from_bytes(&frame) {
					Ok(env) => env,
					Err(e) => {
						warn!(error = %e, "discarding malformed envelope");
						continue;
					}
				};

				match registry.dispatch(&env).await {
					Ok(_) | Err(SignalingError::NotSubscribed(_)) => {}
					Err(e) => trace!(error = %e, "envelope not delivered"),
				}
			}
		}
	}
}

#[async_trait]
impl Backend for InProcessBackend {
	#[instrument(skip(self, kp, msg), fields(theirs = %kp.theirs, kind = msg.kind()))]
	async fn publish(&self, kp: &KeyPair, msg: &Message) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(SignalingError::Closed);
		}
		let env = Envelope::seal(msg, kp)?;
		self.hub.send(env.to_bytes());
		trace!("published envelope");
		Ok(())
	}

	async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> Result<bool> {
		if self.closed.load(Ordering::Acquire) {
			return Err(SignalingError::Closed);
		}
		Ok(self.registry.subscribe(kp, handler).await)
	}

	async fn unsubscribe(&self, kp: &KeyPair, handler: &Arc<dyn MessageHandler>) -> Result<bool> {
		Ok(self.registry.unsubscribe(kp, handler).await)
	}

	async fn close(&self) -> Result<()> {
		if !self.closed.swap(true, Ordering::AcqRel) {
			let _ = self.shutdown_tx.send(true);
		}
		Ok(())
	}

	fn kind(&self) -> &'static str {
		"inprocess"
	}
}

impl Drop for InProcessBackend {
	fn drop(&mut self) {
		let _ = self.shutdown_tx.send(true);
	}
}
