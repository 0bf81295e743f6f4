// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::envelope::Envelope;
use crate::error::{Result, SignalingError};
use loom_mesh_common::{KeyPair, Message, PublicKeyPair, WgPrivateKey, WgPublicKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace, warn};

/// Receives decrypted signaling messages.
///
/// Called while the registry read lock is held. Implementations must not
/// block; engines forward into their own queues.
pub trait MessageHandler: Send + Sync {
	fn on_signaling_message(&self, kp: &PublicKeyPair, msg: &Message);
}

fn same_handler(a: &Arc<dyn MessageHandler>, b: &Arc<dyn MessageHandler>) -> bool {
	Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct Subscription {
	private_key: WgPrivateKey,
	handlers: HashMap<WgPublicKey, Vec<Arc<dyn MessageHandler>>>,
}

impl Subscription {
	fn handler_count(&self) -> usize {
		self.handlers.values().map(Vec::len).sum()
	}
}

/// Subscriptions keyed by our public key.
///
/// Handlers registered under [`WgPublicKey::ZERO`] receive messages from any sender.
#[derive(Default)]
pub struct SubscriptionRegistry {
	subs: RwLock<HashMap<WgPublicKey, Subscription>>,
	decrypt_failures: AtomicU64,
}

impl SubscriptionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns true if a subscription for `kp.ours` was created.
	#[instrument(skip(self, kp, handler), fields(ours = %kp.ours.public_key(), theirs = %kp.theirs))]
	pub async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> bool {
		let ours = kp.ours.public_key();
		let mut subs = self.subs.write().await;
		let created = !subs.contains_key(&ours);
		let sub = subs.entry(ours).or_insert_with(|| Subscription {
			private_key: kp.ours.clone(),
			handlers: HashMap::new(),
		});
		sub.handlers.entry(kp.theirs).or_default().push(handler);
		debug!(created, "subscribed");
		created
	}

	/// Returns true if the last handler of the subscription was removed.
	#[instrument(skip(self, kp, handler), fields(ours = %kp.ours.public_key(), theirs = %kp.theirs))]
	pub async fn unsubscribe(&self, kp: &KeyPair, handler: &Arc<dyn MessageHandler>) -> bool {
		let ours = kp.ours.public_key();
		let mut subs = self.subs.write().await;
		let Some(sub) = subs.get_mut(&ours) else {
			return false;
		};

		if let Some(list) = sub.handlers.get_mut(&kp.theirs) {
			list.retain(|h| !same_handler(h, handler));
			if list.is_empty() {
				sub.handlers.remove(&kp.theirs);
			}
		}

		if sub.handler_count() == 0 {
			subs.remove(&ours);
			debug!("removed empty subscription");
			return true;
		}
		false
	}

	/// Opens `env` and hands the message to every matching handler.
	///
	/// Returns the number of handlers invoked.
	pub async fn dispatch(&self, env: &Envelope) -> Result<usize> {
		let subs = self.subs.read().await;
		let Some(sub) = subs.get(&env.recipient) else {
			trace!(recipient = %env.recipient, "no subscription for envelope");
			return Err(SignalingError::NotSubscribed(env.recipient));
		};

		let msg = match env.open(&sub.private_key) {
			Ok(msg) => msg,
			Err(e @ SignalingError::DecryptFailed(_)) => {
				self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
				warn!(sender = %env.sender, recipient = %env.recipient, "failed to decrypt signaling envelope");
				return Err(e);
			}
			Err(e) => {
				warn!(sender = %env.sender, error = %e, "failed to decode signaling message");
				return Err(e);
			}
		};

		let kp = PublicKeyPair::new(env.recipient, env.sender);
		let mut delivered = 0;
		let direct = sub.handlers.get(&env.sender).into_iter().flatten();
		let wildcard = if env.sender == WgPublicKey::ZERO {
			None
		} else {
			sub.handlers.get(&WgPublicKey::ZERO)
		};
		for handler in direct.chain(wildcard.into_iter().flatten()) {
			handler.on_signaling_message(&kp, &msg);
			delivered += 1;
		}

		trace!(sender = %env.sender, kind = msg.kind(), delivered, "dispatched signaling message");
		Ok(delivered)
	}

	pub fn decrypt_failures(&self) -> u64 {
		self.decrypt_failures.load(Ordering::Relaxed)
	}

	pub async fn is_subscribed(&self, ours: &WgPublicKey) -> bool {
		self.subs.read().await.contains_key(ours)
	}

	pub async fn handler_count(&self) -> usize {
		self.subs.read().await.values().map(Subscription::handler_count).sum()
	}

	pub async fn is_empty(&self) -> bool {
		self.subs.read().await.is_empty()
	}
}
