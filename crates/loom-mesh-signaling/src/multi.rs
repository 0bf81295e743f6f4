// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::backend::Backend;
use crate::error::{Result, SignalingError};
use crate::registry::MessageHandler;
use async_trait::async_trait;
use futures::future::join_all;
use loom_mesh_common::{KeyPair, Message};
use std::sync::Arc;
use tracing::warn;

/// Fans out over several backends.
///
/// A publish succeeds if any backend accepts it. Inbound traffic is the union
/// of all backends.
pub struct MultiBackend {
	backends: Vec<Arc<dyn Backend>>,
}

impl MultiBackend {
	pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
		Self { backends }
	}

	pub fn len(&self) -> usize {
		self.backends.len()
	}

	pub fn is_empty(&self) -> bool {
		self.backends.is_empty()
	}
}

#[async_trait]
impl Backend for MultiBackend {
	async fn publish(&self, kp: &KeyPair, msg: &Message) -> Result<()> {
		let results = join_all(
			self.backends
				.iter()
				.map(|b| async move { (b.kind(), b.publish(kp, msg).await) }),
		)
		.await;

		let mut last_err = None;
		let mut any_ok = false;
		for (kind, result) in results {
			match result {
				Ok(()) => any_ok = true,
				Err(e) => {
					warn!(backend = kind, error = %e, "failed to publish signaling message");
					last_err = Some(e);
				}
			}
		}

		if any_ok {
			return Ok(());
		}
		Err(last_err.unwrap_or(SignalingError::Transport("no backends".to_string())))
	}

	async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> Result<bool> {
		let mut created = false;
		for backend in &self.backends {
			created |= backend.subscribe(kp, Arc::clone(&handler)).await?;
		}
		Ok(created)
	}

	async fn unsubscribe(&self, kp: &KeyPair, handler: &Arc<dyn MessageHandler>) -> Result<bool> {
		let mut empty = false;
		for backend in &self.backends {
			empty |= backend.unsubscribe(kp, handler).await?;
		}
		Ok(empty)
	}

	async fn close(&self) -> Result<()> {
		for backend in &self.backends {
			if let Err(e) = backend.close().await {
				warn!(backend = backend.kind(), error = %e, "failed to close backend");
			}
		}
		Ok(())
	}

	fn kind(&self) -> &'static str {
		"multi"
	}
}
