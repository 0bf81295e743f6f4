// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{Result, SignalingError};
use crate::inprocess::{InProcessBackend, InProcessHub};
use crate::multi::MultiBackend;
use crate::registry::MessageHandler;
use async_trait::async_trait;
use loom_mesh_common::{KeyPair, Message};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Deadline for publishing ICE credentials.
pub const CREDENTIALS_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for publishing a local candidate.
pub const CANDIDATE_PUBLISH_TIMEOUT: Duration = Duration::from_secs(15);

/// A signaling transport.
///
/// Delivery is best-effort. Messages may be duplicated or reordered.
#[async_trait]
pub trait Backend: Send + Sync {
	/// Seals `msg` for `kp.theirs` and hands it to the transport.
	async fn publish(&self, kp: &KeyPair, msg: &Message) -> Result<()>;

	/// Returns true if a new subscription for `kp.ours` was created.
	async fn subscribe(&self, kp: &KeyPair, handler: Arc<dyn MessageHandler>) -> Result<bool>;

	/// Returns true if the subscription for `kp.ours` is now empty.
	async fn unsubscribe(&self, kp: &KeyPair, handler: &Arc<dyn MessageHandler>) -> Result<bool>;

	async fn close(&self) -> Result<()>;

	fn kind(&self) -> &'static str;
}

/// Publishes with a deadline.
#[instrument(skip(backend, kp, msg), fields(backend = backend.kind(), theirs = %kp.theirs, kind = msg.kind()))]
pub async fn publish_with_timeout(
	backend: &dyn Backend,
	kp: &KeyPair,
	msg: &Message,
	deadline: Duration,
) -> Result<()> {
	match tokio::time::timeout(deadline, backend.publish(kp, msg)).await {
		Ok(result) => result,
		Err(_) => Err(SignalingError::Timeout),
	}
}

/// Shared state handed to backends built from URLs.
#[derive(Clone, Default)]
pub struct BackendOptions {
	pub hub: InProcessHub,
}

/// Builds a backend from one or more URLs.
///
/// Supported schemes: `inprocess:`. Several URLs produce a [`MultiBackend`].
pub fn backend_from_urls(urls: &[String], options: &BackendOptions) -> Result<Arc<dyn Backend>> {
	let mut backends: Vec<Arc<dyn Backend>> = Vec::with_capacity(urls.len());
	for url in urls {
		backends.push(backend_from_url(url, options)?);
	}

	match backends.len() {
		0 => Err(SignalingError::NoBackend),
		1 => Ok(backends.remove(0)),
		_ => Ok(Arc::new(MultiBackend::new(backends))),
	}
}

fn backend_from_url(url: &str, options: &BackendOptions) -> Result<Arc<dyn Backend>> {
	let scheme = url.split_once(':').map(|(s, _)| s).unwrap_or(url);
	match scheme {
		"inprocess" => Ok(Arc::new(InProcessBackend::new(options.hub.clone()))),
		_ => Err(SignalingError::UnknownBackend(url.to_string())),
	}
}
