// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Signaling for the loom mesh.
//!
//! Peers exchange ICE credentials and candidates as [`Message`]s sealed in
//! [`Envelope`]s. A [`Backend`] moves envelopes between hosts and hands
//! inbound ones to its [`SubscriptionRegistry`], which decrypts them and
//! calls the registered [`MessageHandler`]s.
//!
//! ```ignore
//! use loom_mesh_signaling::{backend_from_urls, BackendOptions};
//!
//! let backend = backend_from_urls(&["inprocess:".into()], &BackendOptions::default())?;
//! backend.subscribe(&kp, handler).await?;
//! backend.publish(&kp, &msg).await?;
//! ```
//!
//! [`Message`]: loom_mesh_common::Message

pub mod backend;
pub mod envelope;
pub mod error;
pub mod inprocess;
pub mod multi;
pub mod registry;

pub use backend::{
	backend_from_urls, publish_with_timeout, Backend, BackendOptions, CANDIDATE_PUBLISH_TIMEOUT,
	CREDENTIALS_PUBLISH_TIMEOUT,
};
pub use envelope::Envelope;
pub use error::{Result, SignalingError};
pub use inprocess::{InProcessBackend, InProcessHub};
pub use multi::MultiBackend;
pub use registry::{MessageHandler, SubscriptionRegistry};
