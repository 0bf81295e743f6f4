// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The `loom-mesh` host process.
//!
//! Loads the layered configuration, then runs the device watcher with
//! endpoint discovery, link-local address assignment and key assignment
//! attached until shutdown.

pub mod config;
pub mod daemon;
pub mod error;
pub mod keys;
pub mod logging;

pub use config::{load_config, MeshConfig, MeshConfigLayer};
pub use daemon::{Components, MeshDaemon};
pub use error::{ConfigError, DaemonError, Result};
pub use keys::KeyAssigner;
pub use logging::init_tracing;
