// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Endpoint discovery for WireGuard peers.
//!
//! [`EndpointDiscovery`] follows the device watcher. For every peer of every
//! watched interface it runs a [`PeerEngine`] that exchanges ICE credentials
//! and candidates over signaling, establishes a candidate pair and points the
//! peer's WireGuard endpoint at it through a [`proxy::Proxy`].
//!
//! ```ignore
//! let watcher = Arc::new(Watcher::new(client.clone(), WatcherConfig::new(".*")?));
//! let epdisc = Arc::new(EndpointDiscovery::new(client, backend, watcher.events(), config));
//! watcher.on_all(EventQueue::spawn(epdisc.clone()));
//! watcher.sync().await?;
//! ```

pub mod autocfg;
pub mod backoff;
pub mod config;
pub mod error;
pub mod feature;
pub mod interface;
pub mod peer;
pub mod proxy;
pub mod queue;
pub mod status;

#[cfg(test)]
mod testing;

pub use autocfg::AddressConfigurator;
pub use backoff::Backoff;
pub use config::{EndpointDiscoveryConfig, DEFAULT_MUX_PORT_MAX, DEFAULT_MUX_PORT_MIN};
pub use error::{EpdiscError, Result};
pub use feature::EndpointDiscovery;
pub use interface::Interface;
pub use peer::PeerEngine;
pub use queue::{AsyncEventHandler, EventQueue};
pub use status::{InterfaceStatus, NatType, PeerStatus, ProxyType, Reachability};
