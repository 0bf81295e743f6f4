// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turns WireGuard device state into a stream of change events.
//!
//! ```ignore
//! let watcher = Arc::new(Watcher::new(client, WatcherConfig::new("^wg")?));
//! watcher.on_all(handler);
//! let handle = Arc::clone(&watcher).spawn();
//! ```

pub mod error;
pub mod events;
pub mod monitor;
pub mod watcher;

pub use error::{Result, WatcherError};
pub use events::{Event, EventHandler, Handlers};
pub use watcher::{Watcher, WatcherConfig, DEFAULT_INTERVAL};
