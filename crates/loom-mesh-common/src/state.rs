// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Connection state of a peer engine.
///
/// The first seven values mirror the ICE connection states. The engine adds
/// four of its own from 100 upwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
	New = 1,
	Checking = 2,
	Connected = 3,
	Completed = 4,
	Failed = 5,
	Disconnected = 6,
	Closed = 7,
	Creating = 100,
	Idle = 101,
	Connecting = 102,
	Closing = 103,
}

impl ConnectionState {
	pub fn as_u8(self) -> u8 {
		self as u8
	}

	pub fn from_u8(value: u8) -> Option<Self> {
		let state = match value {
			1 => ConnectionState::New,
			2 => ConnectionState::Checking,
			3 => ConnectionState::Connected,
			4 => ConnectionState::Completed,
			5 => ConnectionState::Failed,
			6 => ConnectionState::Disconnected,
			7 => ConnectionState::Closed,
			100 => ConnectionState::Creating,
			101 => ConnectionState::Idle,
			102 => ConnectionState::Connecting,
			103 => ConnectionState::Closing,
			_ => return None,
		};
		Some(state)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ConnectionState::New => "new",
			ConnectionState::Checking => "checking",
			ConnectionState::Connected => "connected",
			ConnectionState::Completed => "completed",
			ConnectionState::Failed => "failed",
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Closed => "closed",
			ConnectionState::Creating => "creating",
			ConnectionState::Idle => "idle",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Closing => "closing",
		}
	}

	/// Connected or Completed.
	pub fn is_established(&self) -> bool {
		matches!(self, ConnectionState::Connected | ConnectionState::Completed)
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Lock-free cell holding a [`ConnectionState`].
#[derive(Debug)]
pub struct AtomicConnectionState {
	inner: AtomicU8,
}

impl AtomicConnectionState {
	pub fn new(state: ConnectionState) -> Self {
		Self {
			inner: AtomicU8::new(state.as_u8()),
		}
	}

	pub fn load(&self) -> ConnectionState {
		// Only valid discriminants are ever stored.
		ConnectionState::from_u8(self.inner.load(Ordering::Acquire)).unwrap_or(ConnectionState::Closed)
	}

	/// Stores `state` and returns the previous one.
	pub fn swap(&self, state: ConnectionState) -> ConnectionState {
		let prev = self.inner.swap(state.as_u8(), Ordering::AcqRel);
		ConnectionState::from_u8(prev).unwrap_or(ConnectionState::Closed)
	}

	/// Moves to `new` only if the current state is `expected`.
	pub fn set_if(&self, expected: ConnectionState, new: ConnectionState) -> bool {
		self.inner
			.compare_exchange(
				expected.as_u8(),
				new.as_u8(),
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.is_ok()
	}

	/// Moves to `new` unless the current state is one of `excluded`.
	///
	/// Returns the previous state on success.
	pub fn set_if_not(
		&self,
		new: ConnectionState,
		excluded: &[ConnectionState],
	) -> Option<ConnectionState> {
		let mut current = self.inner.load(Ordering::Acquire);
		loop {
			let state = ConnectionState::from_u8(current).unwrap_or(ConnectionState::Closed);
			if excluded.contains(&state) {
				return None;
			}
			match self.inner.compare_exchange_weak(
				current,
				new.as_u8(),
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => return Some(state),
				Err(actual) => current = actual,
			}
		}
	}
}

impl Default for AtomicConnectionState {
	fn default() -> Self {
		Self::new(ConnectionState::Closed)
	}
}
