// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Randomization applied to each delay, as a fraction of it.
const JITTER_FACTOR: f64 = 0.1;

/// Exponential backoff with jitter, for retrying credential exchange and
/// agent creation.
#[derive(Debug, Clone)]
pub struct Backoff {
	initial: Duration,
	max: Duration,
	multiplier: f64,
	current: Duration,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration) -> Self {
		Self {
			initial,
			max,
			multiplier: DEFAULT_MULTIPLIER,
			current: initial,
		}
	}

	pub fn with_multiplier(mut self, multiplier: f64) -> Self {
		self.multiplier = multiplier.max(1.0);
		self
	}

	/// The next delay. Grows the interval for the call after.
	pub fn next_delay(&mut self) -> Duration {
		let base = self.current;
		let jitter_ms = (base.as_millis() as f64 * JITTER_FACTOR) as u64;
		let delay = base + Duration::from_millis(fastrand::u64(0..=jitter_ms));

		self.current = base.mul_f64(self.multiplier).min(self.max);
		delay.min(self.max)
	}

	pub fn reset(&mut self) {
		self.current = self.initial;
	}
}

impl Default for Backoff {
	fn default() -> Self {
		Self::new(DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_INTERVAL)
	}
}
