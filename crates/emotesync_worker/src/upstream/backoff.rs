#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

/// Reconnect delay never exceeds this.
pub const BACKOFF_CEILING_MS: u64 = 120_000;
/// Each failure adds a jittered step within this range.
pub const BACKOFF_STEP_MIN_MS: u64 = 1_000;
pub const BACKOFF_STEP_MAX_MS: u64 = 5_000;

/// Additive jittered reconnect backoff.
///
/// Grows by a random step per failure, bounded by [`BACKOFF_CEILING_MS`];
/// reset to the floor on a successful HELLO.
#[derive(Debug, Default)]
pub struct Backoff {
	current_ms: u64,
}

impl Backoff {
	pub fn new() -> Self {
		Self::default()
	}

	/// Delay to wait before the next connect attempt.
	pub fn next_delay(&mut self) -> Duration {
		let step = rand::rng().random_range(BACKOFF_STEP_MIN_MS..=BACKOFF_STEP_MAX_MS);
		self.current_ms = (self.current_ms + step).min(BACKOFF_CEILING_MS);
		Duration::from_millis(self.current_ms)
	}

	pub fn reset(&mut self) {
		self.current_ms = 0;
	}

	pub fn current_ms(&self) -> u64 {
		self.current_ms
	}
}
