use std::time::{Instant, SystemTime};

/// Converts a monotonic `Instant` into the UNIX time in seconds, relative to a fixed
/// `(Instant, SystemTime)` anchor pair captured at startup.
///
/// The anchor lets the rest of the crate work entirely in `Instant`s (which are cheap to
/// compare and can't go backwards) while still producing wire-format timestamps where the
/// protocol calls for one.
#[derive(Clone, Copy)]
pub struct Clock {
	epoch_instant: Instant,
	epoch_system: SystemTime,
}

impl Clock {
	pub fn new() -> Self {
		Self { epoch_instant: Instant::now(), epoch_system: SystemTime::now() }
	}

	/// The system time corresponding to a given monotonic instant.
	pub fn system(&self, now: Instant) -> SystemTime {
		self.epoch_system + now.saturating_duration_since(self.epoch_instant)
	}

	/// The UNIX time in seconds corresponding to a given monotonic instant.
	pub fn unix(&self, now: Instant) -> u32 {
		self.system(now)
			.duration_since(SystemTime::UNIX_EPOCH)
			.expect("the current time should be after the UNIX epoch")
			.as_secs()
			.try_into()
			.expect("32-bit UNIX time should not overflow")
	}
}

impl Default for Clock {
	fn default() -> Self {
		Self::new()
	}
}
