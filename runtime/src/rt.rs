use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use utils::error::Result;

use crate::socket::SocketDriver;

static EXIT: AtomicBool = AtomicBool::new(false);

/// The longest the driver will sleep between polls when nothing is being sent or received.
/// Bounded so per-session ticks (heartbeats, retransmission, inactivity timeouts) still run
/// at a reasonable cadence even on an otherwise idle socket.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Drives a single-threaded cooperative loop: one receive, one dispatch, one sweep of ticks,
/// repeat. `on_datagram` is called with the sender and payload of each received datagram;
/// `on_tick` is called once per iteration, whether or not a datagram was received, so that
/// callers can run periodic per-session work (spec: "A single-threaded cooperative loop
/// drives the socket handler").
///
/// Returns once a Ctrl+C signal is observed and `exit_fn` has been given a chance to run any
/// best-effort cleanup (e.g. flushing sessions and notifying remote peers before shutdown).
pub fn drive<S: SocketDriver>(socket: &S, mut buf: Box<[u8]>, mut on_datagram: impl FnMut(SocketAddr, &[u8], Instant), mut on_tick: impl FnMut(Instant), exit_fn: impl FnOnce()) -> Result {
	ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed)).map_err(|err| log::error!("error occurred while setting Ctrl+C handler: {err}"))?;

	loop {
		if EXIT.load(Ordering::Relaxed) {
			exit_fn();
			return Ok(());
		}

		let now = Instant::now();
		let mut received = false;

		while let Some((from, n)) = socket.receive(&mut buf)? {
			received = true;
			on_datagram(from, &buf[..n], now);
		}

		on_tick(now);

		if !received {
			thread::sleep(IDLE_SLEEP);
		}
	}
}
