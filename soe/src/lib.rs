//! A reliable, session-oriented datagram transport layered over UDP: framing, session
//! negotiation, ordered/deduplicated/fragmented delivery, and optional RC4 encryption and
//! ZLIB decompression.

pub mod channel;
pub mod cipher;
pub mod config;
pub mod crc;
pub mod framing;
pub mod packet;
pub mod pool;
pub mod seq;
pub mod session;
pub mod socket;
pub mod varint;

pub use config::{AppParams, DisconnectReason, SessionParams, PROTOCOL_VERSION};
pub use session::{Event, Role, Session};
pub use socket::SocketHandler;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::time::Instant;

use runtime::socket::SocketDriver;
use utils::error::Result;

/// Runs a server-side `SocketHandler` against a live socket until interrupted.
///
/// This is the thin glue the reference binary uses: `runtime::drive` owns the receive/tick
/// loop, `SocketHandler` owns per-peer session state, and this function wires the two
/// together so a host only has to supply callbacks and a bound socket. The handler is kept
/// in a `RefCell` purely so the datagram, tick and exit closures `drive` calls in turn can
/// each borrow it in isolation; none of them overlap in time.
pub fn serve<S, F1, F2, F3>(socket: S, handler: SocketHandler<F1, F2, F3>, max_datagram: usize) -> Result
where
	S: SocketDriver,
	F1: FnMut(u32) + Clone,
	F2: FnMut(u32, &[u8]) + Clone,
	F3: FnMut(u32, DisconnectReason) + Clone,
{
	let buf = vec![0u8; max_datagram].into_boxed_slice();
	let handler = RefCell::new(handler);

	runtime::drive(
		&socket,
		buf,
		|from: SocketAddr, bytes: &[u8], now: Instant| {
			handler.borrow_mut().handle_datagram(from, bytes, now, |to, out| {
				let _ = socket.send_to(to, out);
			});
		},
		|now: Instant| {
			handler.borrow_mut().tick(now, |to, out| {
				let _ = socket.send_to(to, out);
			});
		},
		|| {
			log::info!("shutting down, {} session(s) still live", handler.borrow().session_count());
		},
	)
}
