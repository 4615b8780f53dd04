use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use log::error;
use utils::error::*;

/// A datagram transport, abstracted so the core protocol never touches a concrete socket type.
///
/// `receive` and `available` are both non-blocking; a host that wants to wait for the next
/// datagram is expected to park on its own I/O readiness primitive (an event loop, `poll`, a
/// background thread) and call `receive` once it believes a datagram is waiting.
pub trait SocketDriver {
	/// Binds to a local endpoint. Implementations should put the socket in non-blocking mode.
	fn bind(local: SocketAddr) -> Result<Self>
	where
		Self: Sized;

	/// Sends `bytes` to `remote`. A short write is treated as an error: UDP datagrams are
	/// sent atomically or not at all.
	fn send_to(&self, remote: SocketAddr, bytes: &[u8]) -> Result<()>;

	/// Attempts to receive one datagram into `buf`, returning the sender and the number of
	/// bytes written. Returns `Ok(None)` if no datagram is currently available.
	fn receive(&self, buf: &mut [u8]) -> Result<Option<(SocketAddr, usize)>>;

	/// Whether a datagram may currently be waiting. A driver that cannot cheaply answer this
	/// may always return `true`; `receive` remains the authority.
	fn available(&self) -> bool;
}

/// The reference `SocketDriver`, backed by a non-blocking `std::net::UdpSocket`.
pub struct UdpSocketDriver {
	socket: UdpSocket,
}

impl SocketDriver for UdpSocketDriver {
	fn bind(local: SocketAddr) -> Result<Self> {
		let socket = UdpSocket::bind(local).map_err(|err| error!("failed to bind UDP socket on {local}: {err}"))?;

		socket
			.set_nonblocking(true)
			.map_err(|err| error!("failed to set UDP socket non-blocking: {err}"))?;

		Ok(Self { socket })
	}

	fn send_to(&self, remote: SocketAddr, bytes: &[u8]) -> Result<()> {
		let n = self.socket.send_to(bytes, remote).map_err(|err| error!("failed to send to {remote}: {err}"))?;

		if n != bytes.len() {
			error!("short write to {remote}: sent {n}/{} bytes", bytes.len());
			return Err(());
		}

		Ok(())
	}

	fn receive(&self, buf: &mut [u8]) -> Result<Option<(SocketAddr, usize)>> {
		match self.socket.recv_from(buf) {
			Ok((n, addr)) => Ok(Some((addr, n))),
			Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
			Err(err) => {
				error!("failed to receive from UDP socket: {err}");
				Err(())
			}
		}
	}

	fn available(&self) -> bool {
		true
	}
}
