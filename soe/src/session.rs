//! The per-connection state machine: negotiation, heartbeat and inactivity timing, contextual
//! send/receive, and idempotent termination.

use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, info, trace, warn};
use utils::bytes;
use utils::endian::{u16be, u32be};

use crate::channel::input::{Ack, Input};
use crate::channel::output::Output;
use crate::cipher::Rc4;
use crate::config::{AppParams, DisconnectReason, SessionParams, PROTOCOL_VERSION};
use crate::framing::{self, Invalid};
use crate::packet::{Disconnect, OpCode, RemapConnection, SessionRequest, SessionResponse};
use crate::pool::Pool;
use crate::varint;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
	Client,
	Server,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
	/// Session-request/session-response has not yet completed.
	Negotiating,
	/// Server only: the response has been sent, waiting for the first packet that proves the
	/// client received it.
	WaitingToOpen,
	Running,
	Terminated,
}

/// What a caller driving a session should do as a result of handling one datagram or tick.
pub enum Event {
	None,
	/// The peer address this session is keyed under should be updated (RemapConnection).
	Remap(SocketAddr),
}

pub struct Session<F1, F2, F3> {
	role: Role,
	state: State,
	pub session_id: u32,
	pub remote: SocketAddr,

	params: SessionParams,
	output: Output,
	input: Input,

	last_received: Instant,
	last_sent: Instant,

	disconnect_reason: Option<DisconnectReason>,
	pending_terminate: Option<DisconnectReason>,
	callbacks: AppParams<F1, F2, F3>,
}

impl<F1, F2, F3> Session<F1, F2, F3>
where
	F1: FnMut(u32),
	F2: FnMut(u32, &[u8]),
	F3: FnMut(u32, DisconnectReason),
{
	/// Begins a client-side session: produces the session-request datagram via `send`.
	pub fn connect(session_id: u32, remote: SocketAddr, params: SessionParams, callbacks: AppParams<F1, F2, F3>, now: Instant, mut send: impl FnMut(&[u8])) -> Self {
		let pool = Pool::new(params.local_udp_length.max(params.remote_udp_length) as usize, 2 * params.window_out.max(params.window_in));

		let mut session = Self {
			role: Role::Client,
			state: State::Negotiating,
			session_id,
			remote,
			output: Output::new(pool.clone(), params.window_out, None),
			input: Input::new(pool, params.window_in, None),
			params,
			last_received: now,
			last_sent: now,
			disconnect_reason: None,
			pending_terminate: None,
			callbacks,
		};

		session.send_session_request(now, &mut send);
		session
	}

	/// Begins a server-side session in response to a received session-request.
	pub fn accept(session_id: u32, remote: SocketAddr, crc_seed: u32, mut params: SessionParams, callbacks: AppParams<F1, F2, F3>, now: Instant, mut send: impl FnMut(&[u8])) -> Self {
		params.crc_seed = crc_seed;

		let pool = Pool::new(params.local_udp_length.max(params.remote_udp_length) as usize, 2 * params.window_out.max(params.window_in));
		let cipher = callbacks.encryption_enabled.then(|| Rc4::new(&callbacks.cipher_key));

		let mut session = Self {
			role: Role::Server,
			state: State::WaitingToOpen,
			session_id,
			remote,
			output: Output::new(pool.clone(), params.window_out, cipher.clone()),
			input: Input::new(pool, params.window_in, cipher),
			params,
			last_received: now,
			last_sent: now,
			disconnect_reason: None,
			pending_terminate: None,
			callbacks,
		};

		session.init_max_data_length();
		session.send_session_response(now, &mut send);
		session
	}

	fn init_max_data_length(&mut self) {
		let header = framing::header_len(self.params.compression_enabled);
		let trailer = framing::trailer_len(self.params.crc_length);
		self.output.set_max_data_length(self.params.remote_udp_length, header, trailer);
	}

	fn send_session_request(&mut self, now: Instant, send: &mut impl FnMut(&[u8])) {
		let tag = self.params.application_protocol.as_bytes();
		let mut buf = vec![0u8; 2 + core::mem::size_of::<SessionRequest>() + tag.len() + 1];

		buf[0..2].copy_from_slice(&(OpCode::SessionRequest as u16).to_be_bytes());
		*bytes::cast_mut::<SessionRequest>(&mut buf[2..2 + core::mem::size_of::<SessionRequest>()]) = SessionRequest {
			protocol_version: u32be::from(PROTOCOL_VERSION),
			session_id: u32be::from(self.session_id),
			udp_length: u32be::from(self.params.local_udp_length),
		};

		let tag_start = 2 + core::mem::size_of::<SessionRequest>();
		buf[tag_start..tag_start + tag.len()].copy_from_slice(tag);

		self.last_sent = now;
		send(&buf);
	}

	fn send_session_response(&mut self, now: Instant, send: &mut impl FnMut(&[u8])) {
		let mut buf = vec![0u8; 2 + core::mem::size_of::<SessionResponse>()];

		buf[0..2].copy_from_slice(&(OpCode::SessionResponse as u16).to_be_bytes());
		*bytes::cast_mut::<SessionResponse>(&mut buf[2..]) = SessionResponse {
			session_id: u32be::from(self.session_id),
			crc_seed: u32be::from(self.params.crc_seed),
			crc_length: self.params.crc_length,
			is_compression_enabled: self.params.compression_enabled as u8,
			unknown: 0,
			udp_length: u32be::from(self.params.local_udp_length),
			protocol_version: u32be::from(PROTOCOL_VERSION),
		};

		self.last_sent = now;
		send(&buf);
	}

	pub fn is_terminated(&self) -> bool {
		self.state == State::Terminated
	}

	/// Re-keys this session to a newly observed peer address, as instructed by a
	/// RemapConnection packet received before the address map knew about this session.
	pub fn remap(&mut self, new_addr: SocketAddr, crc_seed: u32) {
		self.remote = new_addr;
		self.params.crc_seed = crc_seed;
	}

	/// Queues application data for reliable delivery. If the output channel's overflow queue
	/// is already full, the session is torn down on the next `tick` instead of here, since
	/// only the tick loop has anywhere to actually send the resulting disconnect packet.
	///
	/// Data queued before negotiation completes (state isn't yet `Running`) is dropped rather
	/// than buffered: `max_data_len` isn't known until the session-response is processed, so
	/// fragmenting it here could still run against a zero-sized data length.
	pub fn enqueue(&mut self, data: &[u8], now: Instant) {
		if self.state != State::Running || self.pending_terminate.is_some() {
			return;
		}

		if let Err(reason) = self.output.enqueue(data, now) {
			self.pending_terminate = Some(reason);
		}
	}

	/// Handles one datagram addressed to this session. `from` is the datagram's source
	/// address, which may differ from `self.remote` when a NAT rebinding triggers a
	/// RemapConnection.
	pub fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant, mut send: impl FnMut(&[u8])) -> Event {
		if self.state == State::Terminated {
			return Event::None;
		}

		let validated = match framing::validate(bytes, self.params.crc_seed, self.params.crc_length, self.params.compression_enabled) {
			Ok(v) => v,
			Err(Invalid::CrcMismatch) => {
				self.terminate(DisconnectReason::CorruptPacket, now, &mut send);
				return Event::None;
			}
			Err(_) => {
				warn!("dropping malformed datagram on session {}", self.session_id);
				return Event::None;
			}
		};

		self.last_received = now;

		if self.state == State::WaitingToOpen && validated.op != OpCode::SessionRequest {
			self.state = State::Running;
			(self.callbacks.on_session_opened)(self.session_id);
		}

		self.handle_body(validated.op, validated.body, validated.compressed, from, now, &mut send)
	}

	fn handle_body(&mut self, op: OpCode, body: &[u8], compressed: bool, from: SocketAddr, now: Instant, send: &mut impl FnMut(&[u8])) -> Event {
		match op {
			OpCode::SessionRequest if self.role == Role::Server && self.state == State::WaitingToOpen => {
				self.send_session_response(now, send);
				Event::None
			}

			OpCode::SessionRequest if self.role == Role::Server => {
				self.terminate(DisconnectReason::ConnectError, now, send);
				Event::None
			}

			OpCode::SessionResponse if self.role == Role::Client && self.state == State::Negotiating => {
				if body.len() < core::mem::size_of::<SessionResponse>() {
					warn!("session-response too short, ignoring");
					return Event::None;
				}

				let resp = bytes::cast::<SessionResponse>(&body[..core::mem::size_of::<SessionResponse>()]);
				self.params.crc_seed = resp.crc_seed.get();
				self.params.crc_length = resp.crc_length;
				self.params.compression_enabled = resp.is_compression_enabled != 0;
				self.params.remote_udp_length = resp.udp_length.get();

				if self.callbacks.encryption_enabled {
					let cipher = Rc4::new(&self.callbacks.cipher_key);
					self.output = Output::new(self.output.pool_handle(), self.params.window_out, Some(cipher.clone()));
					self.input = Input::new(self.input.pool_handle(), self.params.window_in, Some(cipher));
				}

				self.init_max_data_length();
				self.state = State::Running;
				(self.callbacks.on_session_opened)(self.session_id);
				Event::None
			}

			OpCode::Heartbeat => Event::None,

			OpCode::MultiPacket => {
				let mut rest = body;
				while !rest.is_empty() {
					let Some((len, consumed)) = varint::decode(rest) else { break };
					let len = len as usize;
					if rest.len() < consumed + 2 + len {
						break;
					}

					let sub_op = match OpCode::from_u16(u16::from_be_bytes([rest[consumed], rest[consumed + 1]])) {
						Some(op) => op,
						None => break,
					};

					self.handle_body(sub_op, &rest[consumed + 2..consumed + 2 + len], false, from, now, send);
					rest = &rest[consumed + 2 + len..];
				}

				Event::None
			}

			OpCode::ReliableData | OpCode::ReliableDataFragment => {
				let owned;
				let body = if compressed {
					match framing::decompress(self.params.remote_udp_length, body) {
						Ok(v) => {
							owned = v;
							&owned[..]
						}
						Err(()) => {
							self.terminate(DisconnectReason::CorruptPacket, now, send);
							return Event::None;
						}
					}
				} else {
					body
				};

				let is_fragment = op == OpCode::ReliableDataFragment;
				let acknowledge_all = self.params.acknowledge_all;
				let session_id = self.session_id;

				let header_len = framing::header_len(self.params.compression_enabled);
				let trailer_len = framing::trailer_len(self.params.crc_length);
				let crc_seed = self.params.crc_seed;
				let crc_length = self.params.crc_length;
				let compression_enabled = self.params.compression_enabled;

				let mut send_ack = |ack_op: OpCode, seq: u16| {
					trace!("session {session_id} sending {ack_op:?} for sequence {seq}");
					let mut buf = vec![0u8; header_len + 2 + trailer_len];
					buf[header_len..header_len + 2].copy_from_slice(&seq.to_be_bytes());
					framing::stamp_contextual(&mut buf, ack_op, compression_enabled, crc_seed, crc_length);
					send(&buf);
				};

				let on_data = &mut self.callbacks.on_data;

				self.input.receive(
					body,
					is_fragment,
					acknowledge_all,
					now,
					|ack| match ack {
						Ack::Single(seq) => send_ack(OpCode::Acknowledge, seq),
						Ack::All(seq) => send_ack(OpCode::AcknowledgeAll, seq),
					},
					|payload| on_data(session_id, payload),
				);

				self.last_sent = now;

				Event::None
			}

			OpCode::Acknowledge => {
				if body.len() >= 2 {
					self.output.ack(u16::from_be_bytes([body[0], body[1]]));
				}
				Event::None
			}

			OpCode::AcknowledgeAll => {
				if body.len() >= 2 {
					self.output.ack_all(u16::from_be_bytes([body[0], body[1]]));
				}
				Event::None
			}

			OpCode::Disconnect => {
				let reason = if body.len() >= 6 {
					DisconnectReason::from_wire(bytes::cast::<u16be>(&body[4..6]).get()).unwrap_or(DisconnectReason::OtherSideTerminated)
				} else {
					DisconnectReason::OtherSideTerminated
				};

				debug!("session {} disconnected by peer: {reason:?}", self.session_id);
				self.disconnect_reason = Some(reason);
				self.state = State::Terminated;
				(self.callbacks.on_session_closed)(self.session_id, reason);
				Event::None
			}

			OpCode::NetStatusRequest => {
				// Echoed verbatim: the request body already carries the client's own timing
				// fields, which it compares against on receipt of the response.
				self.send_contextual(OpCode::NetStatusResponse, body, now, send);
				Event::None
			}

			OpCode::RemapConnection => {
				if body.len() >= core::mem::size_of::<RemapConnection>() {
					let remap = bytes::cast::<RemapConnection>(&body[..core::mem::size_of::<RemapConnection>()]);
					self.params.crc_seed = remap.crc_seed.get();
				}
				{
					self.remote = from;
					Event::Remap(from)
				}
			}

			_ => Event::None,
		}
	}

	fn send_contextual(&mut self, op: OpCode, payload: &[u8], now: Instant, send: &mut impl FnMut(&[u8])) {
		let header_len = framing::header_len(self.params.compression_enabled);
		let trailer_len = framing::trailer_len(self.params.crc_length);

		let mut buf = vec![0u8; header_len + payload.len() + trailer_len];
		buf[header_len..header_len + payload.len()].copy_from_slice(payload);

		framing::stamp_contextual(&mut buf, op, self.params.compression_enabled, self.params.crc_seed, self.params.crc_length);

		self.last_sent = now;
		send(&buf);
	}

	/// Runs one tick: flushes/retransmits the output channel, schedules acknowledge-all,
	/// sends a heartbeat if idle, and terminates on inactivity.
	pub fn tick(&mut self, now: Instant, mut send: impl FnMut(&[u8])) {
		if self.state == State::Terminated {
			return;
		}

		if let Some(reason) = self.pending_terminate.take() {
			self.terminate(reason, now, &mut send);
			return;
		}

		if now.saturating_duration_since(self.last_received) >= self.params.inactivity_timeout {
			self.terminate(DisconnectReason::Timeout, now, &mut send);
			return;
		}

		if self.state != State::Running {
			return;
		}

		let header_len = framing::header_len(self.params.compression_enabled);
		let trailer_len = framing::trailer_len(self.params.crc_length);
		let crc_seed = self.params.crc_seed;
		let crc_length = self.params.crc_length;
		let compression_enabled = self.params.compression_enabled;

		let mut sent_anything = false;

		let result = self.output.tick(now, self.params.max_coalesce_hold, |is_fragment, body| {
			sent_anything = true;
			let op = if is_fragment { OpCode::ReliableDataFragment } else { OpCode::ReliableData };

			let mut buf = vec![0u8; header_len + body.len() + trailer_len];
			buf[header_len..header_len + body.len()].copy_from_slice(body);
			framing::stamp_contextual(&mut buf, op, compression_enabled, crc_seed, crc_length);

			send(&buf);
		});

		if let Err(reason) = result {
			self.terminate(reason, now, &mut send);
			return;
		}

		self.input.tick(now, self.params.acknowledge_all, self.params.data_ack_window, |seq| {
			let mut buf = vec![0u8; header_len + 2 + trailer_len];
			buf[header_len..header_len + 2].copy_from_slice(&seq.to_be_bytes());
			framing::stamp_contextual(&mut buf, OpCode::AcknowledgeAll, compression_enabled, crc_seed, crc_length);
			send(&buf);
			sent_anything = true;
		});

		let should_probe = self.role == Role::Client && now.saturating_duration_since(self.last_received) >= self.params.heartbeat_after;

		if !sent_anything && should_probe {
			self.send_contextual(OpCode::Heartbeat, &[], now, &mut send);
		} else if sent_anything {
			self.last_sent = now;
		}
	}

	/// Idempotent: terminating an already-terminated session is a no-op.
	pub fn terminate(&mut self, reason: DisconnectReason, now: Instant, mut send: impl FnMut(&[u8])) {
		if self.state == State::Terminated {
			return;
		}

		info!("terminating session {} with reason {reason:?}", self.session_id);

		if reason != DisconnectReason::OtherSideTerminated {
			let mut body = vec![0u8; 6];
			*bytes::cast_mut::<Disconnect>(&mut body) = Disconnect { session_id: u32be::from(self.session_id), reason: u16be::from(reason as u16) };
			self.send_contextual(OpCode::Disconnect, &body, now, &mut send);
		}

		self.disconnect_reason = Some(reason);
		self.state = State::Terminated;
		(self.callbacks.on_session_closed)(self.session_id, reason);
	}
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
	use std::rc::Rc;
	use std::time::{Duration, Instant};

	use super::{Event, Session};
	use crate::config::{AppParams, DisconnectReason, SessionParams};
	use crate::packet::OpCode;

	fn addr(port: u16) -> SocketAddr {
		SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
	}

	fn params() -> SessionParams {
		let mut p = SessionParams::default();
		p.crc_length = 0;
		p.window_in = 8;
		p.window_out = 8;
		p.heartbeat_after = Duration::from_millis(10);
		p.inactivity_timeout = Duration::from_millis(50);
		p
	}

	struct Callbacks {
		opened: Rc<RefCell<Vec<u32>>>,
		data: Rc<RefCell<Vec<(u32, Vec<u8>)>>>,
		closed: Rc<RefCell<Vec<(u32, DisconnectReason)>>>,
	}

	impl Callbacks {
		fn new() -> Self {
			Self { opened: Rc::default(), data: Rc::default(), closed: Rc::default() }
		}

		fn app_params(&self) -> AppParams<impl FnMut(u32), impl FnMut(u32, &[u8]), impl FnMut(u32, DisconnectReason)> {
			let opened = self.opened.clone();
			let data = self.data.clone();
			let closed = self.closed.clone();

			AppParams {
				encryption_enabled: false,
				cipher_key: [0u8; 256],
				on_session_opened: move |id| opened.borrow_mut().push(id),
				on_data: move |id, bytes: &[u8]| data.borrow_mut().push((id, bytes.to_vec())),
				on_session_closed: move |id, reason| closed.borrow_mut().push((id, reason)),
			}
		}
	}

	fn op_of(buf: &[u8]) -> OpCode {
		OpCode::from_u16(u16::from_be_bytes([buf[0], buf[1]])).unwrap()
	}

	#[test]
	fn client_and_server_handshake_both_reach_running() {
		let now = Instant::now();
		let client_cb = Callbacks::new();
		let server_cb = Callbacks::new();

		let mut client_sent = Vec::new();
		let mut client = Session::connect(1, addr(9100), params(), client_cb.app_params(), now, |buf| client_sent.push(buf.to_vec()));
		assert_eq!(client_sent.len(), 1);
		assert_eq!(op_of(&client_sent[0]), OpCode::SessionRequest);

		let mut server_sent = Vec::new();
		let mut server = Session::accept(1, addr(9100), 0xAAAA_BBBB, params(), server_cb.app_params(), now, |buf| server_sent.push(buf.to_vec()));
		assert_eq!(server_sent.len(), 1);
		assert_eq!(op_of(&server_sent[0]), OpCode::SessionResponse);

		let event = client.handle_datagram(&server_sent[0], addr(9100), now, |buf| client_sent.push(buf.to_vec()));
		assert!(matches!(event, Event::None));
		assert_eq!(*client_cb.opened.borrow(), vec![1]);

		let heartbeat = [(OpCode::Heartbeat as u16).to_be_bytes()[0], (OpCode::Heartbeat as u16).to_be_bytes()[1]];
		server.handle_datagram(&heartbeat, addr(9100), now, |buf| server_sent.push(buf.to_vec()));
		assert_eq!(*server_cb.opened.borrow(), vec![1]);

		server.handle_datagram(&heartbeat, addr(9100), now, |_| panic!("should not send once already running"));
		assert_eq!(server_cb.opened.borrow().len(), 1);
	}

	/// Drives a client session through to `Running` by feeding it a server's session-response.
	fn running_client(session_id: u32, remote: SocketAddr, p: SessionParams, cb: &Callbacks, now: Instant) -> Session<impl FnMut(u32), impl FnMut(u32, &[u8]), impl FnMut(u32, DisconnectReason)> {
		let mut discard = Vec::new();
		let mut client = Session::connect(session_id, remote, p.clone(), cb.app_params(), now, |buf| discard.push(buf.to_vec()));

		let mut server_sent = Vec::new();
		Session::accept(session_id, remote, 0, p, Callbacks::new().app_params(), now, |buf| server_sent.push(buf.to_vec()));

		client.handle_datagram(&server_sent[0], remote, now, |buf| discard.push(buf.to_vec()));
		assert!(!client.is_terminated());
		client
	}

	#[test]
	fn idle_session_sends_a_heartbeat_after_heartbeat_after_elapses() {
		let now = Instant::now();
		let cb = Callbacks::new();

		let mut client = running_client(1, addr(9101), params(), &cb, now);
		assert_eq!(*cb.opened.borrow(), vec![1]);

		let mut sent = Vec::new();
		let later = now + Duration::from_millis(20);
		client.tick(later, |buf| sent.push(buf.to_vec()));

		assert_eq!(sent.len(), 1);
		assert_eq!(op_of(&sent[0]), OpCode::Heartbeat);
	}

	#[test]
	fn inactivity_timeout_terminates_and_notifies() {
		let now = Instant::now();
		let cb = Callbacks::new();

		let mut client = running_client(1, addr(9102), params(), &cb, now);

		let mut sent = Vec::new();
		let later = now + Duration::from_millis(100);
		client.tick(later, |buf| sent.push(buf.to_vec()));

		assert!(client.is_terminated());
		assert_eq!(cb.closed.borrow().as_slice(), &[(1, DisconnectReason::Timeout)]);
		assert_eq!(sent.len(), 1);
		assert_eq!(op_of(&sent[0]), OpCode::Disconnect);
	}

	#[test]
	fn net_status_request_is_echoed_back() {
		let now = Instant::now();
		let cb = Callbacks::new();

		let mut server_sent = Vec::new();
		let mut server = Session::accept(1, addr(9103), 0, params(), cb.app_params(), now, |buf| server_sent.push(buf.to_vec()));
		server_sent.clear();

		let mut req = (OpCode::NetStatusRequest as u16).to_be_bytes().to_vec();
		req.extend_from_slice(&[1, 2, 3, 4]);

		server.handle_datagram(&req, addr(9103), now, |buf| server_sent.push(buf.to_vec()));

		assert_eq!(server_sent.len(), 1);
		assert_eq!(op_of(&server_sent[0]), OpCode::NetStatusResponse);
		assert_eq!(&server_sent[0][2..], &[1, 2, 3, 4]);
	}

	#[test]
	fn enqueue_overflow_defers_termination_to_the_next_tick() {
		let now = Instant::now();
		let cb = Callbacks::new();

		let mut params = params();
		params.window_out = 2;

		let mut server = Session::accept(1, addr(9104), 0, params, cb.app_params(), now, |_| {});

		let heartbeat = (OpCode::Heartbeat as u16).to_be_bytes();
		server.handle_datagram(&heartbeat, addr(9104), now, |_| {});
		assert!(!server.is_terminated());

		let payload = vec![7u8; 4000];
		for _ in 0..4 {
			server.enqueue(&payload, now);
		}

		assert!(!server.is_terminated());

		let mut sent = Vec::new();
		server.tick(now, |buf| sent.push(buf.to_vec()));

		assert!(server.is_terminated());
		assert_eq!(cb.closed.borrow().as_slice(), &[(1, DisconnectReason::ReliableOverflow)]);
		assert!(sent.iter().any(|buf| op_of(buf) == OpCode::Disconnect));
	}
}
