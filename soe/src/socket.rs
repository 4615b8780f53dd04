//! Server-side connection multiplexing: demuxes datagrams by source address, spins up a new
//! session on an unrecognised session-request, sweeps terminated sessions on each tick, and
//! re-keys the address map on RemapConnection.

use std::net::SocketAddr;
use std::time::Instant;

use ahash::RandomState;
use log::{info, warn};
use rand::random;
use slab::Slab;
use utils::bytes;

use crate::config::{AppParams, DisconnectReason, SessionParams, PROTOCOL_VERSION};
use crate::framing;
use crate::packet::{Disconnect, OpCode, RemapConnection, SessionRequest};
use crate::session::{Event, Session};

type Map<V> = std::collections::HashMap<SocketAddr, V, RandomState>;

pub struct SocketHandler<F1, F2, F3> {
	sessions: Slab<Session<F1, F2, F3>>,
	by_addr: Map<usize>,
	by_id: std::collections::HashMap<u32, usize, RandomState>,

	template: SessionParams,
	encryption_enabled: bool,
	cipher_key: [u8; 256],
	on_session_opened: F1,
	on_data: F2,
	on_session_closed: F3,
}

impl<F1, F2, F3> SocketHandler<F1, F2, F3>
where
	F1: FnMut(u32) + Clone,
	F2: FnMut(u32, &[u8]) + Clone,
	F3: FnMut(u32, DisconnectReason) + Clone,
{
	pub fn new(template: SessionParams, encryption_enabled: bool, cipher_key: [u8; 256], on_session_opened: F1, on_data: F2, on_session_closed: F3) -> Self {
		Self {
			sessions: Slab::new(),
			by_addr: Map::default(),
			by_id: std::collections::HashMap::default(),
			template,
			encryption_enabled,
			cipher_key,
			on_session_opened,
			on_data,
			on_session_closed,
		}
	}

	pub fn session_count(&self) -> usize {
		self.sessions.len()
	}

	/// Queues application data for reliable delivery on an existing session.
	pub fn enqueue(&mut self, session_id: u32, data: &[u8], now: Instant) {
		if let Some(&idx) = self.by_id.get(&session_id) {
			self.sessions[idx].enqueue(data, now);
		}
	}

	/// Handles one received datagram. `send` is invoked with the destination address and the
	/// bytes to write back to the socket.
	pub fn handle_datagram(&mut self, from: SocketAddr, bytes_in: &[u8], now: Instant, mut send: impl FnMut(SocketAddr, &[u8])) {
		if let Some(&idx) = self.by_addr.get(&from) {
			let event = self.sessions[idx].handle_datagram(bytes_in, from, now, |buf| send(from, buf));

			if let Event::Remap(new_addr) = event {
				self.by_addr.remove(&from);
				self.by_addr.insert(new_addr, idx);
			}

			return;
		}

		self.handle_unregistered(from, bytes_in, now, &mut send);
	}

	fn handle_unregistered(&mut self, from: SocketAddr, bytes_in: &[u8], now: Instant, send: &mut impl FnMut(SocketAddr, &[u8])) {
		let Ok(validated) = framing::validate(bytes_in, 0, 0, false) else {
			warn!("dropping malformed datagram from unregistered sender {from}");
			return;
		};

		match validated.op {
			OpCode::SessionRequest => self.accept(from, validated.body, now, send),
			OpCode::RemapConnection => self.remap(from, validated.body, now, send),
			_ => {
				let mut reply = vec![0u8; 2];
				reply[0..2].copy_from_slice(&(OpCode::UnknownSender as u16).to_be_bytes());
				send(from, &reply);
			}
		}
	}

	/// Sends a contextual `Disconnect` for a session that never made it into `self.sessions`,
	/// using the server's baseline framing parameters since no negotiated `Session` exists yet.
	fn reject(&self, to: SocketAddr, session_id: u32, reason: DisconnectReason, send: &mut impl FnMut(SocketAddr, &[u8])) {
		let header_len = framing::header_len(self.template.compression_enabled);
		let trailer_len = framing::trailer_len(self.template.crc_length);

		let mut buf = vec![0u8; header_len + 6 + trailer_len];
		*bytes::cast_mut::<Disconnect>(&mut buf[header_len..header_len + 6]) = Disconnect {
			session_id: utils::endian::u32be::from(session_id),
			reason: utils::endian::u16be::from(reason as u16),
		};
		framing::stamp_contextual(&mut buf, OpCode::Disconnect, self.template.compression_enabled, self.template.crc_seed, self.template.crc_length);

		send(to, &buf);
	}

	fn accept(&mut self, from: SocketAddr, body: &[u8], now: Instant, send: &mut impl FnMut(SocketAddr, &[u8])) {
		if body.len() < core::mem::size_of::<SessionRequest>() {
			warn!("session-request from {from} too short, ignoring");
			return;
		}

		let req = bytes::cast::<SessionRequest>(&body[..core::mem::size_of::<SessionRequest>()]);
		let session_id: u32 = req.session_id.get();
		let protocol_version: u32 = req.protocol_version.get();

		let tag_bytes = &body[core::mem::size_of::<SessionRequest>()..];
		let tag_end = tag_bytes.iter().position(|&b| b == 0).unwrap_or(tag_bytes.len());
		let application_protocol = String::from_utf8_lossy(&tag_bytes[..tag_end]).into_owned();

		if protocol_version != PROTOCOL_VERSION || application_protocol != self.template.application_protocol {
			warn!("rejecting session-request from {from}: protocol version {protocol_version}, application protocol {application_protocol:?}");
			self.reject(from, session_id, DisconnectReason::ProtocolMismatch, send);
			return;
		}

		if let Some(&idx) = self.by_id.get(&session_id) {
			let existing_remote = self.sessions[idx].remote;
			info!("session-request for already-known session {session_id} from new address {from}, terminating the existing session");
			self.sessions[idx].terminate(DisconnectReason::ConnectError, now, |buf| send(existing_remote, buf));
			return;
		}

		let mut params = self.template.clone();
		params.application_protocol = application_protocol;
		params.remote_udp_length = req.udp_length.get();

		let callbacks = AppParams {
			encryption_enabled: self.encryption_enabled,
			cipher_key: self.cipher_key,
			on_session_opened: self.on_session_opened.clone(),
			on_data: self.on_data.clone(),
			on_session_closed: self.on_session_closed.clone(),
		};

		let crc_seed = random();
		let session = Session::accept(session_id, from, crc_seed, params, callbacks, now, |buf| send(from, buf));

		let idx = self.sessions.insert(session);
		self.by_addr.insert(from, idx);
		self.by_id.insert(session_id, idx);

		info!("accepted session {session_id} from {from}");
	}

	fn remap(&mut self, from: SocketAddr, body: &[u8], _now: Instant, _send: &mut impl FnMut(SocketAddr, &[u8])) {
		if body.len() < core::mem::size_of::<RemapConnection>() {
			warn!("remap-connection from {from} too short, ignoring");
			return;
		}

		let remap = bytes::cast::<RemapConnection>(&body[..core::mem::size_of::<RemapConnection>()]);
		let session_id: u32 = remap.session_id.get();
		let crc_seed: u32 = remap.crc_seed.get();

		let Some(&idx) = self.by_id.get(&session_id) else {
			warn!("remap-connection for unknown session {session_id} from {from}, ignoring");
			return;
		};

		let old_addr = self.sessions[idx].remote;
		self.by_addr.remove(&old_addr);
		self.by_addr.insert(from, idx);
		self.sessions[idx].remap(from, crc_seed);

		info!("remapped session {session_id} from {old_addr} to {from}");
	}

	/// Runs one tick across every live session, sweeping out any that have terminated.
	pub fn tick(&mut self, now: Instant, mut send: impl FnMut(SocketAddr, &[u8])) {
		let mut terminated = Vec::new();

		for (idx, session) in self.sessions.iter_mut() {
			let remote = session.remote;
			session.tick(now, |buf| send(remote, buf));

			if session.is_terminated() {
				terminated.push((idx, remote, session.session_id));
			}
		}

		for (idx, remote, session_id) in terminated {
			self.sessions.remove(idx);
			self.by_addr.remove(&remote);
			self.by_id.remove(&session_id);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
	use std::time::Instant;

	use super::SocketHandler;
	use crate::config::{DisconnectReason, SessionParams, PROTOCOL_VERSION};
	use crate::packet::{OpCode, SessionRequest};
	use utils::bytes;

	fn addr(port: u16) -> SocketAddr {
		SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
	}

	fn session_request_datagram(session_id: u32, tag: &str) -> Vec<u8> {
		let mut buf = vec![0u8; 2 + core::mem::size_of::<SessionRequest>() + tag.len() + 1];
		buf[0..2].copy_from_slice(&(OpCode::SessionRequest as u16).to_be_bytes());
		*bytes::cast_mut::<SessionRequest>(&mut buf[2..2 + core::mem::size_of::<SessionRequest>()]) = SessionRequest {
			protocol_version: utils::endian::u32be::from(PROTOCOL_VERSION),
			session_id: utils::endian::u32be::from(session_id),
			udp_length: utils::endian::u32be::from(512),
		};
		let tag_start = 2 + core::mem::size_of::<SessionRequest>();
		buf[tag_start..tag_start + tag.len()].copy_from_slice(tag.as_bytes());
		buf
	}

	fn template(tag: &str) -> SessionParams {
		let mut params = SessionParams::default();
		params.application_protocol = tag.to_string();
		params
	}

	#[test]
	fn session_request_from_new_address_creates_a_session_and_replies() {
		let mut handler = SocketHandler::new(template("demo"), false, [0u8; 256], |_: u32| {}, |_: u32, _: &[u8]| {}, |_: u32, _: DisconnectReason| {});

		let mut sent = Vec::new();
		let from = addr(9000);
		handler.handle_datagram(from, &session_request_datagram(42, "demo"), Instant::now(), |to, buf| sent.push((to, buf.to_vec())));

		assert_eq!(handler.session_count(), 1);
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].0, from);
		assert_eq!(u16::from_be_bytes([sent[0].1[0], sent[0].1[1]]), OpCode::SessionResponse as u16);
	}

	#[test]
	fn duplicate_session_request_for_known_session_is_ignored() {
		let mut handler = SocketHandler::new(template("demo"), false, [0u8; 256], |_: u32| {}, |_: u32, _: &[u8]| {}, |_: u32, _: DisconnectReason| {});

		let now = Instant::now();
		let from = addr(9001);
		let datagram = session_request_datagram(7, "demo");

		handler.handle_datagram(from, &datagram, now, |_, _| {});
		handler.handle_datagram(from, &datagram, now, |_, _| {});

		assert_eq!(handler.session_count(), 1);
	}

	#[test]
	fn session_request_for_known_session_from_a_new_address_terminates_the_existing_session() {
		let mut handler = SocketHandler::new(template("demo"), false, [0u8; 256], |_: u32| {}, |_: u32, _: &[u8]| {}, |_: u32, _: DisconnectReason| {});

		let now = Instant::now();
		handler.handle_datagram(addr(9003), &session_request_datagram(99, "demo"), now, |_, _| {});
		assert_eq!(handler.session_count(), 1);

		let mut sent = Vec::new();
		handler.handle_datagram(addr(9004), &session_request_datagram(99, "demo"), now, |to, buf| sent.push((to, buf.to_vec())));

		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].0, addr(9003));
		assert_eq!(u16::from_be_bytes([sent[0].1[0], sent[0].1[1]]), OpCode::Disconnect as u16);
	}

	#[test]
	fn session_request_with_mismatched_application_protocol_is_rejected() {
		let mut handler = SocketHandler::new(template("demo"), false, [0u8; 256], |_: u32| {}, |_: u32, _: &[u8]| {}, |_: u32, _: DisconnectReason| {});

		let mut sent = Vec::new();
		let from = addr(9005);
		handler.handle_datagram(from, &session_request_datagram(50, "other"), Instant::now(), |to, buf| sent.push((to, buf.to_vec())));

		assert_eq!(handler.session_count(), 0);
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].0, from);
		assert_eq!(u16::from_be_bytes([sent[0].1[0], sent[0].1[1]]), OpCode::Disconnect as u16);
	}

	#[test]
	fn unrecognised_non_handshake_packet_gets_unknown_sender_reply() {
		let mut handler = SocketHandler::new(template("demo"), false, [0u8; 256], |_: u32| {}, |_: u32, _: &[u8]| {}, |_: u32, _: DisconnectReason| {});

		let mut sent = Vec::new();
		let from = addr(9002);
		let heartbeat = (OpCode::Heartbeat as u16).to_be_bytes();
		handler.handle_datagram(from, &heartbeat, Instant::now(), |to, buf| sent.push((to, buf.to_vec())));

		assert_eq!(handler.session_count(), 0);
		assert_eq!(sent.len(), 1);
		assert_eq!(u16::from_be_bytes([sent[0].1[0], sent[0].1[1]]), OpCode::UnknownSender as u16);
	}
}
