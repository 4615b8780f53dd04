//! The reliable input channel: ordering, deduplication, stash, fragment reassembly, and
//! acknowledgement scheduling.

use std::time::Instant;

use collections::ring::Ring;
use log::{error, trace};

use crate::cipher::Rc4;
use crate::config::MAX_ACK_DELAY;
use crate::packet::MULTI_DATA_MARKER;
use crate::pool::{Pool, PoolBuf};
use crate::seq;
use crate::varint;

/// An acknowledgement the channel wants sent, produced as a side effect of `receive`/`tick`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
	Single(u16),
	All(u16),
}

struct Stashed {
	seq: u64,
	is_fragment: bool,
	buf: PoolBuf,
}

struct Reassembly {
	buf: Vec<u8>,
	expected_len: usize,
}

pub struct Input {
	pool: Pool,
	cipher: Option<Rc4>,

	window: usize,
	stash: Ring<Stashed>,
	window_start: u64,

	reassembly: Option<Reassembly>,

	last_ack_all_sent: Option<Instant>,
	last_ack_all_seq: Option<u64>,

	pub total_received: u64,
	pub duplicate_count: u64,
	pub received_bytes: u64,
}

impl Input {
	pub fn new(pool: Pool, window: usize, cipher: Option<Rc4>) -> Self {
		Self {
			pool,
			cipher,
			window,
			stash: Ring::new(window),
			window_start: 0,
			reassembly: None,
			last_ack_all_sent: None,
			last_ack_all_seq: None,
			total_received: 0,
			duplicate_count: 0,
			received_bytes: 0,
		}
	}

	pub fn window_start(&self) -> u64 {
		self.window_start
	}

	pub fn pool_handle(&self) -> Pool {
		self.pool.clone()
	}

	/// Handles one reliable-data or reliable-data-fragment body (the payload after the
	/// contextual header, stripped of the CRC trailer): `[2-byte sequence][payload]`.
	pub fn receive(&mut self, body: &[u8], is_fragment: bool, acknowledge_all: bool, now: Instant, mut send_ack: impl FnMut(Ack), mut deliver: impl FnMut(&[u8])) {
		self.total_received += 1;

		if body.len() < 2 {
			error!("reliable-data body shorter than its sequence prefix");
			return;
		}

		let wire_seq = u16::from_be_bytes([body[0], body[1]]);
		let true_seq = seq::reconstruct(wire_seq, self.window_start, self.window as u32);
		let payload = &body[2..];

		if true_seq >= self.window_start + self.window as u64 {
			trace!("dropping sequence {true_seq}, too far ahead of window start {}", self.window_start);
			return;
		}

		if true_seq < self.window_start {
			self.duplicate_count += 1;

			let due = self.last_ack_all_sent.map(|t| now.saturating_duration_since(t) >= MAX_ACK_DELAY).unwrap_or(true);
			if due {
				send_ack(Ack::All((self.window_start - 1) as u16));
				self.last_ack_all_sent = Some(now);
			}

			return;
		}

		if acknowledge_all || true_seq > self.window_start {
			send_ack(Ack::Single(wire_seq));
		}

		if true_seq == self.window_start {
			self.process(payload, is_fragment, now, &mut send_ack, &mut deliver);
			self.window_start += 1;

			while let Some(slot) = self.take_window_start_slot() {
				self.process(&slot.buf.borrow(), slot.is_fragment, now, &mut send_ack, &mut deliver);
				self.window_start += 1;
			}

			return;
		}

		let slot = (true_seq as usize) % self.window;

		if let Some(existing) = self.stash.get(slot as u64) {
			if existing.seq == true_seq {
				self.duplicate_count += 1;
			} else {
				error!("stash slot {slot} held sequence {} while handling out-of-order sequence {true_seq}", existing.seq);
			}

			return;
		}

		let buf = self.pool.rent();
		buf.truncate(payload.len());
		buf.borrow_mut().copy_from_slice(payload);

		self.stash.insert(slot as u64, Stashed { seq: true_seq, is_fragment, buf });
	}

	fn take_window_start_slot(&mut self) -> Option<Stashed> {
		let slot = (self.window_start as usize) % self.window;
		let entry = self.stash.get(slot as u64)?;

		if entry.seq != self.window_start {
			return None;
		}

		self.stash.remove(slot as u64)
	}

	fn process(&mut self, payload: &[u8], is_fragment: bool, now: Instant, send_ack: &mut impl FnMut(Ack), deliver: &mut impl FnMut(&[u8])) {
		if !is_fragment {
			self.dispatch_multi(payload, deliver);
			return;
		}

		if self.reassembly.is_none() {
			if payload.len() < 4 {
				error!("master fragment shorter than its length prefix");
				return;
			}

			let expected_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
			let mut buf = Vec::with_capacity(expected_len);
			buf.extend_from_slice(&payload[4..]);
			self.reassembly = Some(Reassembly { buf, expected_len });
		} else {
			self.reassembly.as_mut().unwrap().buf.extend_from_slice(payload);
		}

		let _ = now;
		let _ = send_ack;

		if self.reassembly.as_ref().unwrap().buf.len() >= self.reassembly.as_ref().unwrap().expected_len {
			let Reassembly { buf, .. } = self.reassembly.take().unwrap();
			self.dispatch_multi(&buf, deliver);
		}
	}

	fn dispatch_multi(&mut self, payload: &[u8], deliver: &mut impl FnMut(&[u8])) {
		if payload.starts_with(&MULTI_DATA_MARKER) {
			let mut rest = &payload[MULTI_DATA_MARKER.len()..];

			while !rest.is_empty() {
				let Some((len, consumed)) = varint::decode(rest) else {
					error!("malformed multi-data length prefix, dropping remainder");
					return;
				};

				let len = len as usize;
				if rest.len() < consumed + len {
					error!("multi-data item length exceeds remaining payload, dropping remainder");
					return;
				}

				self.decrypt_and_deliver(&rest[consumed..consumed + len], deliver);
				rest = &rest[consumed + len..];
			}
		} else {
			self.decrypt_and_deliver(payload, deliver);
		}
	}

	fn decrypt_and_deliver(&mut self, bytes: &[u8], deliver: &mut impl FnMut(&[u8])) {
		let Some(cipher) = &mut self.cipher else {
			self.received_bytes += bytes.len() as u64;
			deliver(bytes);
			return;
		};

		let mut owned = if bytes.first() == Some(&0) && bytes.len() > 1 { bytes[1..].to_vec() } else { bytes.to_vec() };
		cipher.apply(&mut owned);

		self.received_bytes += owned.len() as u64;
		deliver(&owned);
	}

	/// Schedules a periodic AcknowledgeAll when per-packet acknowledgements aren't already
	/// covering every received sequence.
	pub fn tick(&mut self, now: Instant, acknowledge_all: bool, data_ack_window: u32, mut send_ack_all: impl FnMut(u16)) {
		if acknowledge_all || self.window_start == 0 {
			return;
		}

		let to_ack = self.window_start - 1;
		let not_yet_acked = self.last_ack_all_seq.map(|s| to_ack > s).unwrap_or(true);

		if !not_yet_acked {
			return;
		}

		let delay_elapsed = self.last_ack_all_sent.map(|t| now.saturating_duration_since(t) >= MAX_ACK_DELAY).unwrap_or(true);
		let backlog_due = self.last_ack_all_seq.map(|s| to_ack >= s + data_ack_window as u64 / 2).unwrap_or(true);

		if delay_elapsed || backlog_due {
			send_ack_all(to_ack as u16);
			self.last_ack_all_seq = Some(to_ack);
			self.last_ack_all_sent = Some(now);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use super::{Ack, Input};
	use crate::pool::Pool;

	fn input(window: usize) -> Input {
		Input::new(Pool::new(1500, 64), window, None)
	}

	fn reliable_body(seq: u16, payload: &[u8]) -> Vec<u8> {
		let mut v = seq.to_be_bytes().to_vec();
		v.extend_from_slice(payload);
		v
	}

	#[test]
	fn in_order_delivery_is_exact_and_ordered() {
		let mut chan = input(8);
		let now = Instant::now();

		let mut delivered = Vec::new();
		for (seq, payload) in [(0u16, b"A".as_slice()), (1, b"B"), (2, b"C")] {
			chan.receive(&reliable_body(seq, payload), false, false, now, |_| {}, |bytes| delivered.push(bytes.to_vec()));
		}

		assert_eq!(delivered, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
	}

	#[test]
	fn out_of_order_receive_stashes_then_drains_in_sequence_order() {
		let mut chan = input(8);
		let now = Instant::now();

		let mut delivered = Vec::new();
		let mut acks = Vec::new();

		chan.receive(&reliable_body(0, b"A"), false, false, now, |a| acks.push(a), |b| delivered.push(b.to_vec()));
		chan.receive(&reliable_body(2, b"C"), false, false, now, |a| acks.push(a), |b| delivered.push(b.to_vec()));
		chan.receive(&reliable_body(1, b"B"), false, false, now, |a| acks.push(a), |b| delivered.push(b.to_vec()));

		assert_eq!(delivered, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
		assert!(acks.contains(&Ack::Single(2)));
		assert_eq!(chan.window_start(), 3);
	}

	#[test]
	fn duplicate_within_window_is_not_redelivered() {
		let mut chan = input(8);
		let now = Instant::now();

		let mut delivered = Vec::new();
		chan.receive(&reliable_body(5, b"A"), false, false, now, |_| {}, |b| delivered.push(b.to_vec()));
		chan.receive(&reliable_body(5, b"A"), false, false, now, |_| {}, |b| delivered.push(b.to_vec()));

		assert_eq!(delivered.len(), 1);
		assert_eq!(chan.duplicate_count, 1);
	}

	#[test]
	fn fragment_reassembly_yields_one_delivery() {
		let mut chan = input(8);
		let now = Instant::now();

		let whole = vec![9u8; 2000];
		let mut master = 2000u32.to_be_bytes().to_vec();
		master.extend_from_slice(&whole[..494]);

		let mut delivered = Vec::new();
		chan.receive(&reliable_body(0, &master), true, false, now, |_| {}, |b| delivered.push(b.to_vec()));

		let mut offset = 494;
		for chunk_len in [498, 498, 510] {
			let chunk = &whole[offset..offset + chunk_len];
			chan.receive(&reliable_body((offset / 498 + 1) as u16, chunk), true, false, now, |_| {}, |b| delivered.push(b.to_vec()));
			offset += chunk_len;
		}

		assert_eq!(delivered.len(), 1);
		assert_eq!(delivered[0], whole);
	}
}
