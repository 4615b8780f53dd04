//! The reliable output channel: sequencing, fragmentation, multi-payload coalescing,
//! retransmission, and ack processing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use collections::ring::Ring;
use log::trace;

use crate::cipher::Rc4;
use crate::config::{DisconnectReason, RETRANSMIT_TIMEOUT};
use crate::pool::{Pool, PoolBuf};
use crate::seq;
use crate::varint;

/// A slot in the output stash: a produced, not-yet-acknowledged reliable packet.
struct Stash {
	is_fragment: bool,
	/// `[2-byte sequence][payload]`, ready to be stamped with a contextual header and sent.
	buf: PoolBuf,
	last_sent: Option<Instant>,
}

/// Notes the single-item flush optimisation from the source material (overwriting the
/// multi-data marker and first item's length prefix in place with the sequence) is not
/// reproduced here: this implementation instead builds the single-item packet as a fresh
/// copy. It costs one extra copy on that path in exchange for not needing unsafe, fixed-slop
/// header reservation; the wire result (an ordinary reliable-data packet, no multi marker) is
/// identical either way.
pub struct Output {
	pool: Pool,
	cipher: Option<Rc4>,

	window: usize,
	max_data_len: usize,
	max_data_len_locked: bool,

	stash: Ring<Stash>,
	overflow: VecDeque<(u64, Stash)>,

	window_start_out: u64,
	current_out: u64,
	total_out: u64,

	pending_items: Vec<Vec<u8>>,
	/// `2 (marker) + sum(varint_size(len) + len)` over `pending_items`, tracked incrementally.
	pending_bytes: usize,
	last_enqueue: Option<Instant>,

	pub resend_count: u64,
}

impl Output {
	pub fn new(pool: Pool, window: usize, cipher: Option<Rc4>) -> Self {
		Self {
			pool,
			cipher,
			window,
			max_data_len: 0,
			max_data_len_locked: false,
			stash: Ring::new(window),
			overflow: VecDeque::new(),
			window_start_out: 0,
			current_out: 0,
			total_out: 0,
			pending_items: Vec::new(),
			pending_bytes: 2,
			last_enqueue: None,
			resend_count: 0,
		}
	}

	/// Computes the max reliable-data payload length from the negotiated UDP length and the
	/// contextual header/trailer sizes. May only be called again before any sequence has been
	/// produced; later calls are a programmer error.
	pub fn set_max_data_length(&mut self, remote_udp_length: u32, header_len: usize, trailer_len: usize) {
		assert!(!self.max_data_len_locked, "max data length changed after the output channel has already produced a sequence");
		self.max_data_len = (remote_udp_length as usize).saturating_sub(header_len + trailer_len + 2);
	}

	fn overflow_is_full(&self) -> bool {
		(self.total_out - self.window_start_out) as usize >= 2 * self.window
	}

	/// Enqueues an application payload. Transforms it with the output cipher in place (if
	/// encryption is enabled), then coalesces it into the pending multi-buffer or, if it
	/// doesn't fit, fragments it across multiple stashed packets.
	pub fn enqueue(&mut self, data: &[u8], now: Instant) -> Result<(), DisconnectReason> {
		let mut owned = data.to_vec();

		if let Some(cipher) = &mut self.cipher {
			cipher.apply(&mut owned);

			if owned.first() == Some(&0) {
				owned.insert(0, 0);
			}
		}

		self.last_enqueue = Some(now);

		let cost = varint::size(owned.len() as u32) + owned.len();

		if self.pending_bytes + cost <= self.max_data_len {
			self.pending_bytes += cost;
			self.pending_items.push(owned);

			if self.pending_bytes == self.max_data_len {
				self.flush_multi(now)?;
			}

			return Ok(());
		}

		self.flush_multi(now)?;

		if 2 + cost <= self.max_data_len {
			self.pending_bytes = 2 + cost;
			self.pending_items.push(owned);
			return Ok(());
		}

		self.fragment(&owned, now)
	}

	/// Flushes the pending multi-buffer: a single item becomes an ordinary reliable-data
	/// packet, multiple items become one reliable-data packet carrying the multi-data
	/// envelope.
	pub fn flush_multi(&mut self, now: Instant) -> Result<(), DisconnectReason> {
		if self.pending_items.is_empty() {
			return Ok(());
		}

		let items = std::mem::take(&mut self.pending_items);
		self.pending_bytes = 2;

		let mut body = Vec::with_capacity(2);

		if items.len() == 1 {
			body.extend_from_slice(&items[0]);
		} else {
			body.extend_from_slice(&crate::packet::MULTI_DATA_MARKER);

			for item in &items {
				varint::encode(item.len() as u32, &mut body);
				body.extend_from_slice(item);
			}
		}

		self.stash_new(&body, false, now)
	}

	/// Splits an over-large payload into a master fragment (carrying the 4-byte total length)
	/// followed by as many follow-on fragments as needed.
	fn fragment(&mut self, data: &[u8], now: Instant) -> Result<(), DisconnectReason> {
		let master_room = self.max_data_len.saturating_sub(4);
		assert!(master_room > 0, "max data length too small to carry a single fragment byte");

		let (head, rest) = data.split_at(data.len().min(master_room));

		let mut body = Vec::with_capacity(4 + head.len());
		body.extend_from_slice(&(data.len() as u32).to_be_bytes());
		body.extend_from_slice(head);
		self.stash_new(&body, true, now)?;

		for chunk in rest.chunks(self.max_data_len.max(1)) {
			self.stash_new(chunk, true, now)?;
		}

		Ok(())
	}

	/// Assigns the next sequence, writes it into a rented buffer ahead of `body`, and stashes
	/// it, spilling to the overflow queue if its slot is already occupied.
	fn stash_new(&mut self, body: &[u8], is_fragment: bool, now: Instant) -> Result<(), DisconnectReason> {
		if self.overflow_is_full() {
			return Err(DisconnectReason::ReliableOverflow);
		}

		let seq = self.total_out;
		self.total_out += 1;
		self.max_data_len_locked = true;

		let buf = self.pool.rent();
		buf.truncate(2 + body.len());

		{
			let mut b = buf.borrow_mut();
			b[0..2].copy_from_slice(&(seq as u16).to_be_bytes());
			b[2..].copy_from_slice(body);
		}

		let entry = Stash { is_fragment, buf, last_sent: None };
		let slot = (seq as usize) % self.window;

		if self.stash.is_occupied(slot as u64) {
			self.overflow.push_back((seq, entry));
		} else {
			self.stash.insert(slot as u64, entry);
		}

		let _ = now;
		Ok(())
	}

	/// Runs one tick: drains the overflow queue, flushes a stale multi-buffer, rewinds for
	/// retransmission if the oldest unacked slot has timed out, then emits the send window.
	/// `emit` is called with `(is_fragment, payload)` for each packet that should go on the
	/// wire this tick, in order.
	pub fn tick(&mut self, now: Instant, coalesce_hold: Duration, mut emit: impl FnMut(bool, &[u8])) -> Result<(), DisconnectReason> {
		while let Some(&(seq, _)) = self.overflow.front() {
			let slot = (seq as usize) % self.window;
			if self.stash.is_occupied(slot as u64) {
				break;
			}

			let (_, entry) = self.overflow.pop_front().unwrap();
			self.stash.insert(slot as u64, entry);
		}

		let hold_elapsed = self.last_enqueue.map(|t| now.saturating_duration_since(t) >= coalesce_hold).unwrap_or(false);
		if hold_elapsed {
			self.flush_multi(now)?;
		}

		let head_slot = (self.window_start_out as usize) % self.window;
		if let Some(head) = self.stash.get(head_slot as u64) {
			if head.last_sent.map(|t| now.saturating_duration_since(t) >= RETRANSMIT_TIMEOUT).unwrap_or(false) {
				trace!("retransmission timeout elapsed for sequence {}, rewinding", self.window_start_out);
				self.current_out = self.window_start_out;
			}
		}

		let ceiling = self.total_out.min(self.current_out + self.window as u64);

		while self.current_out < ceiling {
			let slot = (self.current_out as usize) % self.window;

			let Some(entry) = self.stash.get_mut(slot as u64) else { break };

			if entry.last_sent.is_some() {
				self.resend_count += 1;
			}

			emit(entry.is_fragment, &entry.buf.borrow());
			entry.last_sent = Some(now);
			self.current_out += 1;
		}

		Ok(())
	}

	/// Processes a single-sequence Acknowledge.
	pub fn ack(&mut self, wire_seq: u16) {
		let seq = seq::reconstruct(wire_seq, self.window_start_out, self.window as u32);
		self.clear_slot(seq);
		self.advance_window_start();
	}

	/// Processes an AcknowledgeAll naming the highest contiguously acknowledged sequence.
	pub fn ack_all(&mut self, wire_seq: u16) {
		let last = seq::reconstruct(wire_seq, self.window_start_out, self.window as u32);

		let mut s = self.window_start_out;
		while s <= last {
			self.clear_slot(s);
			s += 1;
		}

		self.advance_window_start();
	}

	fn clear_slot(&mut self, seq: u64) {
		if seq < self.window_start_out || seq >= self.total_out {
			return; // late or unknown ack, ignored
		}

		let slot = (seq as usize) % self.window;
		self.stash.remove(slot as u64);
	}

	fn advance_window_start(&mut self) {
		while self.window_start_out < self.current_out {
			let slot = (self.window_start_out as usize) % self.window;
			if self.stash.is_occupied(slot as u64) {
				break;
			}
			self.window_start_out += 1;
		}

		if self.current_out < self.window_start_out {
			self.current_out = self.window_start_out;
		}
	}

	pub fn window_start_out(&self) -> u64 {
		self.window_start_out
	}

	pub fn current_out(&self) -> u64 {
		self.current_out
	}

	pub fn total_out(&self) -> u64 {
		self.total_out
	}

	pub fn pool_handle(&self) -> Pool {
		self.pool.clone()
	}
}

#[cfg(test)]
mod tests {
	use std::time::{Duration, Instant};

	use super::Output;
	use crate::pool::Pool;

	fn output(window: usize, max_data_len: usize) -> Output {
		let mut out = Output::new(Pool::new(1500, 64), window, None);
		out.max_data_len = max_data_len;
		out
	}

	#[test]
	fn small_payloads_coalesce_into_one_packet() {
		let mut out = output(8, 64);
		let now = Instant::now();

		let mut sent = Vec::new();
		out.enqueue(b"abcde", now).unwrap();
		out.enqueue(b"fghij", now).unwrap();
		out.enqueue(b"klmno", now).unwrap();

		out.tick(now, Duration::from_millis(50), |is_fragment, buf| {
			sent.push((is_fragment, buf.to_vec()));
		})
		.unwrap();

		assert_eq!(sent.len(), 1);
		let (is_fragment, buf) = &sent[0];
		assert!(!is_fragment);
		assert_eq!(&buf[2..4], &crate::packet::MULTI_DATA_MARKER);
	}

	#[test]
	fn oversized_payload_is_fragmented() {
		let mut out = output(8, 500 + 4);
		let now = Instant::now();

		let payload = vec![7u8; 2000];
		out.enqueue(&payload, now).unwrap();

		let mut sent = Vec::new();
		out.tick(now, Duration::ZERO, |is_fragment, buf| sent.push((is_fragment, buf.len()))).unwrap();

		assert!(sent.iter().all(|(f, _)| *f));
		assert!(sent.len() > 1);
	}

	#[test]
	fn retransmits_after_timeout_and_ack_all_clears_it() {
		let mut out = output(8, 64);
		let t0 = Instant::now();

		out.enqueue(b"hello", t0).unwrap();
		let mut sent = Vec::new();
		out.tick(t0, Duration::ZERO, |_, buf| sent.push(buf.to_vec())).unwrap();
		assert_eq!(sent.len(), 1);

		let t1 = t0 + Duration::from_millis(600);
		let mut resent = Vec::new();
		out.tick(t1, Duration::ZERO, |_, buf| resent.push(buf.to_vec())).unwrap();
		assert_eq!(resent.len(), 1);
		assert_eq!(out.resend_count, 1);

		out.ack_all(0);
		assert_eq!(out.window_start_out(), 1);
		assert_eq!(out.current_out(), 1);
	}

	#[test]
	fn window_bounds_hold_after_ack_processing() {
		let mut out = output(4, 64);
		let now = Instant::now();

		for i in 0..4 {
			out.enqueue(format!("msg{i}").as_bytes(), now).unwrap();
		}

		let mut sent = Vec::new();
		out.tick(now, Duration::ZERO, |_, buf| sent.push(buf.to_vec())).unwrap();
		assert_eq!(sent.len(), 4);

		out.ack(1);
		assert!(out.window_start_out() <= out.current_out());
		assert!(out.current_out() <= out.total_out());
	}
}
