//! Packet validation and the contextual framing envelope: op-code dispatch, CRC check/emit,
//! length checks, and the (decode-only) compression envelope.

use std::io::Read;

use flate2::bufread::ZlibDecoder;
use log::warn;

use crate::crc;
use crate::packet::OpCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Invalid {
	TooShort,
	CrcMismatch,
	InvalidOpCode,
}

pub struct Validated<'a> {
	pub op: OpCode,
	/// Whether the compression flag was set. Always `false` for contextless packets.
	pub compressed: bool,
	/// The payload: after the op code (and compression flag, if present), before the CRC
	/// trailer (if present).
	pub body: &'a [u8],
}

/// The minimum body length (after the contextual header, before the trailer) required for
/// each op code, per the external interface's length table.
fn min_body_len(op: OpCode) -> usize {
	use OpCode::*;

	match op {
		SessionRequest => 12 + 1, // u32 version + u32 session_id + u32 udp_length + nul
		SessionResponse => 4 + 4 + 1 + 1 + 1 + 4 + 4,
		Heartbeat => 0,
		MultiPacket => 2,
		ReliableData | ReliableDataFragment => 2 + 1,
		Acknowledge | AcknowledgeAll => 2,
		Disconnect => 4 + 2,
		UnknownSender => 0,
		RemapConnection => 4 + 4,
		NetStatusRequest | NetStatusResponse => 0,
	}
}

/// Validates a received datagram against the session's negotiated compression/CRC settings.
/// `crc_seed`/`crc_length`/`compression_enabled` are ignored for contextless op codes, which
/// carry neither.
pub fn validate(bytes: &[u8], crc_seed: u32, crc_length: u8, compression_enabled: bool) -> Result<Validated<'_>, Invalid> {
	if bytes.len() < 2 {
		return Err(Invalid::InvalidOpCode);
	}

	let op = OpCode::from_u16(u16::from_be_bytes([bytes[0], bytes[1]])).ok_or(Invalid::InvalidOpCode)?;

	if op.is_contextless() {
		if bytes.len() < 2 + min_body_len(op) {
			return Err(Invalid::TooShort);
		}

		return Ok(Validated { op, compressed: false, body: &bytes[2..] });
	}

	let header_len = 2 + if compression_enabled { 1 } else { 0 };
	let trailer_len = crc_length as usize;

	if bytes.len() < header_len + min_body_len(op) + trailer_len {
		return Err(Invalid::TooShort);
	}

	if crc_length > 0 {
		let split = bytes.len() - trailer_len;
		let computed = crc::checksum(crc_seed, &bytes[..split]);

		let mut expected = [0u8; 4];
		crc::write_truncated(computed, crc_length, &mut expected[..trailer_len]);

		if expected[..trailer_len] != bytes[split..] {
			warn!("CRC mismatch on op code {:?}", op);
			return Err(Invalid::CrcMismatch);
		}
	}

	let compressed = compression_enabled && bytes[2] != 0;
	let body_start = header_len;
	let body_end = bytes.len() - trailer_len;

	Ok(Validated { op, compressed, body: &bytes[body_start..body_end] })
}

/// Writes the op code, compression flag (always zero: outbound compression is never applied),
/// and CRC trailer around an already-assembled contextual datagram. `buf` must already hold
/// the payload in `[header_len..buf.len() - trailer_len]`.
pub fn stamp_contextual(buf: &mut [u8], op: OpCode, compression_enabled: bool, crc_seed: u32, crc_length: u8) {
	buf[0..2].copy_from_slice(&(op as u16).to_be_bytes());

	if compression_enabled {
		buf[2] = 0;
	}

	let trailer_len = crc_length as usize;
	let split = buf.len() - trailer_len;

	let computed = crc::checksum(crc_seed, &buf[..split]);
	crc::write_truncated(computed, crc_length, &mut buf[split..]);
}

pub fn header_len(compression_enabled: bool) -> usize {
	2 + if compression_enabled { 1 } else { 0 }
}

pub fn trailer_len(crc_length: u8) -> usize {
	crc_length as usize
}

/// Expands a ZLIB-compressed body, refusing to grow past `3 * remote_udp_length` bytes.
/// Decompression-only: the protocol never requires this build to emit compressed output.
pub fn decompress(remote_udp_length: u32, raw: &[u8]) -> Result<Vec<u8>, ()> {
	let limit = remote_udp_length as u64 * 3;
	let mut decoder = ZlibDecoder::new(raw).take(limit + 1);

	let mut out = Vec::new();
	decoder.read_to_end(&mut out).map_err(|err| warn!("failed to decompress packet body: {err}"))?;

	if out.len() as u64 > limit {
		warn!("decompressed packet body exceeds {limit} bytes, rejecting");
		return Err(());
	}

	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn contextless_packet_requires_no_crc_or_compression_flag() {
		let mut bytes = vec![0x00, 0x1D]; // UnknownSender
		let v = validate(&bytes, 0, 2, true).unwrap();
		assert_eq!(v.op, OpCode::UnknownSender);
		assert!(!v.compressed);
		assert!(v.body.is_empty());

		bytes.push(0xFF);
		let v = validate(&bytes, 0, 2, true).unwrap();
		assert_eq!(v.body, &[0xFF]);
	}

	#[test]
	fn too_short_contextual_packet_is_rejected() {
		let bytes = [0x00, 0x06]; // Heartbeat, no CRC trailer present
		assert_eq!(validate(&bytes, 0, 2, false), Err(Invalid::TooShort));
	}

	#[test]
	fn valid_crc_round_trips() {
		let mut buf = vec![0u8; 2 + 3 + 2]; // header + 3-byte reliable-data body + 2-byte CRC
		buf[0..2].copy_from_slice(&(OpCode::ReliableData as u16).to_be_bytes());
		buf[2..5].copy_from_slice(&[0, 1, 0xAB]);

		stamp_contextual(&mut buf, OpCode::ReliableData, false, 0xDEAD_BEEF, 2);

		let v = validate(&buf, 0xDEAD_BEEF, 2, false).unwrap();
		assert_eq!(v.op, OpCode::ReliableData);
		assert_eq!(v.body, &[0, 1, 0xAB]);
	}

	#[test]
	fn mutated_byte_invalidates_the_crc() {
		let mut buf = vec![0u8; 2 + 3 + 2];
		buf[0..2].copy_from_slice(&(OpCode::ReliableData as u16).to_be_bytes());
		buf[2..5].copy_from_slice(&[0, 1, 0xAB]);
		stamp_contextual(&mut buf, OpCode::ReliableData, false, 0xDEAD_BEEF, 2);

		buf[3] ^= 0xFF;

		assert_eq!(validate(&buf, 0xDEAD_BEEF, 2, false), Err(Invalid::CrcMismatch));
	}

	#[test]
	fn invalid_op_code_is_rejected() {
		let buf = [0xBE, 0xEF];
		assert_eq!(validate(&buf, 0, 2, false), Err(Invalid::InvalidOpCode));
	}
}
