//! Wire op codes and the fixed-layout record types from the external interface.
//!
//! Op codes 0x11/0x15 are ambiguous in the source material between "acknowledge"/"out of
//! order" and "acknowledge-all"/"acknowledge"; this build assigns 0x11 = acknowledge and
//! 0x15 = acknowledge-all and rejects traffic that disagrees (there is nothing to reject
//! against here, since there is only one parser — the assignment just needs to be documented).

use utils::bytes::Cast;
use utils::endian::{u32be, u16be};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum OpCode {
	SessionRequest = 0x01,
	SessionResponse = 0x02,
	MultiPacket = 0x03,
	Disconnect = 0x05,
	Heartbeat = 0x06,
	NetStatusRequest = 0x07,
	NetStatusResponse = 0x08,
	ReliableData = 0x09,
	ReliableDataFragment = 0x0D,
	Acknowledge = 0x11,
	AcknowledgeAll = 0x15,
	UnknownSender = 0x1D,
	RemapConnection = 0x1E,
}

impl OpCode {
	pub fn from_u16(n: u16) -> Option<Self> {
		use OpCode::*;

		Some(match n {
			0x01 => SessionRequest,
			0x02 => SessionResponse,
			0x03 => MultiPacket,
			0x05 => Disconnect,
			0x06 => Heartbeat,
			0x07 => NetStatusRequest,
			0x08 => NetStatusResponse,
			0x09 => ReliableData,
			0x0D => ReliableDataFragment,
			0x11 => Acknowledge,
			0x15 => AcknowledgeAll,
			0x1D => UnknownSender,
			0x1E => RemapConnection,
			_ => return None,
		})
	}

	/// Whether this op code is contextless: negotiation and endpoint-control packets with no
	/// compression flag and no CRC trailer.
	pub fn is_contextless(self) -> bool {
		matches!(self, OpCode::SessionRequest | OpCode::SessionResponse | OpCode::UnknownSender | OpCode::RemapConnection)
	}
}

/// The fixed header of a session-request packet. The application-protocol tag follows as a
/// null-terminated string, so this type covers only the fixed-size prefix.
#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct SessionRequest {
	pub protocol_version: u32be,
	pub session_id: u32be,
	pub udp_length: u32be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct SessionResponse {
	pub session_id: u32be,
	pub crc_seed: u32be,
	pub crc_length: u8,
	pub is_compression_enabled: u8,
	pub unknown: u8,
	pub udp_length: u32be,
	pub protocol_version: u32be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct Disconnect {
	pub session_id: u32be,
	pub reason: u16be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct RemapConnection {
	pub session_id: u32be,
	pub crc_seed: u32be,
}

/// The 2-byte marker prefixing a multi-data envelope inside a reliable-data payload.
pub const MULTI_DATA_MARKER: [u8; 2] = [0x00, 0x19];
