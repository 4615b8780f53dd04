use std::time::Duration;

/// Negotiated or configured per-session parameters.
///
/// Defaults match the wire defaults listed for the protocol: a 512-byte UDP length, CRC
/// length 2, and 400-entry windows in both directions.
#[derive(Clone, Debug)]
pub struct SessionParams {
	pub application_protocol: String,
	pub local_udp_length: u32,
	pub remote_udp_length: u32,
	pub crc_seed: u32,
	pub crc_length: u8,
	pub compression_enabled: bool,
	/// Max queued incoming reliable packets (window size N_in).
	pub window_in: usize,
	/// Max queued outgoing reliable packets (window size N_out).
	pub window_out: usize,
	pub data_ack_window: u32,
	pub heartbeat_after: Duration,
	pub inactivity_timeout: Duration,
	pub acknowledge_all: bool,
	pub max_coalesce_hold: Duration,
}

impl Default for SessionParams {
	fn default() -> Self {
		Self {
			application_protocol: String::new(),
			local_udp_length: 512,
			remote_udp_length: 512,
			crc_seed: 0,
			crc_length: 2,
			compression_enabled: false,
			window_in: 400,
			window_out: 400,
			data_ack_window: 32,
			heartbeat_after: Duration::from_secs(25),
			inactivity_timeout: Duration::from_secs(30),
			acknowledge_all: false,
			max_coalesce_hold: Duration::from_millis(50),
		}
	}
}

/// The 30ms floor recommended for the receive-side acknowledge-all rate limiter. The original
/// source oscillates between 2ms and 30ms branches; this build picks a single constant.
pub const MAX_ACK_DELAY: Duration = Duration::from_millis(30);

/// The fixed retransmission timeout. A dynamic RTO is left as an extension point, not
/// implemented here.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Protocol version carried in session-request/session-response.
pub const PROTOCOL_VERSION: u32 = 3;

/// Application-supplied parameters: encryption and the callbacks invoked for session events.
pub struct AppParams<F1, F2, F3> {
	pub encryption_enabled: bool,
	pub cipher_key: [u8; 256],
	pub on_session_opened: F1,
	pub on_data: F2,
	pub on_session_closed: F3,
}

/// Reasons a session may terminate, carried in the disconnect packet and the session-closed
/// callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum DisconnectReason {
	None = 0,
	IcmpError = 1,
	Timeout = 2,
	OtherSideTerminated = 3,
	ManagerDeleted = 4,
	ConnectFail = 5,
	Application = 6,
	UnreachableConnection = 7,
	UnacknowledgedTimeout = 8,
	NewConnectionAttempt = 9,
	ConnectionRefused = 10,
	ConnectError = 11,
	ConnectingToSelf = 12,
	ReliableOverflow = 13,
	ApplicationReleased = 14,
	CorruptPacket = 15,
	ProtocolMismatch = 16,
}

impl DisconnectReason {
	pub fn from_wire(n: u16) -> Option<Self> {
		use DisconnectReason as D;

		Some(match n {
			0 => D::None,
			1 => D::IcmpError,
			2 => D::Timeout,
			3 => D::OtherSideTerminated,
			4 => D::ManagerDeleted,
			5 => D::ConnectFail,
			6 => D::Application,
			7 => D::UnreachableConnection,
			8 => D::UnacknowledgedTimeout,
			9 => D::NewConnectionAttempt,
			10 => D::ConnectionRefused,
			11 => D::ConnectError,
			12 => D::ConnectingToSelf,
			13 => D::ReliableOverflow,
			14 => D::ApplicationReleased,
			15 => D::CorruptPacket,
			16 => D::ProtocolMismatch,
			_ => return None,
		})
	}
}
