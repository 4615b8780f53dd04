//! Reconstructs a 64-bit true sequence from a 16-bit wire sequence plus the receiver's window
//! reference. Used both on receive (`cur = window_start`) and on ack processing
//! (`cur = window_start_out`).

/// `window` must be `< 0x8000`.
pub fn reconstruct(wire: u16, cur: u64, window: u32) -> u64 {
	debug_assert!(window < 0x8000);

	let window = window as u64;
	let mut seq = (cur & !0xFFFF) | wire as u64;

	if seq > cur + window {
		seq = seq.wrapping_sub(0x10000);
	} else if seq < cur.wrapping_sub(window) {
		seq = seq.wrapping_add(0x10000);
	}

	seq
}

#[cfg(test)]
mod tests {
	use super::reconstruct;

	#[test]
	fn concrete_vectors_from_the_wire_sequence_reconstruction_spec() {
		assert_eq!(reconstruct(1, 0, 8), 1);
		assert_eq!(reconstruct(1, 0xFFFF, 8), 0x10001);
		assert_eq!(reconstruct(0xFFFC, 0xFFFFFFFF, 8), 0xFFFFFFFC);
	}

	#[test]
	fn reconstructs_identity_when_wire_matches_low_bits_of_cur() {
		assert_eq!(reconstruct(0x1234, 0x1_0000_1234, 400), 0x1_0000_1234);
	}

	#[test]
	fn wraps_forward_across_a_16_bit_boundary() {
		// cur is near the top of its 16-bit word; a wire value just past the wrap should
		// reconstruct to the next word, not be read back as a huge backward jump.
		assert_eq!(reconstruct(0x0002, 0xFFFE, 16), 0x1_0002);
	}
}
