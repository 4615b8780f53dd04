//! RC4, the legacy stream cipher used for confidentiality-only encryption of reliable
//! payloads. Not an authentication mechanism; CRC-32 covers integrity separately.

/// A single RC4 keystream generator: a 256-byte permutation plus the two running indices.
///
/// The initial state is built once from the application's key and then cloned per direction,
/// so the send and receive streams evolve independently from a shared starting point.
#[derive(Clone)]
pub struct Rc4 {
	state: [u8; 256],
	i: u8,
	j: u8,
}

impl Rc4 {
	/// Builds the initial permutation from a key. The key may be any length; the standard
	/// key-scheduling algorithm repeats it as needed.
	pub fn new(key: &[u8]) -> Self {
		assert!(!key.is_empty(), "RC4 key must not be empty");

		let mut state = [0u8; 256];
		for (i, b) in state.iter_mut().enumerate() {
			*b = i as u8;
		}

		let mut j: u8 = 0;
		for i in 0..256 {
			j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
			state.swap(i, j as usize);
		}

		Self { state, i: 0, j: 0 }
	}

	/// XORs `data` in place with the next `data.len()` bytes of keystream, advancing the
	/// internal state.
	pub fn apply(&mut self, data: &mut [u8]) {
		for byte in data {
			self.i = self.i.wrapping_add(1);
			self.j = self.j.wrapping_add(self.state[self.i as usize]);
			self.state.swap(self.i as usize, self.j as usize);

			let k = self.state[(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize];
			*byte ^= k;
		}
	}
}
