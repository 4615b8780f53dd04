//! A fixed-capacity ring of optional slots keyed by `index % capacity`.
//!
//! This is the runtime-sized counterpart of a const-generic slot ring, whose capacity is
//! picked at compile time — a good fit for a handful of fixed-size tables but not for a
//! sliding-window stash whose capacity is a negotiated session parameter. `Ring<T>` keeps the
//! same slot-keyed-by-remainder shape and the same `get`/`get_mut`/`remove`/`insert` surface,
//! backed by a plain `Vec<Option<T>>`.

pub struct Ring<T> {
	slots: Vec<Option<T>>,
}

impl<T> Ring<T> {
	/// Construct a ring with the given capacity, all slots empty.
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0, "ring capacity must be non-zero");

		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, || None);

		Self { slots }
	}

	#[inline]
	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	#[inline]
	fn slot(&self, idx: u64) -> usize {
		(idx % self.capacity() as u64) as usize
	}

	#[inline]
	pub fn get(&self, idx: u64) -> Option<&T> {
		let slot = self.slot(idx);
		self.slots[slot].as_ref()
	}

	#[inline]
	pub fn get_mut(&mut self, idx: u64) -> Option<&mut T> {
		let slot = self.slot(idx);
		self.slots[slot].as_mut()
	}

	#[inline]
	pub fn is_occupied(&self, idx: u64) -> bool {
		let slot = self.slot(idx);
		self.slots[slot].is_some()
	}

	/// Remove and return whatever occupies the slot for `idx`, regardless of whether it
	/// actually holds an item for `idx` specifically. Callers must check occupancy (and the
	/// item's own recorded sequence, if that matters) before calling this.
	#[inline]
	pub fn remove(&mut self, idx: u64) -> Option<T> {
		let slot = self.slot(idx);
		self.slots[slot].take()
	}

	/// Insert `t` into the slot for `idx`, returning whatever was there before.
	#[inline]
	pub fn insert(&mut self, idx: u64, t: T) -> Option<T> {
		let slot = self.slot(idx);
		self.slots[slot].replace(t)
	}

	/// Iterate over occupied slots in slot order (not sequence order).
	pub fn iter(&self) -> impl Iterator<Item = &T> {
		self.slots.iter().filter_map(|s| s.as_ref())
	}

	pub fn len(&self) -> usize {
		self.slots.iter().filter(|s| s.is_some()).count()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.iter().all(Option::is_none)
	}
}
