//! A bounded, reference-counted byte-buffer pool.
//!
//! The free list is the only piece of state shared across threads (spec: "the buffer pool is
//! the only shared resource that may be touched from more than one thread"), so it alone is
//! behind a `Mutex`. A rented `PoolBuf` is reference-counted with a plain `Rc`, since a single
//! session's channels never hand a buffer across a thread boundary; only its eventual return to
//! the shared free list needs synchronisation.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;
use std::sync::{Arc, Mutex, Weak};

/// A fixed-length byte-buffer pool with a hard cap on how many buffers it retains.
#[derive(Clone)]
pub struct Pool {
	free: Arc<Mutex<Vec<Vec<u8>>>>,
	buf_len: usize,
	capacity: usize,
}

impl Pool {
	pub fn new(buf_len: usize, capacity: usize) -> Self {
		Self { free: Arc::new(Mutex::new(Vec::with_capacity(capacity))), buf_len, capacity }
	}

	/// Rents a zeroed buffer of this pool's fixed length, reusing a returned one if available.
	pub fn rent(&self) -> PoolBuf {
		let mut data = self.free.lock().expect("pool mutex poisoned").pop().unwrap_or_else(|| vec![0; self.buf_len]);

		data.iter_mut().for_each(|b| *b = 0);

		PoolBuf {
			inner: Rc::new(Inner {
				data: RefCell::new(data),
				window: Cell::new((0, self.buf_len)),
				pool: Arc::downgrade(&self.free),
				capacity: self.capacity,
			}),
		}
	}
}

struct Inner {
	data: RefCell<Vec<u8>>,
	/// The `(start, end)` bounds of the valid slice within `data`.
	window: Cell<(usize, usize)>,
	pool: Weak<Mutex<Vec<Vec<u8>>>>,
	capacity: usize,
}

impl Drop for Inner {
	fn drop(&mut self) {
		let Some(pool) = self.pool.upgrade() else { return };
		let mut free = pool.lock().expect("pool mutex poisoned");

		if free.len() < self.capacity {
			free.push(self.data.take());
		}
	}
}

/// A reference-counted, pool-backed byte buffer windowed to its currently valid slice.
///
/// Cloning shares the underlying allocation and its window; releasing the last clone returns
/// the buffer to its pool (or drops it, if the pool is already at capacity).
#[derive(Clone)]
pub struct PoolBuf {
	inner: Rc<Inner>,
}

impl PoolBuf {
	#[inline]
	pub fn len(&self) -> usize {
		let (start, end) = self.inner.window.get();
		end - start
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn borrow(&self) -> Ref<'_, [u8]> {
		let (start, end) = self.inner.window.get();
		Ref::map(self.inner.data.borrow(), |v| &v[start..end])
	}

	pub fn borrow_mut(&self) -> RefMut<'_, [u8]> {
		let (start, end) = self.inner.window.get();
		RefMut::map(self.inner.data.borrow_mut(), |v| &mut v[start..end])
	}

	/// Shrinks the valid slice to `len` bytes from the front, discarding the tail.
	pub fn truncate(&self, len: usize) {
		let (start, end) = self.inner.window.get();
		assert!(start + len <= end);
		self.inner.window.set((start, start + len));
	}

	/// Narrows the valid slice to `[start + from, start + from + len)`.
	pub fn slice(&self, from: usize, len: usize) {
		let (start, end) = self.inner.window.get();
		assert!(start + from + len <= end);
		self.inner.window.set((start + from, start + from + len));
	}
}
