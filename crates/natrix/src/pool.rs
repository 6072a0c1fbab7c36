//! Pool of reusable outbound byte buffers, bucketed by power-of-two capacity.

use bytes::BytesMut;
use natrix_core::prelude::*;

const MIN_CLASS: usize = 512;
const MAX_CLASS: usize = 1 << 20;
const CLASS_COUNT: usize = (MAX_CLASS / MIN_CLASS).trailing_zeros() as usize + 1;

/// Buffers retained per size class. Beyond this, released buffers are dropped instead of
/// pooled, bounding idle memory.
const MAX_POOLED_PER_CLASS: usize = 64;

/// Lends contiguous writable buffers of at least the requested size and reclaims them
/// after use. Buffers larger than the biggest size class are allocated directly and not
/// retained on release.
pub struct BufferPool {
	classes: [Mutex<Vec<BytesMut>>; CLASS_COUNT],
}

impl BufferPool {
	pub fn new() -> BufferPool {
		BufferPool {
			classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
		}
	}

	/// Returns an empty buffer with capacity of at least `size_hint`.
	pub fn get(&self, size_hint: usize) -> BytesMut {
		let Some(class) = class_for(size_hint) else {
			return BytesMut::with_capacity(size_hint);
		};
		let mut shelf = self.classes[class].lock().expect("pool lock poisoned");
		match shelf.pop() {
			Some(mut buf) => {
				buf.clear();
				buf
			},
			None => BytesMut::with_capacity(class_capacity(class)),
		}
	}

	/// Returns a buffer to the pool. Taking the buffer by value means a double release
	/// cannot compile; the debug assertion below additionally catches an aliased
	/// allocation sneaking back in through a clone.
	pub fn put(&self, buf: BytesMut) {
		let Some(class) = class_of(buf.capacity()) else {
			return;
		};
		let mut shelf = self.classes[class].lock().expect("pool lock poisoned");
		debug_assert!(
			!shelf.iter().any(|b| b.as_ptr() == buf.as_ptr()),
			"buffer released twice"
		);
		if shelf.len() < MAX_POOLED_PER_CLASS {
			shelf.push(buf);
		}
	}
}

impl Default for BufferPool {
	fn default() -> Self {
		Self::new()
	}
}

/// Smallest class able to hold `size` bytes.
fn class_for(size: usize) -> Option<usize> {
	if size > MAX_CLASS {
		return None;
	}
	let capacity = size.max(MIN_CLASS).next_power_of_two();
	Some((capacity / MIN_CLASS).trailing_zeros() as usize)
}

/// The class a released buffer belongs to, if its capacity is exactly a class size.
fn class_of(capacity: usize) -> Option<usize> {
	if !(MIN_CLASS..=MAX_CLASS).contains(&capacity) || !capacity.is_power_of_two() {
		return None;
	}
	Some((capacity / MIN_CLASS).trailing_zeros() as usize)
}

fn class_capacity(class: usize) -> usize {
	MIN_CLASS << class
}
