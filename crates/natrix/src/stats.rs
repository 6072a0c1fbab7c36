//! Connection counters, updated with atomic adds and readable without locks.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic totals plus the current depth of the two internal queues.
///
/// Obtained from [`crate::Client::stats`]; all readers see a live view.
#[derive(Debug, Default)]
pub struct ClientStats {
	transmitted_bytes: AtomicU64,
	received_bytes: AtomicU64,
	transmitted_messages: AtomicU64,
	received_messages: AtomicU64,
	sender_queue_bytes: AtomicU64,
	receiver_queue_bytes: AtomicU64,
}

impl ClientStats {
	/// Bytes handed to the socket, counted per frame.
	pub fn total_transmitted_bytes(&self) -> u64 {
		self.transmitted_bytes.load(Ordering::Relaxed)
	}

	pub fn total_received_bytes(&self) -> u64 {
		self.received_bytes.load(Ordering::Relaxed)
	}

	/// Messages published by this client.
	pub fn total_transmitted_messages(&self) -> u64 {
		self.transmitted_messages.load(Ordering::Relaxed)
	}

	/// MSG/HMSG frames dispatched to subscriptions.
	pub fn total_received_messages(&self) -> u64 {
		self.received_messages.load(Ordering::Relaxed)
	}

	/// Bytes currently queued ahead of the socket writer.
	pub fn sender_queue_bytes(&self) -> u64 {
		self.sender_queue_bytes.load(Ordering::Relaxed)
	}

	/// Bytes read off the socket but not yet parsed.
	pub fn receiver_queue_bytes(&self) -> u64 {
		self.receiver_queue_bytes.load(Ordering::Relaxed)
	}

	pub(crate) fn record_transmitted_bytes(&self, n: usize) {
		self.transmitted_bytes.fetch_add(n as u64, Ordering::Relaxed);
	}

	pub(crate) fn record_received_bytes(&self, n: usize) {
		self.received_bytes.fetch_add(n as u64, Ordering::Relaxed);
	}

	pub(crate) fn record_transmitted_message(&self) {
		self.transmitted_messages.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_received_message(&self) {
		self.received_messages.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn add_sender_queue(&self, n: usize) {
		self.sender_queue_bytes.fetch_add(n as u64, Ordering::Relaxed);
	}

	pub(crate) fn sub_sender_queue(&self, n: usize) {
		self.sender_queue_bytes.fetch_sub(n as u64, Ordering::Relaxed);
	}

	pub(crate) fn add_receiver_queue(&self, n: usize) {
		self.receiver_queue_bytes.fetch_add(n as u64, Ordering::Relaxed);
	}

	pub(crate) fn sub_receiver_queue(&self, n: usize) {
		self.receiver_queue_bytes.fetch_sub(n as u64, Ordering::Relaxed);
	}
}
