//! Request/response correlation.
//!
//! One system-owned subscription on `_INBOX.<token>.>` feeds every pending request; reply
//! subjects are `<prefix>.<n>` with a process-unique counter, so a response completes its
//! slot with a single map lookup. A reply arriving after its slot was dropped (timeout or
//! cancellation) is discarded without side effects.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use natrix_core::prelude::*;
use tokio::sync::oneshot;

use crate::proto::{Message, Subject};

pub(crate) struct Requests {
	prefix: String,
	next_reply: AtomicU64,
	pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl Requests {
	pub(crate) fn new() -> Requests {
		let token: [u8; 12] = rand::random();
		let mut prefix = String::with_capacity("_INBOX.".len() + token.len() * 2);
		prefix.push_str("_INBOX.");
		for b in token {
			write!(&mut prefix, "{b:02x}").expect("writing to a string cannot fail");
		}
		Requests {
			prefix,
			next_reply: AtomicU64::new(1),
			pending: Mutex::new(HashMap::new()),
		}
	}

	/// The wildcard subject the correlator's subscription covers.
	pub(crate) fn wildcard(&self) -> Subject {
		Subject::new(format!("{}.>", self.prefix)).expect("inbox prefix is a valid subject")
	}

	/// A fresh reply subject, unique for the life of the process.
	pub(crate) fn next_reply_subject(&self) -> Subject {
		let n = self.next_reply.fetch_add(1, Ordering::Relaxed);
		Subject::new(format!("{}.{n}", self.prefix)).expect("inbox prefix is a valid subject")
	}

	pub(crate) fn register(&self, reply: &Subject) -> oneshot::Receiver<Message> {
		let (tx, rx) = oneshot::channel();
		self
			.pending
			.lock()
			.expect("request map poisoned")
			.insert(reply.as_str().to_string(), tx);
		rx
	}

	/// Drops the slot for a request that timed out or was cancelled.
	pub(crate) fn forget(&self, reply: &Subject) {
		self
			.pending
			.lock()
			.expect("request map poisoned")
			.remove(reply.as_str());
	}

	/// Completes the pending request addressed by `message.subject`, if it still exists.
	pub(crate) fn complete(&self, message: Message) {
		let slot = self
			.pending
			.lock()
			.expect("request map poisoned")
			.remove(message.subject.as_str());
		match slot {
			Some(tx) => {
				// The requester may have raced a timeout; either way the reply is theirs.
				let _ = tx.send(message);
			},
			None => trace!(subject = %message.subject, "dropping reply without a pending request"),
		}
	}

	#[cfg(test)]
	pub(crate) fn pending_len(&self) -> usize {
		self.pending.lock().unwrap().len()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn reply_message(subject: Subject, payload: &'static [u8]) -> Message {
		Message {
			subject,
			sid: 1,
			reply_to: None,
			headers: None,
			payload: Bytes::from_static(payload),
		}
	}

	#[test]
	fn reply_subjects_are_unique_under_prefix() {
		let requests = Requests::new();
		let a = requests.next_reply_subject();
		let b = requests.next_reply_subject();
		assert_ne!(a, b);
		let prefix = requests.wildcard();
		let prefix = prefix.as_str().strip_suffix(">").unwrap();
		assert!(a.as_str().starts_with(prefix));
		assert!(b.as_str().starts_with(prefix));
	}

	#[tokio::test]
	async fn completes_registered_request() {
		let requests = Requests::new();
		let reply = requests.next_reply_subject();
		let rx = requests.register(&reply);
		requests.complete(reply_message(reply, b"pong"));
		let msg = rx.await.unwrap();
		assert_eq!(&msg.payload[..], b"pong");
		assert_eq!(requests.pending_len(), 0);
	}

	#[tokio::test]
	async fn late_reply_is_silently_dropped() {
		let requests = Requests::new();
		let reply = requests.next_reply_subject();
		let rx = requests.register(&reply);
		requests.forget(&reply);
		drop(rx);
		// Must neither panic nor resurrect the slot.
		requests.complete(reply_message(reply, b"late"));
		assert_eq!(requests.pending_len(), 0);
	}

	#[test]
	fn distinct_clients_get_distinct_prefixes() {
		let a = Requests::new();
		let b = Requests::new();
		assert_ne!(a.wildcard(), b.wildcard());
	}
}
