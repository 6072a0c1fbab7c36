//! Consumer-facing subscription handle: an async stream over the subscription's bounded
//! inbox. The handle holds only its sid and the inbox reader; dropping it removes the
//! registration and lazily enqueues an UNSUB.

use futures_core::Stream;
use natrix_core::prelude::*;
use tokio::sync::mpsc;

use crate::client::Shared;
use crate::proto::{Message, Subject};

pub struct Subscription {
	sid: u64,
	subject: Subject,
	reader: mpsc::Receiver<Message>,
	shared: Arc<Shared>,
}

impl Subscription {
	pub(crate) fn new(
		sid: u64,
		subject: Subject,
		reader: mpsc::Receiver<Message>,
		shared: Arc<Shared>,
	) -> Subscription {
		Subscription {
			sid,
			subject,
			reader,
			shared,
		}
	}

	pub fn sid(&self) -> u64 {
		self.sid
	}

	pub fn subject(&self) -> &Subject {
		&self.subject
	}

	/// Receives the next message. Returns `None` once the subscription has ended, which
	/// only happens on unsubscribe or client dispose.
	pub async fn next(&mut self) -> Option<Message> {
		self.reader.recv().await
	}

	/// Asks the server to stop delivering after `max_msgs` more messages. The handle
	/// should be dropped once the limit has been consumed.
	pub fn unsubscribe_after(&self, max_msgs: u64) {
		self.shared.enqueue_unsubscribe(self.sid, Some(max_msgs));
	}

	/// Stops the subscription. Equivalent to dropping the handle.
	pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
	type Item = Message;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
		self.reader.poll_recv(cx)
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.shared.lazy_unsubscribe(self.sid);
	}
}

impl Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("sid", &self.sid)
			.field("subject", &self.subject)
			.finish_non_exhaustive()
	}
}
