//! Subscription registry: sid allocation and a copy-on-write snapshot of the live
//! subscription set. Writers serialize on a lock and publish a fresh map; the
//! per-message fan-out path only ever loads the current snapshot pointer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use natrix_core::prelude::*;
use tokio::sync::mpsc;

use crate::proto::{Message, Subject};

#[derive(Clone)]
pub(crate) struct SubscriptionEntry {
	pub subject: Subject,
	pub queue_group: Option<String>,
	pub inbox: mpsc::Sender<Message>,
}

pub(crate) struct Registry {
	snapshot: ArcSwap<HashMap<u64, SubscriptionEntry>>,
	write_lock: Mutex<()>,
	next_sid: AtomicU64,
}

impl Registry {
	pub(crate) fn new() -> Registry {
		Registry {
			snapshot: ArcSwap::from_pointee(HashMap::new()),
			write_lock: Mutex::new(()),
			next_sid: AtomicU64::new(1),
		}
	}

	/// Installs a new subscription and returns its sid and inbox reader. Sids are unique
	/// for the lifetime of the process and never reused.
	pub(crate) fn add(
		&self,
		subject: Subject,
		queue_group: Option<String>,
		capacity: usize,
	) -> (u64, mpsc::Receiver<Message>) {
		let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
		let (inbox, reader) = mpsc::channel(capacity.max(1));
		let entry = SubscriptionEntry {
			subject,
			queue_group,
			inbox,
		};
		let _write = self.write_lock.lock().expect("registry lock poisoned");
		let mut next = HashMap::clone(&self.snapshot.load());
		next.insert(sid, entry);
		self.snapshot.store(Arc::new(next));
		(sid, reader)
	}

	/// Removes a subscription. In-flight messages already in its inbox remain drainable
	/// by the reader.
	pub(crate) fn remove(&self, sid: u64) -> bool {
		let _write = self.write_lock.lock().expect("registry lock poisoned");
		let mut next = HashMap::clone(&self.snapshot.load());
		let found = next.remove(&sid).is_some();
		if found {
			self.snapshot.store(Arc::new(next));
		}
		found
	}

	/// Drops every subscription, closing all inboxes.
	pub(crate) fn clear(&self) {
		let _write = self.write_lock.lock().expect("registry lock poisoned");
		self.snapshot.store(Arc::new(HashMap::new()));
	}

	/// Lock-free view of the current subscription set.
	pub(crate) fn snapshot(&self) -> Arc<HashMap<u64, SubscriptionEntry>> {
		self.snapshot.load_full()
	}
}
