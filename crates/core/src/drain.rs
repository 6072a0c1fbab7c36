use tokio::sync::{mpsc, watch};

/// Constructs a new pair for coordinated shutdown.
/// * DrainTrigger starts the shutdown sequence and waits for it to complete.
/// * DrainWatcher is held by anything that wants to delay completion. It can be cloned,
///   and the shutdown will not complete until all outstanding DrainWatchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(false);
	let (done_tx, done_rx) = mpsc::channel(1);
	(
		DrainTrigger { done_rx, signal_tx },
		DrainWatcher { done_tx, signal_rx },
	)
}

enum Never {}

/// Starts a shutdown and waits for all watchers to be released.
pub struct DrainTrigger {
	done_rx: mpsc::Receiver<Never>,
	signal_tx: watch::Sender<bool>,
}

impl DrainTrigger {
	/// Signals all watchers and waits until every one of them has been dropped.
	pub async fn start_drain_and_wait(mut self) {
		let _ = self.signal_tx.send(true);
		match self.done_rx.recv().await {
			None => {},
			Some(n) => match n {},
		}
	}
}

/// Watch for a shutdown signal. Dropping the watcher (or the guard obtained from
/// [`DrainWatcher::wait_for_drain`]) releases the trigger.
#[derive(Clone)]
pub struct DrainWatcher {
	done_tx: mpsc::Sender<Never>,
	signal_rx: watch::Receiver<bool>,
}

impl DrainWatcher {
	/// Resolves once a shutdown has been signaled. The returned guard holds the drain
	/// open and must be dropped once shutdown work has completed.
	pub async fn wait_for_drain(mut self) -> DrainGuard {
		// If the trigger was dropped without draining, there is nothing to wait for.
		let _ = self.signal_rx.wait_for(|signaled| *signaled).await;
		DrainGuard(self.done_tx)
	}
}

#[must_use = "dropping the guard is what releases the drain"]
pub struct DrainGuard(mpsc::Sender<Never>);

impl std::fmt::Debug for DrainTrigger {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DrainTrigger").finish_non_exhaustive()
	}
}

impl std::fmt::Debug for DrainWatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DrainWatcher").finish_non_exhaustive()
	}
}
