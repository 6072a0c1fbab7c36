//! The public client surface and the connection supervisor.
//!
//! A [`Client`] owns one supervised TCP connection. Each connected cycle runs three I/O
//! tasks (receiver, dispatcher, sender) under a shared cancel token; when any of them
//! ends, the supervisor cancels the rest, tears the cycle down and reconnects, replaying
//! the current subscription registry. Publishers, subscribers and requesters all talk to
//! the connection through bounded queues and never observe a reconnect directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwapOption;
use natrix_core::drain::{self, DrainWatcher};
use natrix_core::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{JsonCodec, PayloadCodec};
use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::proto::{HeaderMap, ServerInfo, Subject, encode};
use crate::receiver;
use crate::registry::Registry;
use crate::request::Requests;
use crate::sender::Sender;
use crate::stats::ClientStats;
use crate::subscription::Subscription;

const EVENT_CHANNEL_SIZE: usize = 64;
const CORRELATOR_INBOX_SIZE: usize = 1024;

/// Pings the server may leave unanswered before the cycle is declared dead.
const MAX_PINGS_OUTSTANDING: u32 = 2;

/// Connection lifecycle. Within one cycle the transitions are monotonic:
/// `Disconnected → Connecting → Connected → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
	Disconnected,
	Connecting,
	Connected,
}

/// Out-of-band connection events. Transport and protocol failures arrive here instead of
/// failing individual operations; the supervisor reconnects on its own.
#[derive(Debug, Clone)]
pub enum ClientEvent {
	ServerInfo(Arc<ServerInfo>),
	ServerError(String),
	Transport(String),
	Protocol(String),
	Deserialization(String),
}

/// An asynchronous NATS client.
///
/// Cheap to clone; all clones share the same connection. Construct with [`Client::new`]
/// (JSON payload codec) or [`Client::with_codec`], then call [`Client::connect`]. Must be
/// created inside a tokio runtime.
pub struct Client<C: PayloadCodec = JsonCodec> {
	shared: Arc<Shared>,
	codec: Arc<C>,
}

impl<C: PayloadCodec> Clone for Client<C> {
	fn clone(&self) -> Self {
		Client {
			shared: self.shared.clone(),
			codec: self.codec.clone(),
		}
	}
}

pub(crate) struct Shared {
	config: ClientConfig,
	pool: Arc<BufferPool>,
	stats: Arc<ClientStats>,
	registry: Arc<Registry>,
	requests: Arc<Requests>,
	sender_tx: mpsc::Sender<BytesMut>,
	status_tx: watch::Sender<ClientStatus>,
	events_tx: broadcast::Sender<ClientEvent>,
	server_info: Arc<ArcSwapOption<ServerInfo>>,
	pongs: Arc<Mutex<VecDeque<oneshot::Sender<()>>>>,
	lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
	disposed: bool,
	/// Present while a supervisor is running; the trigger stops it.
	supervisor: Option<drain::DrainTrigger>,
	/// The sender parks here between supervisor runs.
	sender: Option<Sender>,
	correlator: Option<JoinHandle<()>>,
}

impl Client<JsonCodec> {
	pub fn new(config: ClientConfig) -> Client<JsonCodec> {
		Client::with_codec(config, JsonCodec)
	}
}

impl<C: PayloadCodec> Client<C> {
	pub fn with_codec(config: ClientConfig, codec: C) -> Client<C> {
		let pool = Arc::new(BufferPool::new());
		let stats = Arc::new(ClientStats::default());
		let registry = Arc::new(Registry::new());
		let requests = Arc::new(Requests::new());
		let (sender_tx, sender_rx) = mpsc::channel(config.sender_queue_length.max(1));
		let (status_tx, _) = watch::channel(ClientStatus::Disconnected);
		let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

		// The request correlator reads from its own system subscription, registered up
		// front so resubscribe replays it like any other subscription.
		let (_sid, mut inbox) = registry.add(requests.wildcard(), None, CORRELATOR_INBOX_SIZE);
		let correlator = {
			let requests = requests.clone();
			tokio::spawn(async move {
				while let Some(message) = inbox.recv().await {
					requests.complete(message);
				}
			})
		};

		let sender = Sender::new(sender_rx, pool.clone(), stats.clone());
		let shared = Arc::new(Shared {
			config,
			pool,
			stats,
			registry,
			requests,
			sender_tx,
			status_tx,
			events_tx,
			server_info: Arc::new(ArcSwapOption::empty()),
			pongs: Arc::new(Mutex::new(VecDeque::new())),
			lifecycle: Mutex::new(Lifecycle {
				disposed: false,
				supervisor: None,
				sender: Some(sender),
				correlator: Some(correlator),
			}),
		});
		Client {
			shared,
			codec: Arc::new(codec),
		}
	}

	/// Starts the supervisor and waits for the first successful connection. The
	/// supervisor keeps retrying (and later reconnecting) until `disconnect` or
	/// `dispose`.
	pub async fn connect(&self) -> Result<()> {
		let (watcher, sender) = {
			let mut lifecycle = self.shared.lifecycle.lock().expect("lifecycle lock poisoned");
			if lifecycle.disposed {
				return Err(Error::Disposed);
			}
			if lifecycle.supervisor.is_some() {
				return Err(Error::AlreadyConnected);
			}
			let (trigger, watcher) = drain::new();
			lifecycle.supervisor = Some(trigger);
			let sender = lifecycle
				.sender
				.take()
				.expect("sender is parked whenever no supervisor is running");
			(watcher, sender)
		};
		let stopped = watcher.clone();
		tokio::spawn(supervise(self.shared.clone(), sender, watcher));

		let mut status = self.shared.status_tx.subscribe();
		tokio::select! {
			res = status.wait_for(|s| *s == ClientStatus::Connected) => {
				res.map(|_| ()).map_err(|_| Error::Disposed)
			},
			guard = stopped.wait_for_drain() => {
				// disconnect()/dispose() won the race before we ever connected.
				drop(guard);
				Err(Error::Cancelled)
			},
		}
	}

	/// Stops the supervisor and waits for the connection to tear down. The subscription
	/// registry is preserved; a later `connect` resubscribes everything.
	pub async fn disconnect(&self) -> Result<()> {
		let trigger = {
			let mut lifecycle = self.shared.lifecycle.lock().expect("lifecycle lock poisoned");
			if lifecycle.disposed {
				return Err(Error::Disposed);
			}
			lifecycle.supervisor.take()
		};
		if let Some(trigger) = trigger {
			trigger.start_drain_and_wait().await;
		}
		Ok(())
	}

	/// Permanently shuts the client down: disconnects, ends every subscription stream
	/// and the request correlator. All further operations return `Disposed`.
	pub async fn dispose(&self) {
		let (trigger, correlator) = {
			let mut lifecycle = self.shared.lifecycle.lock().expect("lifecycle lock poisoned");
			lifecycle.disposed = true;
			(lifecycle.supervisor.take(), lifecycle.correlator.take())
		};
		if let Some(trigger) = trigger {
			trigger.start_drain_and_wait().await;
		}
		self.shared.registry.clear();
		if let Some(correlator) = correlator {
			let _ = correlator.await;
		}
	}

	pub async fn publish(&self, subject: impl AsRef<str>, payload: &[u8]) -> Result<()> {
		let subject = Subject::new(subject.as_ref())?;
		self.shared.publish_message(subject, None, None, payload).await
	}

	/// Publish with an explicit reply-to subject, without going through the request
	/// correlator.
	pub async fn publish_with_reply(
		&self,
		subject: impl AsRef<str>,
		reply_to: impl AsRef<str>,
		payload: &[u8],
	) -> Result<()> {
		let subject = Subject::new(subject.as_ref())?;
		let reply_to = Subject::new(reply_to.as_ref())?;
		self
			.shared
			.publish_message(subject, Some(reply_to), None, payload)
			.await
	}

	pub async fn publish_with_headers(
		&self,
		subject: impl AsRef<str>,
		headers: &HeaderMap,
		payload: &[u8],
	) -> Result<()> {
		let subject = Subject::new(subject.as_ref())?;
		self
			.shared
			.publish_message(subject, None, Some(headers), payload)
			.await
	}

	/// Encodes `value` through the configured codec and publishes it.
	pub async fn publish_typed<T: Serialize>(
		&self,
		subject: impl AsRef<str>,
		value: &T,
	) -> Result<()> {
		let payload = self.codec.encode(value)?;
		self.publish(subject, &payload).await
	}

	pub async fn subscribe(&self, subject: impl AsRef<str>) -> Result<Subscription> {
		self.subscribe_inner(subject.as_ref(), None).await
	}

	/// Subscribes as part of a queue group: the server load-balances each message to one
	/// member of the group.
	pub async fn queue_subscribe(
		&self,
		subject: impl AsRef<str>,
		queue_group: impl Into<String>,
	) -> Result<Subscription> {
		self.subscribe_inner(subject.as_ref(), Some(queue_group.into())).await
	}

	async fn subscribe_inner(
		&self,
		subject: &str,
		queue_group: Option<String>,
	) -> Result<Subscription> {
		let shared = &self.shared;
		if shared.is_disposed() {
			return Err(Error::Disposed);
		}
		let subject = Subject::new(subject)?;
		let (sid, reader) = shared.registry.add(
			subject.clone(),
			queue_group.clone(),
			shared.config.receiver_queue_length,
		);
		// When connected, announce the subscription now. Otherwise installation alone is
		// enough: the next cycle's preamble replays the registry.
		if *shared.status_tx.borrow() == ClientStatus::Connected {
			let frame =
				encode::subscribe(&shared.pool, &subject, queue_group.as_deref(), sid)?;
			shared.send_frame(frame).await?;
		}
		Ok(Subscription::new(sid, subject, reader, shared.clone()))
	}

	/// Publishes `payload` on `subject` with a fresh reply inbox and awaits the response
	/// with the configured default timeout.
	pub async fn request(&self, subject: impl AsRef<str>, payload: &[u8]) -> Result<Bytes> {
		self
			.request_with_timeout(subject, payload, self.shared.config.request_timeout)
			.await
	}

	pub async fn request_with_timeout(
		&self,
		subject: impl AsRef<str>,
		payload: &[u8],
		timeout: Duration,
	) -> Result<Bytes> {
		let shared = &self.shared;
		if shared.is_disposed() {
			return Err(Error::Disposed);
		}
		let subject = Subject::new(subject.as_ref())?;
		let reply = shared.requests.next_reply_subject();
		let response = shared.requests.register(&reply);
		// The guard drops the slot on every exit but a delivered response, including
		// callers dropping this future.
		let mut slot = SlotGuard {
			requests: &shared.requests,
			reply: &reply,
			armed: true,
		};
		shared
			.publish_message(subject, Some(reply.clone()), None, payload)
			.await?;
		let message = match tokio::time::timeout(timeout, response).await {
			Err(_) => return Err(Error::RequestTimeout),
			Ok(Err(_)) => return Err(Error::Cancelled),
			Ok(Ok(message)) => message,
		};
		slot.armed = false;
		// The 503 status convention only exists on servers that advertise header
		// support; anything else carrying that shape is an ordinary reply.
		let headers_supported = self
			.shared
			.server_info
			.load()
			.as_deref()
			.is_some_and(|info| info.headers);
		if headers_supported && message.is_no_responders() {
			return Err(Error::NoResponders);
		}
		Ok(message.payload)
	}

	/// Typed request through the configured codec.
	pub async fn request_typed<T: Serialize, R: DeserializeOwned>(
		&self,
		subject: impl AsRef<str>,
		value: &T,
	) -> Result<R> {
		let payload = self.codec.encode(value)?;
		let response = self.request(subject, &payload).await?;
		match self.codec.decode(&response) {
			Ok(value) => Ok(value),
			Err(err) => {
				let _ = self
					.shared
					.events_tx
					.send(ClientEvent::Deserialization(err.to_string()));
				Err(err)
			},
		}
	}

	/// Round-trips a PING through the server, which forces everything queued ahead of it
	/// onto the wire.
	pub async fn flush(&self) -> Result<()> {
		let shared = &self.shared;
		if shared.is_disposed() {
			return Err(Error::Disposed);
		}
		let (tx, rx) = oneshot::channel();
		shared
			.pongs
			.lock()
			.expect("pong queue poisoned")
			.push_back(tx);
		let frame = encode::ping(&shared.pool);
		shared.send_frame(frame).await?;
		rx.await.map_err(|_| Error::Cancelled)
	}

	/// Watch the connection lifecycle. The receiver sees every transition.
	pub fn status(&self) -> watch::Receiver<ClientStatus> {
		self.shared.status_tx.subscribe()
	}

	pub fn current_status(&self) -> ClientStatus {
		*self.shared.status_tx.borrow()
	}

	/// Subscribe to out-of-band connection events (server errors, transport failures,
	/// INFO updates).
	pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
		self.shared.events_tx.subscribe()
	}

	/// The most recent INFO received from the server, replaced on every reconnect.
	pub fn server_info(&self) -> Option<Arc<ServerInfo>> {
		self.shared.server_info.load_full()
	}

	pub fn stats(&self) -> Arc<ClientStats> {
		self.shared.stats.clone()
	}
}

impl Shared {
	fn is_disposed(&self) -> bool {
		self.lifecycle.lock().expect("lifecycle lock poisoned").disposed
	}

	/// Reserves queue capacity first and only then builds the frame, so a caller
	/// cancelled while awaiting capacity never takes a buffer from the pool.
	async fn publish_message(
		&self,
		subject: Subject,
		reply_to: Option<Subject>,
		headers: Option<&HeaderMap>,
		payload: &[u8],
	) -> Result<()> {
		if self.is_disposed() {
			return Err(Error::Disposed);
		}
		let permit = self
			.sender_tx
			.reserve()
			.await
			.map_err(|_| Error::Disposed)?;
		let frame = match headers {
			None => encode::publish(&self.pool, &subject, reply_to.as_ref(), payload)?,
			Some(headers) => {
				encode::publish_with_headers(&self.pool, &subject, reply_to.as_ref(), headers, payload)?
			},
		};
		self.stats.add_sender_queue(frame.len());
		self.stats.record_transmitted_message();
		permit.send(frame);
		Ok(())
	}

	async fn send_frame(&self, frame: BytesMut) -> Result<()> {
		self.stats.add_sender_queue(frame.len());
		match self.sender_tx.send(frame).await {
			Ok(()) => Ok(()),
			Err(mpsc::error::SendError(frame)) => {
				self.stats.sub_sender_queue(frame.len());
				self.pool.put(frame);
				Err(Error::Disposed)
			},
		}
	}

	/// Removes the subscription and, when connected, enqueues the UNSUB without
	/// blocking. Called from `Subscription::drop`.
	pub(crate) fn lazy_unsubscribe(&self, sid: u64) {
		if !self.registry.remove(sid) {
			return;
		}
		self.enqueue_unsubscribe(sid, None);
	}

	pub(crate) fn enqueue_unsubscribe(&self, sid: u64, max_msgs: Option<u64>) {
		if *self.status_tx.borrow() != ClientStatus::Connected {
			return;
		}
		let frame = encode::unsubscribe(&self.pool, sid, max_msgs);
		self.stats.add_sender_queue(frame.len());
		match self.sender_tx.try_send(frame) {
			Ok(()) => {},
			Err(TrySendError::Full(frame)) | Err(TrySendError::Closed(frame)) => {
				// Best effort; the server-side subscription dies with the connection.
				self.stats.sub_sender_queue(frame.len());
				self.pool.put(frame);
			},
		}
	}
}

struct SlotGuard<'a> {
	requests: &'a Requests,
	reply: &'a Subject,
	armed: bool,
}

impl Drop for SlotGuard<'_> {
	fn drop(&mut self) {
		if self.armed {
			self.requests.forget(self.reply);
		}
	}
}

enum CycleEnd {
	Stop,
	PingTimeout,
	Sender(Option<Error>),
	Receiver(Option<Error>),
	Dispatcher(Option<Error>),
}

enum CycleOutcome {
	Stop,
	Retry,
}

async fn supervise(shared: Arc<Shared>, mut sender: Sender, drain: DrainWatcher) {
	let mut cycle = 0u64;
	loop {
		cycle += 1;
		let outcome = run_cycle(&shared, &mut sender, drain.clone())
			.instrument(tracing::info_span!("connection", cycle))
			.await;
		// Pong waiters belong to pings that died with the connection.
		shared.pongs.lock().expect("pong queue poisoned").clear();
		shared.status_tx.send_replace(ClientStatus::Disconnected);
		if matches!(outcome, CycleOutcome::Stop) {
			break;
		}
	}
	shared
		.lifecycle
		.lock()
		.expect("lifecycle lock poisoned")
		.sender = Some(sender);
	debug!("supervisor stopped");
	// The drain watcher drops here, releasing disconnect()/dispose().
}

async fn run_cycle(shared: &Arc<Shared>, sender: &mut Sender, drain: DrainWatcher) -> CycleOutcome {
	shared.status_tx.send_replace(ClientStatus::Connecting);
	let mut stop = std::pin::pin!(drain.wait_for_drain());

	let socket = tokio::select! {
		res = TcpStream::connect(&shared.config.server) => match res {
			Ok(socket) => socket,
			Err(err) => {
				warn!(server = %shared.config.server, error = %err, "connect failed");
				let _ = shared.events_tx.send(ClientEvent::Transport(err.to_string()));
				tokio::select! {
					_ = tokio::time::sleep(shared.config.reconnect_delay) => return CycleOutcome::Retry,
					guard = &mut stop => {
						drop(guard);
						return CycleOutcome::Stop;
					},
				}
			},
		},
		guard = &mut stop => {
			drop(guard);
			return CycleOutcome::Stop;
		},
	};
	if let Err(err) = socket.set_nodelay(true) {
		warn!(error = %err, "failed to disable nagle");
	}
	let (read_half, write_half) = socket.into_split();

	let preamble = match build_preamble(shared) {
		Ok(preamble) => preamble,
		Err(err) => {
			error!(error = %err, "failed to build connection preamble");
			return CycleOutcome::Stop;
		},
	};

	let cancel = CancellationToken::new();
	let (pipe_tx, pipe_rx) = mpsc::channel(receiver::pipe_depth(
		shared.config.read_pipe_high_water_bytes,
	));
	let pings_outstanding = Arc::new(AtomicU32::new(0));

	let mut recv_join = tokio::spawn(receiver::run(
		read_half,
		pipe_tx,
		shared.stats.clone(),
		cancel.clone(),
	));
	let dispatcher = Dispatcher::new(
		shared.registry.clone(),
		shared.server_info.clone(),
		shared.events_tx.clone(),
		shared.sender_tx.clone(),
		shared.pool.clone(),
		shared.stats.clone(),
		shared.pongs.clone(),
		pings_outstanding.clone(),
		shared.config.max_inbound_payload_bytes,
	);
	let mut disp_join = tokio::spawn(dispatcher.run(pipe_rx, cancel.clone()));
	let mut send_fut = std::pin::pin!(sender.run(write_half, preamble, cancel.clone()));

	shared.status_tx.send_replace(ClientStatus::Connected);
	info!(server = %shared.config.server, "connected");

	let mut ping_timer = tokio::time::interval_at(
		tokio::time::Instant::now() + shared.config.ping_interval,
		shared.config.ping_interval,
	);
	ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	let end = loop {
		tokio::select! {
			guard = &mut stop => {
				drop(guard);
				break CycleEnd::Stop;
			},
			res = &mut send_fut => break CycleEnd::Sender(res.err()),
			res = &mut recv_join => break CycleEnd::Receiver(flatten_join(res)),
			res = &mut disp_join => break CycleEnd::Dispatcher(flatten_join(res)),
			_ = ping_timer.tick() => {
				let outstanding = pings_outstanding.fetch_add(1, Ordering::Relaxed);
				if outstanding >= MAX_PINGS_OUTSTANDING {
					break CycleEnd::PingTimeout;
				}
				let frame = encode::ping(&shared.pool);
				shared.stats.add_sender_queue(frame.len());
				match shared.sender_tx.try_send(frame) {
					Ok(()) => {
						// Keep PONGs paired with PINGs in FIFO order: park a waiter nobody
						// listens to, so flush() waiters map to their own ping.
						let (tx, _rx) = oneshot::channel();
						shared.pongs.lock().expect("pong queue poisoned").push_back(tx);
					},
					Err(TrySendError::Full(frame)) | Err(TrySendError::Closed(frame)) => {
						shared.stats.sub_sender_queue(frame.len());
						shared.pool.put(frame);
					},
				}
			},
		}
	};

	cancel.cancel();
	let (stopping, failure) = match end {
		CycleEnd::Stop => {
			let _ = send_fut.await;
			let _ = recv_join.await;
			let _ = disp_join.await;
			(true, None)
		},
		CycleEnd::PingTimeout => {
			let _ = send_fut.await;
			let _ = recv_join.await;
			let _ = disp_join.await;
			(
				false,
				Some(Error::Transport(std::io::Error::new(
					std::io::ErrorKind::TimedOut,
					"server stopped answering pings",
				))),
			)
		},
		CycleEnd::Sender(err) => {
			let _ = recv_join.await;
			let _ = disp_join.await;
			(false, err)
		},
		CycleEnd::Receiver(err) => {
			let _ = send_fut.await;
			let _ = disp_join.await;
			(false, err)
		},
		CycleEnd::Dispatcher(err) => {
			let _ = send_fut.await;
			let _ = recv_join.await;
			(false, err)
		},
	};

	if let Some(err) = failure {
		warn!(error = %err, "connection cycle failed");
		let event = match &err {
			Error::ProtocolViolation(msg) => ClientEvent::Protocol(msg.clone()),
			other => ClientEvent::Transport(other.to_string()),
		};
		let _ = shared.events_tx.send(event);
	} else if !stopping {
		debug!("connection closed, reconnecting");
	}
	if stopping {
		CycleOutcome::Stop
	} else {
		CycleOutcome::Retry
	}
}

/// CONNECT followed by one SUB per registered subscription, in sid order.
fn build_preamble(shared: &Shared) -> Result<Vec<BytesMut>> {
	let mut frames = Vec::new();
	frames.push(encode::connect(
		&shared.pool,
		&shared.config.connect_options(),
	)?);
	let snapshot = shared.registry.snapshot();
	let mut subscriptions: Vec<_> = snapshot.iter().collect();
	subscriptions.sort_by_key(|(sid, _)| **sid);
	for (sid, entry) in subscriptions {
		frames.push(encode::subscribe(
			&shared.pool,
			&entry.subject,
			entry.queue_group.as_deref(),
			*sid,
		)?);
	}
	for frame in &frames {
		shared.stats.add_sender_queue(frame.len());
	}
	Ok(frames)
}

fn flatten_join(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Option<Error> {
	match res {
		Ok(Ok(())) => None,
		Ok(Err(err)) => Some(err),
		Err(join_err) => Some(Error::Transport(std::io::Error::other(join_err))),
	}
}
