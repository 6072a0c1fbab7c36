//! Routes parsed frames: PING is answered, INFO updates connection state, MSG/HMSG fan
//! out to subscription inboxes, -ERR is surfaced on the event channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwapOption;
use natrix_core::prelude::*;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::Decoder as _;
use tokio_util::sync::CancellationToken;

use crate::client::ClientEvent;
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::proto::decode::WireDecoder;
use crate::proto::{HeaderMap, Message, ServerInfo, ServerOp, Subject, encode};
use crate::registry::Registry;
use crate::stats::ClientStats;

pub(crate) struct Dispatcher {
	registry: Arc<Registry>,
	server_info: Arc<ArcSwapOption<ServerInfo>>,
	events: broadcast::Sender<ClientEvent>,
	sender_tx: mpsc::Sender<BytesMut>,
	pool: Arc<BufferPool>,
	stats: Arc<ClientStats>,
	pongs: Arc<Mutex<VecDeque<oneshot::Sender<()>>>>,
	pings_outstanding: Arc<AtomicU32>,
	decoder: WireDecoder,
	buffer: BytesMut,
}

impl Dispatcher {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		registry: Arc<Registry>,
		server_info: Arc<ArcSwapOption<ServerInfo>>,
		events: broadcast::Sender<ClientEvent>,
		sender_tx: mpsc::Sender<BytesMut>,
		pool: Arc<BufferPool>,
		stats: Arc<ClientStats>,
		pongs: Arc<Mutex<VecDeque<oneshot::Sender<()>>>>,
		pings_outstanding: Arc<AtomicU32>,
		max_payload: usize,
	) -> Dispatcher {
		Dispatcher {
			registry,
			server_info,
			events,
			sender_tx,
			pool,
			stats,
			pongs,
			pings_outstanding,
			decoder: WireDecoder::new(max_payload),
			buffer: BytesMut::new(),
		}
	}

	pub(crate) async fn run(
		mut self,
		mut pipe: mpsc::Receiver<Bytes>,
		cancel: CancellationToken,
	) -> Result<()> {
		loop {
			while let Some(op) = self.decoder.decode(&mut self.buffer)? {
				self.dispatch(op).await?;
			}
			let chunk = tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				chunk = pipe.recv() => match chunk {
					Some(chunk) => chunk,
					None => return Ok(()),
				},
			};
			self.stats.sub_receiver_queue(chunk.len());
			self.buffer.extend_from_slice(&chunk);
		}
	}

	async fn dispatch(&mut self, op: ServerOp) -> Result<()> {
		match op {
			ServerOp::Ping => {
				let pong = encode::pong(&self.pool);
				self.stats.add_sender_queue(pong.len());
				if self.sender_tx.send(pong).await.is_err() {
					// Sender already stopped; the cycle is ending.
					trace!("dropping PONG, sender closed");
				}
			},
			ServerOp::Pong => {
				self.pings_outstanding.store(0, Ordering::Relaxed);
				let waiter = self.pongs.lock().expect("pong queue poisoned").pop_front();
				if let Some(waiter) = waiter {
					let _ = waiter.send(());
				}
			},
			ServerOp::Ok => {},
			ServerOp::Err(message) => {
				warn!(%message, "server reported error");
				let _ = self.events.send(ClientEvent::ServerError(message));
			},
			ServerOp::Info(json) => {
				let info: ServerInfo = serde_json::from_slice(&json)
					.map_err(|e| Error::protocol(format!("malformed INFO: {e}")))?;
				debug!(server = %info.server_id, version = %info.version, "received INFO");
				let info = Arc::new(info);
				self.server_info.store(Some(info.clone()));
				let _ = self.events.send(ClientEvent::ServerInfo(info));
			},
			ServerOp::Msg {
				subject,
				sid,
				reply_to,
				payload,
			} => {
				self.deliver(subject, sid, reply_to, None, payload).await?;
			},
			ServerOp::HMsg {
				subject,
				sid,
				reply_to,
				headers,
				payload,
			} => {
				let headers = HeaderMap::parse(&headers)?;
				self
					.deliver(subject, sid, reply_to, Some(headers), payload)
					.await?;
			},
		}
		Ok(())
	}

	async fn deliver(
		&self,
		subject: Bytes,
		sid: u64,
		reply_to: Option<Bytes>,
		headers: Option<HeaderMap>,
		payload: Bytes,
	) -> Result<()> {
		self.stats.record_received_message();
		let message = Message {
			subject: Subject::from_wire(subject)?,
			sid,
			reply_to: reply_to.map(Subject::from_wire).transpose()?,
			headers,
			payload,
		};
		// One snapshot per message: a subscription added mid-flight may or may not see it.
		let snapshot = self.registry.snapshot();
		let Some(entry) = snapshot.get(&sid) else {
			trace!(sid, "message for unknown sid");
			return Ok(());
		};
		match entry.inbox.try_send(message) {
			Ok(()) => {},
			Err(TrySendError::Full(message)) => {
				// Full inbox: wait for the consumer. This intentionally stalls the whole
				// read path so a slow subscriber slows the connection instead of dropping.
				if entry.inbox.send(message).await.is_err() {
					trace!(sid, "subscription closed while awaiting capacity");
				}
			},
			Err(TrySendError::Closed(_)) => {
				trace!(sid, "subscription closed");
			},
		}
		Ok(())
	}
}
