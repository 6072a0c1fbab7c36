//! Socket writer: drains the bounded outbound queue and coalesces bursts of small frames
//! into single writes.

use natrix_core::prelude::*;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::pool::BufferPool;
use crate::stats::ClientStats;

const SCRATCH_SIZE: usize = 1024 * 1024;

/// Owns the receiving end of the outbound queue. The queue outlives individual
/// connections: frames accepted while disconnected are written by the next cycle.
pub(crate) struct Sender {
	rx: mpsc::Receiver<BytesMut>,
	pool: Arc<BufferPool>,
	stats: Arc<ClientStats>,
	scratch: BytesMut,
}

impl Sender {
	pub(crate) fn new(
		rx: mpsc::Receiver<BytesMut>,
		pool: Arc<BufferPool>,
		stats: Arc<ClientStats>,
	) -> Sender {
		Sender::with_scratch_capacity(rx, pool, stats, SCRATCH_SIZE)
	}

	fn with_scratch_capacity(
		rx: mpsc::Receiver<BytesMut>,
		pool: Arc<BufferPool>,
		stats: Arc<ClientStats>,
		capacity: usize,
	) -> Sender {
		Sender {
			rx,
			pool,
			stats,
			scratch: BytesMut::with_capacity(capacity),
		}
	}

	/// Runs one connection cycle: writes the preamble, then drains the queue until the
	/// socket fails, the queue closes, or the cycle is cancelled.
	pub(crate) async fn run<W: AsyncWrite + Unpin>(
		&mut self,
		mut socket: W,
		preamble: Vec<BytesMut>,
		cancel: CancellationToken,
	) -> Result<()> {
		self.scratch.clear();
		for frame in preamble {
			self.consume(&mut socket, frame).await?;
		}
		self.flush_scratch(&mut socket).await?;
		socket.flush().await?;

		loop {
			let first = tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				frame = self.rx.recv() => match frame {
					Some(frame) => frame,
					None => return Ok(()),
				},
			};
			self.consume(&mut socket, first).await?;
			// Greedily take whatever else is already queued so the burst leaves in as few
			// writes as possible.
			while let Ok(frame) = self.rx.try_recv() {
				self.consume(&mut socket, frame).await?;
			}
			self.flush_scratch(&mut socket).await?;
			socket.flush().await?;
		}
	}

	/// Copies the frame into the scratch buffer, or writes it directly when it cannot
	/// fit, then releases it back to the pool. Frames never leave out of order and are
	/// never split across the scratch boundary.
	async fn consume<W: AsyncWrite + Unpin>(&mut self, socket: &mut W, frame: BytesMut) -> Result<()> {
		if frame.len() > self.scratch.capacity() - self.scratch.len() {
			self.flush_scratch(socket).await?;
		}
		if frame.len() <= self.scratch.capacity() {
			self.scratch.extend_from_slice(&frame);
		} else {
			socket.write_all(&frame).await?;
		}
		self.stats.record_transmitted_bytes(frame.len());
		self.stats.sub_sender_queue(frame.len());
		self.pool.put(frame);
		Ok(())
	}

	async fn flush_scratch<W: AsyncWrite + Unpin>(&mut self, socket: &mut W) -> Result<()> {
		if !self.scratch.is_empty() {
			socket.write_all(&self.scratch).await?;
			self.scratch.clear();
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use tokio::io::AsyncReadExt;

	use super::*;

	fn frame(pool: &BufferPool, bytes: &[u8]) -> BytesMut {
		let mut buf = pool.get(bytes.len());
		buf.extend_from_slice(bytes);
		buf
	}

	async fn run_to_completion(
		mut sender: Sender,
		frames: Vec<BytesMut>,
		tx: mpsc::Sender<BytesMut>,
	) -> Vec<u8> {
		let (socket, mut peer) = tokio::io::duplex(1 << 20);
		for f in frames {
			tx.send(f).await.unwrap();
		}
		drop(tx);
		sender
			.run(socket, Vec::new(), CancellationToken::new())
			.await
			.unwrap();
		drop(sender);
		let mut written = Vec::new();
		peer.read_to_end(&mut written).await.unwrap();
		written
	}

	#[tokio::test]
	async fn preserves_fifo_order() {
		let pool = Arc::new(BufferPool::new());
		let stats = Arc::new(ClientStats::default());
		let (tx, rx) = mpsc::channel(16);
		let sender = Sender::new(rx, pool.clone(), stats.clone());
		let frames = vec![
			frame(&pool, b"PING\r\n"),
			frame(&pool, b"PUB a 1\r\nx\r\n"),
			frame(&pool, b"PUB b 2\r\nyy\r\n"),
		];
		let written = run_to_completion(sender, frames, tx).await;
		assert_eq!(&written[..], b"PING\r\nPUB a 1\r\nx\r\nPUB b 2\r\nyy\r\n");
		assert_eq!(stats.total_transmitted_bytes(), written.len() as u64);
		assert_eq!(stats.sender_queue_bytes(), 0);
	}

	#[tokio::test]
	async fn oversize_frames_bypass_scratch_in_order() {
		let pool = Arc::new(BufferPool::new());
		let stats = Arc::new(ClientStats::default());
		let (tx, rx) = mpsc::channel(16);
		let sender = Sender::with_scratch_capacity(rx, pool.clone(), stats.clone(), 8);
		let big = vec![b'B'; 32];
		let frames = vec![
			frame(&pool, b"aa"),
			frame(&pool, &big),
			frame(&pool, b"zz"),
		];
		let written = run_to_completion(sender, frames, tx).await;
		let mut expected = b"aa".to_vec();
		expected.extend_from_slice(&big);
		expected.extend_from_slice(b"zz");
		assert_eq!(written, expected);
		assert_eq!(stats.total_transmitted_bytes(), written.len() as u64);
	}

	#[tokio::test]
	async fn writes_preamble_before_queue() {
		let pool = Arc::new(BufferPool::new());
		let stats = Arc::new(ClientStats::default());
		let (tx, rx) = mpsc::channel(16);
		let mut sender = Sender::new(rx, pool.clone(), stats.clone());
		let (socket, mut peer) = tokio::io::duplex(1 << 20);
		tx.send(frame(&pool, b"queued\r\n")).await.unwrap();
		drop(tx);
		sender
			.run(
				socket,
				vec![frame(&pool, b"CONNECT {}\r\n"), frame(&pool, b"SUB t 1\r\n")],
				CancellationToken::new(),
			)
			.await
			.unwrap();
		drop(sender);
		let mut written = Vec::new();
		peer.read_to_end(&mut written).await.unwrap();
		assert_eq!(&written[..], b"CONNECT {}\r\nSUB t 1\r\nqueued\r\n");
	}
}
