//! Socket reader: moves raw bytes into the dispatcher's pipe. No parsing happens here;
//! the bounded pipe is what back-pressures the socket when the dispatcher lags.

use natrix_core::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::stats::ClientStats;

pub(crate) const READ_CHUNK: usize = 64 * 1024;

/// Number of pipe slots that keeps roughly `high_water` bytes in flight.
pub(crate) fn pipe_depth(high_water: usize) -> usize {
	(high_water / READ_CHUNK).max(1)
}

pub(crate) async fn run<R: AsyncRead + Unpin>(
	mut socket: R,
	pipe: mpsc::Sender<Bytes>,
	stats: Arc<ClientStats>,
	cancel: CancellationToken,
) -> Result<()> {
	loop {
		let mut chunk = BytesMut::with_capacity(READ_CHUNK);
		let n = tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			res = socket.read_buf(&mut chunk) => res?,
		};
		if n == 0 {
			debug!("connection closed by server");
			return Ok(());
		}
		stats.record_received_bytes(n);
		stats.add_receiver_queue(n);
		if pipe.send(chunk.freeze()).await.is_err() {
			// Dispatcher is gone; the cycle is already ending.
			return Ok(());
		}
	}
}
