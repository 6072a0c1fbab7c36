//! Builders for client-to-server frames. Every builder computes an exact upper bound for
//! the frame size, takes a pooled buffer of that size and writes straight into it, so the
//! buffer never reallocates on the hot path.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::proto::{ConnectOptions, HeaderMap, Subject};

/// Largest payload accepted on the publish side.
pub(crate) const MAX_OUTBOUND_PAYLOAD: usize = 10_000_000;

/// Decimal width of the largest length field we can emit.
const MAX_DECIMAL_WIDTH: usize = 20;

pub(crate) fn connect(pool: &BufferPool, options: &ConnectOptions) -> Result<BytesMut> {
	let json = serde_json::to_vec(options).map_err(|e| Error::Serialization(Box::new(e)))?;
	let size = "CONNECT ".len() + json.len() + 2;
	let mut buf = pool.get(size);
	buf.put_slice(b"CONNECT ");
	buf.put_slice(&json);
	buf.put_slice(b"\r\n");
	debug_assert!(buf.len() <= size);
	Ok(buf)
}

pub(crate) fn publish(
	pool: &BufferPool,
	subject: &Subject,
	reply_to: Option<&Subject>,
	payload: &[u8],
) -> Result<BytesMut> {
	check_payload(payload)?;
	let size = "PUB ".len()
		+ subject.len()
		+ 1 + reply_to.map_or(0, |r| r.len() + 1)
		+ MAX_DECIMAL_WIDTH
		+ 2 + payload.len()
		+ 2;
	let mut buf = pool.get(size);
	buf.put_slice(b"PUB ");
	buf.put_slice(subject.as_bytes());
	buf.put_u8(b' ');
	if let Some(reply) = reply_to {
		buf.put_slice(reply.as_bytes());
		buf.put_u8(b' ');
	}
	put_decimal(&mut buf, payload.len() as u64);
	buf.put_slice(b"\r\n");
	buf.put_slice(payload);
	buf.put_slice(b"\r\n");
	debug_assert!(buf.len() <= size);
	Ok(buf)
}

pub(crate) fn publish_with_headers(
	pool: &BufferPool,
	subject: &Subject,
	reply_to: Option<&Subject>,
	headers: &HeaderMap,
	payload: &[u8],
) -> Result<BytesMut> {
	check_payload(payload)?;
	headers.validate()?;
	let header_len = headers.encoded_len();
	let total_len = header_len + payload.len();
	let size = "HPUB ".len()
		+ subject.len()
		+ 1 + reply_to.map_or(0, |r| r.len() + 1)
		+ MAX_DECIMAL_WIDTH * 2
		+ 1 + 2 + total_len
		+ 2;
	let mut buf = pool.get(size);
	buf.put_slice(b"HPUB ");
	buf.put_slice(subject.as_bytes());
	buf.put_u8(b' ');
	if let Some(reply) = reply_to {
		buf.put_slice(reply.as_bytes());
		buf.put_u8(b' ');
	}
	put_decimal(&mut buf, header_len as u64);
	buf.put_u8(b' ');
	put_decimal(&mut buf, total_len as u64);
	buf.put_slice(b"\r\n");
	headers.encode_into(&mut buf);
	buf.put_slice(payload);
	buf.put_slice(b"\r\n");
	debug_assert!(buf.len() <= size);
	Ok(buf)
}

pub(crate) fn subscribe(
	pool: &BufferPool,
	subject: &Subject,
	queue_group: Option<&str>,
	sid: u64,
) -> Result<BytesMut> {
	if let Some(group) = queue_group
		&& !group.bytes().all(|c| (0x21..=0x7e).contains(&c))
	{
		return Err(Error::InvalidArgument("queue group"));
	}
	let size = "SUB ".len()
		+ subject.len()
		+ 1 + queue_group.map_or(0, |g| g.len() + 1)
		+ MAX_DECIMAL_WIDTH
		+ 2;
	let mut buf = pool.get(size);
	buf.put_slice(b"SUB ");
	buf.put_slice(subject.as_bytes());
	buf.put_u8(b' ');
	if let Some(group) = queue_group {
		buf.put_slice(group.as_bytes());
		buf.put_u8(b' ');
	}
	put_decimal(&mut buf, sid);
	buf.put_slice(b"\r\n");
	debug_assert!(buf.len() <= size);
	Ok(buf)
}

pub(crate) fn unsubscribe(pool: &BufferPool, sid: u64, max_msgs: Option<u64>) -> BytesMut {
	let size = "UNSUB ".len() + MAX_DECIMAL_WIDTH * 2 + 1 + 2;
	let mut buf = pool.get(size);
	buf.put_slice(b"UNSUB ");
	put_decimal(&mut buf, sid);
	if let Some(max) = max_msgs {
		buf.put_u8(b' ');
		put_decimal(&mut buf, max);
	}
	buf.put_slice(b"\r\n");
	debug_assert!(buf.len() <= size);
	buf
}

pub(crate) fn ping(pool: &BufferPool) -> BytesMut {
	let mut buf = pool.get(6);
	buf.put_slice(b"PING\r\n");
	buf
}

pub(crate) fn pong(pool: &BufferPool) -> BytesMut {
	let mut buf = pool.get(6);
	buf.put_slice(b"PONG\r\n");
	buf
}

fn check_payload(payload: &[u8]) -> Result<()> {
	if payload.len() > MAX_OUTBOUND_PAYLOAD {
		return Err(Error::InvalidArgument("payload exceeds maximum publish size"));
	}
	Ok(())
}

/// Minimum-width decimal, no leading zeros or padding.
fn put_decimal(buf: &mut BytesMut, value: u64) {
	let mut scratch = itoa::Buffer::new();
	buf.put_slice(scratch.format(value).as_bytes());
}
