//! Incremental parser for the server-to-client protocol.
//!
//! The parser is a [`tokio_util::codec::Decoder`] over an accumulation buffer: the
//! dispatcher appends raw socket chunks and pulls complete [`ServerOp`]s out, so frames
//! split at arbitrary byte boundaries reassemble transparently. Subject, reply and
//! payload fields are `Bytes` slices of the consumed region and never copied.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::Error;
use crate::proto::ServerOp;

/// Control lines (including INFO bodies) beyond this size fail the connection.
const MAX_CONTROL_LINE: usize = 1024 * 1024;

pub(crate) struct WireDecoder {
	state: State,
	max_payload: usize,
	// How far the buffer has been scanned for a line terminator, so repeated calls over
	// a growing buffer stay linear.
	line_scan: usize,
}

enum State {
	Line,
	Payload(Pending),
}

struct Pending {
	subject: Bytes,
	sid: u64,
	reply_to: Option<Bytes>,
	header_len: Option<usize>,
	total_len: usize,
}

enum LineOutcome {
	Op(ServerOp),
	Payload(Pending),
}

impl WireDecoder {
	pub(crate) fn new(max_payload: usize) -> WireDecoder {
		WireDecoder {
			state: State::Line,
			max_payload,
			line_scan: 0,
		}
	}

	fn parse_line(&self, line: Bytes) -> Result<LineOutcome, Error> {
		let mut args = Args::new(line);
		let Some(verb) = args.next() else {
			return Err(Error::protocol("empty control line"));
		};
		if verb.eq_ignore_ascii_case(b"MSG") {
			return self.parse_msg(args, false);
		}
		if verb.eq_ignore_ascii_case(b"HMSG") {
			return self.parse_msg(args, true);
		}
		if verb.eq_ignore_ascii_case(b"INFO") {
			let json = args.rest();
			if json.is_empty() {
				return Err(Error::protocol("INFO without payload"));
			}
			return Ok(LineOutcome::Op(ServerOp::Info(json)));
		}
		if verb.eq_ignore_ascii_case(b"PING") {
			return Ok(LineOutcome::Op(ServerOp::Ping));
		}
		if verb.eq_ignore_ascii_case(b"PONG") {
			return Ok(LineOutcome::Op(ServerOp::Pong));
		}
		if verb.eq_ignore_ascii_case(b"+OK") {
			return Ok(LineOutcome::Op(ServerOp::Ok));
		}
		if verb.eq_ignore_ascii_case(b"-ERR") {
			let msg = args.rest();
			let msg = String::from_utf8_lossy(strip_quotes(&msg)).into_owned();
			return Ok(LineOutcome::Op(ServerOp::Err(msg)));
		}
		Err(Error::protocol(format!(
			"unknown protocol verb {:?}",
			String::from_utf8_lossy(&verb)
		)))
	}

	fn parse_msg(&self, mut args: Args, headered: bool) -> Result<LineOutcome, Error> {
		let subject = args
			.next()
			.ok_or_else(|| Error::protocol("message without subject"))?;
		let sid = parse_decimal(
			&args
				.next()
				.ok_or_else(|| Error::protocol("message without sid"))?,
		)?;
		// Remaining fields are [reply-to] (header-len) total-len, reply optional.
		let mut fields = [args.next(), args.next(), args.next()];
		if args.next().is_some() {
			return Err(Error::protocol("too many message arguments"));
		}
		let expected = if headered { 2 } else { 1 };
		let present = fields.iter().take_while(|f| f.is_some()).count();
		if present < expected || present > expected + 1 {
			return Err(Error::protocol("malformed message arguments"));
		}
		let reply_to = if present == expected + 1 {
			fields[0].take()
		} else {
			None
		};
		let start = if reply_to.is_some() { 1 } else { 0 };
		let (header_len, total_len) = if headered {
			let header_len = parse_decimal(
				fields[start]
					.as_ref()
					.ok_or_else(|| Error::protocol("HMSG without header length"))?,
			)? as usize;
			let total_len = parse_decimal(
				fields[start + 1]
					.as_ref()
					.ok_or_else(|| Error::protocol("HMSG without total length"))?,
			)? as usize;
			if header_len > total_len {
				return Err(Error::protocol("header length exceeds total length"));
			}
			(Some(header_len), total_len)
		} else {
			let total_len = parse_decimal(
				fields[start]
					.as_ref()
					.ok_or_else(|| Error::protocol("MSG without payload length"))?,
			)? as usize;
			(None, total_len)
		};
		if total_len > self.max_payload {
			return Err(Error::protocol(format!(
				"payload of {total_len} bytes exceeds maximum of {}",
				self.max_payload
			)));
		}
		Ok(LineOutcome::Payload(Pending {
			subject,
			sid,
			reply_to,
			header_len,
			total_len,
		}))
	}
}

impl Decoder for WireDecoder {
	type Item = ServerOp;
	type Error = Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>, Error> {
		loop {
			match &self.state {
				State::Line => {
					let Some(eol) = find_crlf(src, &mut self.line_scan) else {
						if src.len() > MAX_CONTROL_LINE {
							return Err(Error::protocol("control line too long"));
						}
						return Ok(None);
					};
					let line = src.split_to(eol + 2).freeze().slice(..eol);
					self.line_scan = 0;
					match self.parse_line(line)? {
						LineOutcome::Op(op) => return Ok(Some(op)),
						LineOutcome::Payload(pending) => {
							self.state = State::Payload(pending);
						},
					}
				},
				State::Payload(pending) => {
					if src.len() < pending.total_len + 2 {
						return Ok(None);
					}
					let State::Payload(pending) = std::mem::replace(&mut self.state, State::Line)
					else {
						unreachable!()
					};
					let mut block = src.split_to(pending.total_len).freeze();
					let terminator = src.split_to(2);
					if &terminator[..] != b"\r\n" {
						return Err(Error::protocol("missing CRLF after payload"));
					}
					let op = match pending.header_len {
						Some(header_len) => {
							let headers = block.split_to(header_len);
							ServerOp::HMsg {
								subject: pending.subject,
								sid: pending.sid,
								reply_to: pending.reply_to,
								headers,
								payload: block,
							}
						},
						None => ServerOp::Msg {
							subject: pending.subject,
							sid: pending.sid,
							reply_to: pending.reply_to,
							payload: block,
						},
					};
					return Ok(Some(op));
				},
			}
		}
	}
}

/// Locates the next CRLF, remembering how far it has looked so partial feeds do not
/// rescan from the start.
fn find_crlf(src: &BytesMut, scanned: &mut usize) -> Option<usize> {
	// Step back one byte in case the buffer previously ended mid-terminator.
	let start = scanned.saturating_sub(1);
	match src[start..].windows(2).position(|w| w == b"\r\n") {
		Some(pos) => Some(start + pos),
		None => {
			*scanned = src.len();
			None
		},
	}
}

fn parse_decimal(field: &Bytes) -> Result<u64, Error> {
	if field.is_empty() {
		return Err(Error::protocol("empty numeric field"));
	}
	let mut value: u64 = 0;
	for &c in field.iter() {
		if !c.is_ascii_digit() {
			return Err(Error::protocol("malformed numeric field"));
		}
		value = value
			.checked_mul(10)
			.and_then(|v| v.checked_add(u64::from(c - b'0')))
			.ok_or_else(|| Error::protocol("numeric field overflow"))?;
	}
	Ok(value)
}

fn strip_quotes(msg: &Bytes) -> &[u8] {
	let msg = &msg[..];
	msg
		.strip_prefix(b"'")
		.and_then(|m| m.strip_suffix(b"'"))
		.unwrap_or(msg)
}

/// Whitespace-separated tokens of a control line, yielded as zero-copy slices.
struct Args {
	line: Bytes,
	pos: usize,
}

impl Args {
	fn new(line: Bytes) -> Args {
		Args { line, pos: 0 }
	}

	fn next(&mut self) -> Option<Bytes> {
		while self.pos < self.line.len() && is_sep(self.line[self.pos]) {
			self.pos += 1;
		}
		if self.pos == self.line.len() {
			return None;
		}
		let start = self.pos;
		while self.pos < self.line.len() && !is_sep(self.line[self.pos]) {
			self.pos += 1;
		}
		Some(self.line.slice(start..self.pos))
	}

	/// Everything after the current position, leading separators trimmed.
	fn rest(&self) -> Bytes {
		let mut start = self.pos;
		while start < self.line.len() && is_sep(self.line[start]) {
			start += 1;
		}
		self.line.slice(start..)
	}
}

fn is_sep(c: u8) -> bool {
	c == b' ' || c == b'\t'
}

#[cfg(test)]
#[path = "decode_tests.rs"]
mod decode_tests;
