//! Wire-level types for the NATS client protocol: subjects, header blocks, the frames
//! exchanged with the server, and the CONNECT/INFO JSON bodies.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub(crate) mod decode;
pub(crate) mod encode;

pub(crate) const HEADER_VERSION: &[u8] = b"NATS/1.0";

/// Status code a responder-less request reply carries in its header block.
pub(crate) const STATUS_NO_RESPONDERS: u16 = 503;

/// A dot-separated ASCII topic string.
///
/// Subjects are validated on construction: non-empty, printable ASCII, no whitespace.
/// Cloning is cheap; the backing storage is shared.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Subject(Bytes);

fn valid_subject(b: &[u8]) -> bool {
	!b.is_empty() && b.iter().all(|c| (0x21..=0x7e).contains(c))
}

impl Subject {
	pub fn new(subject: impl Into<String>) -> Result<Subject> {
		let s: String = subject.into();
		if !valid_subject(s.as_bytes()) {
			return Err(Error::InvalidSubject);
		}
		Ok(Subject(Bytes::from(s)))
	}

	/// Wraps a slice of a received frame without copying.
	pub(crate) fn from_wire(b: Bytes) -> Result<Subject> {
		if !valid_subject(&b) {
			return Err(Error::protocol("invalid subject in frame"));
		}
		Ok(Subject(b))
	}

	pub fn as_str(&self) -> &str {
		std::str::from_utf8(&self.0).expect("subject bytes are validated ascii")
	}

	pub(crate) fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromStr for Subject {
	type Err = Error;

	fn from_str(s: &str) -> Result<Subject> {
		Subject::new(s)
	}
}

impl TryFrom<&str> for Subject {
	type Error = Error;

	fn try_from(s: &str) -> Result<Subject> {
		Subject::new(s)
	}
}

impl TryFrom<String> for Subject {
	type Error = Error;

	fn try_from(s: String) -> Result<Subject> {
		Subject::new(s)
	}
}

impl fmt::Display for Subject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl fmt::Debug for Subject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", self.as_str())
	}
}

impl AsRef<str> for Subject {
	fn as_ref(&self) -> &str {
		self.as_str()
	}
}

impl PartialEq<&str> for Subject {
	fn eq(&self, other: &&str) -> bool {
		self.as_str() == *other
	}
}

/// Header block carried by HPUB/HMSG frames.
///
/// Names may repeat; `get` returns the first value. Lookup is ASCII case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
	status: Option<u16>,
	entries: Vec<(String, String)>,
}

impl HeaderMap {
	pub fn new() -> HeaderMap {
		HeaderMap::default()
	}

	pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.entries.push((name.into(), value.into()));
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self
			.entries
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Inline status code (`NATS/1.0 503`), present on server-generated messages.
	pub fn status(&self) -> Option<u16> {
		self.status
	}

	pub(crate) fn validate(&self) -> Result<()> {
		for (name, value) in &self.entries {
			let name_ok = !name.is_empty()
				&& name
					.bytes()
					.all(|c| (0x21..=0x7e).contains(&c) && c != b':');
			if !name_ok {
				return Err(Error::InvalidArgument("header name"));
			}
			if value.bytes().any(|c| c == b'\r' || c == b'\n') {
				return Err(Error::InvalidArgument("header value"));
			}
		}
		Ok(())
	}

	/// On-wire size of the block, including the version line and the terminal blank line.
	pub(crate) fn encoded_len(&self) -> usize {
		let mut len = HEADER_VERSION.len() + 2;
		for (name, value) in &self.entries {
			len += name.len() + 2 + value.len() + 2;
		}
		len + 2
	}

	pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
		buf.put_slice(HEADER_VERSION);
		buf.put_slice(b"\r\n");
		for (name, value) in &self.entries {
			buf.put_slice(name.as_bytes());
			buf.put_slice(b": ");
			buf.put_slice(value.as_bytes());
			buf.put_slice(b"\r\n");
		}
		buf.put_slice(b"\r\n");
	}

	/// Parses a raw header block as sliced out of an HMSG frame.
	pub(crate) fn parse(raw: &[u8]) -> Result<HeaderMap> {
		let mut lines = raw.split(|&c| c == b'\n');
		let version = lines
			.next()
			.ok_or_else(|| Error::protocol("empty header block"))?;
		let version = strip_cr(version);
		if !version.starts_with(HEADER_VERSION) {
			return Err(Error::protocol("header block missing version line"));
		}
		let mut map = HeaderMap::new();
		let rest = &version[HEADER_VERSION.len()..];
		let mut words = rest.split(|c: &u8| c.is_ascii_whitespace()).filter(|w| !w.is_empty());
		if let Some(code) = words.next() {
			let code = std::str::from_utf8(code)
				.ok()
				.and_then(|c| c.parse::<u16>().ok())
				.ok_or_else(|| Error::protocol("malformed header status"))?;
			map.status = Some(code);
		}
		for line in lines {
			let line = strip_cr(line);
			if line.is_empty() {
				continue;
			}
			let colon = line
				.iter()
				.position(|&c| c == b':')
				.ok_or_else(|| Error::protocol("header line missing ':'"))?;
			let name = std::str::from_utf8(&line[..colon])
				.map_err(|_| Error::protocol("non-ascii header name"))?;
			let value = std::str::from_utf8(&line[colon + 1..])
				.map_err(|_| Error::protocol("non-ascii header value"))?;
			map.insert(name.trim(), value.trim());
		}
		Ok(map)
	}
}

fn strip_cr(line: &[u8]) -> &[u8] {
	line.strip_suffix(b"\r").unwrap_or(line)
}

/// One complete server-to-client frame as produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
	Info(Bytes),
	Msg {
		subject: Bytes,
		sid: u64,
		reply_to: Option<Bytes>,
		payload: Bytes,
	},
	HMsg {
		subject: Bytes,
		sid: u64,
		reply_to: Option<Bytes>,
		headers: Bytes,
		payload: Bytes,
	},
	Ping,
	Pong,
	Ok,
	Err(String),
}

/// A message delivered to a subscription. The payload is owned by the receiver; it stays
/// alive independently of the connection's internal buffers.
#[derive(Debug, Clone)]
pub struct Message {
	pub subject: Subject,
	pub sid: u64,
	pub reply_to: Option<Subject>,
	pub headers: Option<HeaderMap>,
	pub payload: Bytes,
}

impl Message {
	pub(crate) fn is_no_responders(&self) -> bool {
		self.payload.is_empty()
			&& self
				.headers
				.as_ref()
				.and_then(HeaderMap::status)
				.is_some_and(|s| s == STATUS_NO_RESPONDERS)
	}
}

/// The INFO payload sent by the server on connect and on cluster topology changes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
	pub server_id: String,
	pub server_name: String,
	pub version: String,
	pub proto: i32,
	pub host: String,
	pub port: u16,
	pub headers: bool,
	pub max_payload: usize,
	pub client_id: u64,
	pub auth_required: bool,
	pub tls_required: bool,
	pub connect_urls: Vec<String>,
	#[serde(rename = "ldm")]
	pub lame_duck_mode: bool,
	pub client_ip: String,
}

/// The CONNECT body announcing this client to the server.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOptions {
	pub verbose: bool,
	pub pedantic: bool,
	pub tls_required: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub auth_token: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pass: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub lang: String,
	pub version: String,
	pub protocol: i32,
	pub echo: bool,
	pub headers: bool,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn subject_validation() {
		assert!(Subject::new("foo.bar").is_ok());
		assert!(Subject::new("_INBOX.abc.>").is_ok());
		assert!(matches!(Subject::new(""), Err(Error::InvalidSubject)));
		assert!(matches!(Subject::new("has space"), Err(Error::InvalidSubject)));
		assert!(matches!(Subject::new("crlf\r\n"), Err(Error::InvalidSubject)));
	}

	#[test]
	fn header_roundtrip() {
		let mut h = HeaderMap::new();
		h.insert("A", "1");
		h.insert("B", "2");
		let mut buf = BytesMut::new();
		h.encode_into(&mut buf);
		assert_eq!(buf.len(), h.encoded_len());
		assert_eq!(&buf[..], b"NATS/1.0\r\nA: 1\r\nB: 2\r\n\r\n");

		let parsed = HeaderMap::parse(&buf).unwrap();
		assert_eq!(parsed.get("a"), Some("1"));
		assert_eq!(parsed.get("B"), Some("2"));
		assert_eq!(parsed.status(), None);
	}

	#[test]
	fn header_status_line() {
		let parsed = HeaderMap::parse(b"NATS/1.0 503\r\n\r\n").unwrap();
		assert_eq!(parsed.status(), Some(503));
		assert!(parsed.is_empty());
	}

	#[test]
	fn header_rejects_garbage() {
		assert!(HeaderMap::parse(b"HTTP/1.1 200\r\n\r\n").is_err());
		assert!(HeaderMap::parse(b"NATS/1.0\r\nno-colon-here\r\n\r\n").is_err());
	}

	#[test]
	fn header_validate_rejects_bad_names() {
		let mut h = HeaderMap::new();
		h.insert("ok", "v");
		assert!(h.validate().is_ok());
		h.insert("bad:name", "v");
		assert!(h.validate().is_err());
	}

	#[test]
	fn no_responders_detection() {
		let headers = HeaderMap::parse(b"NATS/1.0 503\r\n\r\n").unwrap();
		let msg = Message {
			subject: Subject::new("_INBOX.x.1").unwrap(),
			sid: 1,
			reply_to: None,
			headers: Some(headers),
			payload: Bytes::new(),
		};
		assert!(msg.is_no_responders());
	}
}
