//! Payload codec seam. The wire engine moves opaque bytes; typed publish and request
//! helpers go through an injected [`PayloadCodec`] so applications choose their own
//! object representation.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub trait PayloadCodec: Send + Sync + 'static {
	fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes>;
	fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T>;
}

/// JSON payloads via serde_json. The default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
	fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
		let bytes = serde_json::to_vec(value).map_err(|e| Error::Serialization(Box::new(e)))?;
		Ok(Bytes::from(bytes))
	}

	fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
		serde_json::from_slice(payload).map_err(|e| Error::Deserialization(Box::new(e)))
	}
}

#[cfg(test)]
mod test {
	use serde::Deserialize;

	use super::*;

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	struct Ticket {
		id: u32,
		owner: String,
	}

	#[test]
	fn json_roundtrip() {
		let codec = JsonCodec;
		let ticket = Ticket {
			id: 7,
			owner: "ops".to_string(),
		};
		let bytes = codec.encode(&ticket).unwrap();
		let back: Ticket = codec.decode(&bytes).unwrap();
		assert_eq!(back, ticket);
	}

	#[test]
	fn decode_failure_is_deserialization_error() {
		let codec = JsonCodec;
		let err = codec.decode::<Ticket>(b"not json").unwrap_err();
		assert!(matches!(err, Error::Deserialization(_)));
	}
}
