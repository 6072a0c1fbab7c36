use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the client.
///
/// Transport and protocol failures are connection-scoped: they terminate the current
/// connection cycle and reach the application through [`crate::ClientEvent`], never as the
/// return value of an individual publish or subscribe. The remaining variants are returned
/// directly to the calling operation.
#[derive(Error, Debug)]
pub enum Error {
	#[error("transport: {0}")]
	Transport(#[from] std::io::Error),

	#[error("protocol violation: {0}")]
	ProtocolViolation(String),

	#[error("server error: {0}")]
	ServerError(String),

	#[error("invalid subject")]
	InvalidSubject,

	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),

	#[error("request timed out")]
	RequestTimeout,

	#[error("no responders available for request")]
	NoResponders,

	#[error("operation cancelled")]
	Cancelled,

	#[error("deserialization: {0}")]
	Deserialization(#[source] Box<dyn std::error::Error + Send + Sync>),

	#[error("serialization: {0}")]
	Serialization(#[source] Box<dyn std::error::Error + Send + Sync>),

	#[error("client is already connected")]
	AlreadyConnected,

	#[error("client has been disposed")]
	Disposed,
}

impl Error {
	pub(crate) fn protocol(msg: impl Into<String>) -> Self {
		Error::ProtocolViolation(msg.into())
	}

	/// Whether the error is scoped to the connection rather than a single operation.
	pub fn is_connection_error(&self) -> bool {
		matches!(self, Error::Transport(_) | Error::ProtocolViolation(_))
	}
}
