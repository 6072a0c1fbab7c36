use std::time::Duration;

use serde::Deserialize;

use crate::proto::ConnectOptions;

/// Client configuration.
///
/// All fields have working defaults; `ClientConfig::default()` targets a local server on
/// the standard port.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
	/// Server endpoint in `host:port` form.
	pub server: String,
	/// Maximum number of outbound frames queued ahead of the socket writer. Publishers
	/// await capacity once the queue is full.
	pub sender_queue_length: usize,
	/// Bounded capacity of each subscription inbox, in messages.
	pub receiver_queue_length: usize,
	/// High-water mark of the socket read pipe. The receiver stops reading once this many
	/// bytes are buffered ahead of the dispatcher.
	pub read_pipe_high_water_bytes: usize,
	/// Largest inbound payload the parser will accept before failing the connection.
	pub max_inbound_payload_bytes: usize,
	/// Request `+OK` acknowledgements from the server.
	pub verbose: bool,
	pub pedantic: bool,
	/// Whether the server should echo our own publishes back to matching subscriptions.
	pub echo: bool,
	/// Optional client name reported in CONNECT.
	pub name: Option<String>,
	pub user: Option<String>,
	pub pass: Option<String>,
	pub auth_token: Option<String>,
	pub lang: String,
	pub version: String,
	/// Delay between reconnect attempts after a failed TCP connect. Deserializes from
	/// humantime strings such as `"250ms"` or `"1s"`.
	#[serde(with = "humantime_serde")]
	pub reconnect_delay: Duration,
	/// Interval between client-initiated PINGs on an otherwise idle connection.
	#[serde(with = "humantime_serde")]
	pub ping_interval: Duration,
	/// Deadline applied to `request` when the caller does not supply one.
	#[serde(with = "humantime_serde")]
	pub request_timeout: Duration,
}

impl Default for ClientConfig {
	fn default() -> Self {
		ClientConfig {
			server: "127.0.0.1:4222".to_string(),
			sender_queue_length: 1024,
			receiver_queue_length: 512,
			read_pipe_high_water_bytes: 1024 * 1024,
			max_inbound_payload_bytes: 64 * 1024 * 1024,
			verbose: false,
			pedantic: false,
			echo: true,
			name: None,
			user: None,
			pass: None,
			auth_token: None,
			lang: "rust".to_string(),
			version: env!("CARGO_PKG_VERSION").to_string(),
			reconnect_delay: Duration::from_secs(1),
			ping_interval: Duration::from_secs(30),
			request_timeout: Duration::from_secs(10),
		}
	}
}

impl ClientConfig {
	pub(crate) fn connect_options(&self) -> ConnectOptions {
		ConnectOptions {
			verbose: self.verbose,
			pedantic: self.pedantic,
			tls_required: false,
			auth_token: self.auth_token.clone(),
			user: self.user.clone(),
			pass: self.pass.clone(),
			name: self.name.clone(),
			lang: self.lang.clone(),
			version: self.version.clone(),
			protocol: 1,
			echo: self.echo,
			headers: true,
		}
	}
}
