//! In-process mock NATS server for integration tests. Speaks just enough of the wire
//! protocol: INFO on accept, PING/PONG, SUB/UNSUB bookkeeping and PUB/HPUB routed back to
//! the same connection's matching subscriptions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Once;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

pub fn trace_init() {
	static INIT: Once = Once::new();
	INIT.call_once(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.with_test_writer()
			.try_init();
	});
}

pub struct Server {
	address: SocketAddr,
	shutdown: oneshot::Sender<()>,
	handle: tokio::task::JoinHandle<()>,
}

impl Server {
	pub async fn run() -> Server {
		Server::run_with_port(0).await
	}

	pub async fn run_with_port(port: u16) -> Server {
		let listener = TcpListener::bind(("127.0.0.1", port))
			.await
			.expect("failed to bind");
		let address = listener.local_addr().expect("failed to get local addr");
		let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

		let handle = tokio::spawn(async move {
			let mut connections: Vec<tokio::task::JoinHandle<()>> = Vec::new();
			loop {
				tokio::select! {
					_ = &mut shutdown_rx => {
						// Drop established connections too, so clients observe EOF.
						for connection in &connections {
							connection.abort();
						}
						return;
					},
					accepted = listener.accept() => {
						let Ok((stream, _)) = accepted else { return };
						connections.push(tokio::spawn(async move {
							let _ = serve_connection(stream).await;
						}));
					},
				}
			}
		});

		Server {
			address,
			shutdown: shutdown_tx,
			handle,
		}
	}

	pub fn address(&self) -> SocketAddr {
		self.address
	}

	/// Stops accepting and aborts the listener. Established connections die with their
	/// tasks once the client notices the closed socket.
	pub async fn shutdown(self) {
		let _ = self.shutdown.send(());
		let _ = self.handle.await;
	}
}

async fn serve_connection(stream: TcpStream) -> std::io::Result<()> {
	stream.set_nodelay(true)?;
	let (read, mut write) = stream.into_split();
	write
		.write_all(b"INFO {\"server_id\":\"mock\",\"version\":\"0.0.0\",\"headers\":true,\"max_payload\":1048576}\r\n")
		.await?;

	let mut reader = BufReader::new(read);
	// sid -> subject pattern, as announced by the client.
	let mut subscriptions: HashMap<u64, String> = HashMap::new();
	let mut line = String::new();
	loop {
		line.clear();
		if reader.read_line(&mut line).await? == 0 {
			return Ok(());
		}
		let tokens: Vec<&str> = line.split_whitespace().collect();
		match tokens.first().copied() {
			Some("CONNECT") => {},
			Some("PING") => write.write_all(b"PONG\r\n").await?,
			Some("PONG") => {},
			Some("SUB") => {
				let sid: u64 = tokens.last().unwrap().parse().expect("SUB sid");
				subscriptions.insert(sid, tokens[1].to_string());
			},
			Some("UNSUB") => {
				let sid: u64 = tokens[1].parse().expect("UNSUB sid");
				subscriptions.remove(&sid);
			},
			Some("PUB") => {
				let len: usize = tokens.last().unwrap().parse().expect("PUB len");
				let reply = (tokens.len() == 4).then(|| tokens[2].to_string());
				let subject = tokens[1].to_string();
				let payload = read_block(&mut reader, len).await?;
				for (sid, pattern) in &subscriptions {
					if subject_matches(pattern, &subject) {
						deliver(&mut write, "MSG", &subject, *sid, reply.as_deref(), None, &payload)
							.await?;
					}
				}
			},
			Some("HPUB") => {
				let total: usize = tokens.last().unwrap().parse().expect("HPUB total len");
				let header_len: usize = tokens[tokens.len() - 2].parse().expect("HPUB header len");
				let reply = (tokens.len() == 5).then(|| tokens[2].to_string());
				let subject = tokens[1].to_string();
				let block = read_block(&mut reader, total).await?;
				for (sid, pattern) in &subscriptions {
					if subject_matches(pattern, &subject) {
						deliver(
							&mut write,
							"HMSG",
							&subject,
							*sid,
							reply.as_deref(),
							Some(header_len),
							&block,
						)
						.await?;
					}
				}
			},
			other => panic!("mock server got unexpected verb: {other:?}"),
		}
	}
}

async fn read_block(reader: &mut BufReader<OwnedReadHalf>, len: usize) -> std::io::Result<Vec<u8>> {
	let mut block = vec![0u8; len + 2];
	reader.read_exact(&mut block).await?;
	assert_eq!(&block[len..], b"\r\n", "payload must end with CRLF");
	block.truncate(len);
	Ok(block)
}

async fn deliver(
	write: &mut OwnedWriteHalf,
	verb: &str,
	subject: &str,
	sid: u64,
	reply: Option<&str>,
	header_len: Option<usize>,
	block: &[u8],
) -> std::io::Result<()> {
	let mut head = format!("{verb} {subject} {sid}");
	if let Some(reply) = reply {
		head.push(' ');
		head.push_str(reply);
	}
	if let Some(header_len) = header_len {
		head.push_str(&format!(" {header_len}"));
	}
	head.push_str(&format!(" {}\r\n", block.len()));
	write.write_all(head.as_bytes()).await?;
	write.write_all(block).await?;
	write.write_all(b"\r\n").await
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
	let mut pattern = pattern.split('.');
	let mut subject = subject.split('.');
	loop {
		match (pattern.next(), subject.next()) {
			(None, None) => return true,
			(Some(">"), Some(_)) => return true,
			(Some("*"), Some(_)) => {},
			(Some(p), Some(s)) if p == s => {},
			_ => return false,
		}
	}
}
