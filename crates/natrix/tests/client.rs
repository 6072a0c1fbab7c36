use std::time::Duration;

use futures::StreamExt;
use natrix::{Client, ClientConfig, ClientStatus, Error, HeaderMap};

mod common;

fn config_for(server: std::net::SocketAddr) -> ClientConfig {
	ClientConfig {
		server: server.to_string(),
		reconnect_delay: Duration::from_millis(50),
		..Default::default()
	}
}

async fn connected_client(server: &common::Server) -> Client {
	common::trace_init();
	let client = Client::new(config_for(server.address()));
	client.connect().await.expect("connect");
	client
}

#[tokio::test]
async fn publish_roundtrip() {
	let server = common::Server::run().await;
	let client = connected_client(&server).await;

	let mut sub = client.subscribe("foo").await.unwrap();
	client.flush().await.unwrap();

	client.publish("foo", b"hello").await.unwrap();
	let msg = sub.next().await.unwrap();
	assert_eq!(msg.subject, "foo");
	assert_eq!(&msg.payload[..], b"hello");
	assert_eq!(msg.sid, sub.sid());
	assert!(msg.headers.is_none());

	client.dispose().await;
	server.shutdown().await;
}

#[tokio::test]
async fn header_publish() {
	let server = common::Server::run().await;
	let client = connected_client(&server).await;

	// A sibling-pattern subscription must not match the bare subject.
	let mut wrong_pattern = client.subscribe("bar.>").await.unwrap();
	let mut sub = client.subscribe("bar").await.unwrap();
	client.flush().await.unwrap();

	let mut headers = HeaderMap::new();
	headers.insert("A", "1");
	headers.insert("B", "2");
	client
		.publish_with_headers("bar", &headers, b"body")
		.await
		.unwrap();

	let msg = sub.next().await.unwrap();
	assert_eq!(msg.subject, "bar");
	assert_eq!(&msg.payload[..], b"body");
	let got = msg.headers.expect("headers");
	assert_eq!(got.get("A"), Some("1"));
	assert_eq!(got.get("B"), Some("2"));

	let nothing = tokio::time::timeout(Duration::from_millis(100), wrong_pattern.next()).await;
	assert!(nothing.is_err(), "bar.> must not receive a message on bar");

	client.dispose().await;
	server.shutdown().await;
}

#[tokio::test]
async fn request_response() {
	let server = common::Server::run().await;
	let client = connected_client(&server).await;

	let mut service = client.subscribe("svc").await.unwrap();
	client.flush().await.unwrap();

	let responder = client.clone();
	let echo = tokio::spawn(async move {
		while let Some(msg) = service.next().await {
			let reply = msg.reply_to.expect("request carries a reply subject");
			responder
				.publish(reply.as_str(), &msg.payload)
				.await
				.unwrap();
		}
	});

	let response = client
		.request_with_timeout("svc", b"ping", Duration::from_secs(1))
		.await
		.unwrap();
	assert_eq!(&response[..], b"ping");

	client.dispose().await;
	echo.await.unwrap();
	server.shutdown().await;
}

#[tokio::test]
async fn request_times_out_without_responder() {
	let server = common::Server::run().await;
	let client = connected_client(&server).await;

	let err = client
		.request_with_timeout("nobody.home", b"ping", Duration::from_millis(150))
		.await
		.unwrap_err();
	assert!(matches!(err, Error::RequestTimeout), "{err}");

	client.dispose().await;
	server.shutdown().await;
}

#[tokio::test]
async fn reconnect_resubscribes_with_same_sid() {
	let server = common::Server::run().await;
	let port = server.address().port();
	let client = connected_client(&server).await;

	let mut sub = client.subscribe("t").await.unwrap();
	let sid_before = sub.sid();
	client.flush().await.unwrap();

	let mut status = client.status();
	server.shutdown().await;
	status
		.wait_for(|s| *s == ClientStatus::Disconnected)
		.await
		.unwrap();

	let server = common::Server::run_with_port(port).await;
	status
		.wait_for(|s| *s == ClientStatus::Connected)
		.await
		.unwrap();
	client.flush().await.unwrap();

	client.publish("t", b"back again").await.unwrap();
	let msg = sub.next().await.unwrap();
	assert_eq!(&msg.payload[..], b"back again");
	assert_eq!(sub.sid(), sid_before, "reconnect must not renumber subscriptions");

	client.dispose().await;
	server.shutdown().await;
}

#[tokio::test]
async fn slow_subscriber_backpressures_without_drops() {
	let server = common::Server::run().await;
	common::trace_init();
	let config = ClientConfig {
		receiver_queue_length: 1,
		..config_for(server.address())
	};
	let client = Client::new(config);
	client.connect().await.unwrap();

	let mut sub = client.subscribe("load").await.unwrap();
	client.flush().await.unwrap();

	const COUNT: u32 = 200;
	let publisher = client.clone();
	let producer = tokio::spawn(async move {
		for n in 0..COUNT {
			publisher
				.publish("load", n.to_string().as_bytes())
				.await
				.unwrap();
		}
	});

	let mut received = 0u32;
	while received < COUNT {
		let msg = tokio::time::timeout(Duration::from_secs(10), sub.next())
			.await
			.expect("delivery stalled")
			.expect("stream ended early");
		assert_eq!(msg.payload, received.to_string().as_bytes(), "in-order delivery");
		received += 1;
		tokio::time::sleep(Duration::from_millis(1)).await;
	}

	producer.await.unwrap();
	assert_eq!(client.stats().total_received_messages(), u64::from(COUNT));
	assert_eq!(client.stats().total_transmitted_messages(), u64::from(COUNT));
	assert_eq!(client.stats().sender_queue_bytes(), 0);

	client.dispose().await;
	server.shutdown().await;
}

#[tokio::test]
async fn dispose_ends_subscription_streams() {
	let server = common::Server::run().await;
	let client = connected_client(&server).await;

	let mut sub = client.subscribe("ending").await.unwrap();
	client.dispose().await;

	assert!(sub.next().await.is_none());
	assert!(matches!(
		client.publish("ending", b"x").await,
		Err(Error::Disposed)
	));
	assert!(matches!(client.connect().await, Err(Error::Disposed)));

	server.shutdown().await;
}

#[tokio::test]
async fn subscription_works_as_stream() {
	let server = common::Server::run().await;
	let client = connected_client(&server).await;

	let mut sub = client.subscribe("stream.me").await.unwrap();
	client.flush().await.unwrap();
	for n in 0..3u8 {
		client.publish("stream.me", &[n]).await.unwrap();
	}
	for n in 0..3u8 {
		let msg = StreamExt::next(&mut sub).await.unwrap();
		assert_eq!(&msg.payload[..], &[n]);
	}

	client.dispose().await;
	server.shutdown().await;
}

#[tokio::test]
async fn typed_request_roundtrip() {
	use serde::{Deserialize, Serialize};

	#[derive(Serialize, Deserialize)]
	struct Ask {
		q: String,
	}
	#[derive(Serialize, Deserialize, Debug, PartialEq)]
	struct Answer {
		a: u32,
	}

	let server = common::Server::run().await;
	let client = connected_client(&server).await;

	let mut service = client.subscribe("math").await.unwrap();
	client.flush().await.unwrap();

	let responder = client.clone();
	let task = tokio::spawn(async move {
		if let Some(msg) = service.next().await {
			let reply = msg.reply_to.unwrap();
			responder
				.publish_typed(reply.as_str(), &Answer { a: 42 })
				.await
				.unwrap();
		}
	});

	let answer: Answer = client
		.request_typed("math", &Ask { q: "life".to_string() })
		.await
		.unwrap();
	assert_eq!(answer, Answer { a: 42 });

	client.dispose().await;
	task.await.unwrap();
	server.shutdown().await;
}

#[tokio::test]
async fn connect_twice_is_rejected() {
	let server = common::Server::run().await;
	let client = connected_client(&server).await;
	assert!(matches!(client.connect().await, Err(Error::AlreadyConnected)));
	client.dispose().await;
	server.shutdown().await;
}

#[tokio::test]
async fn disconnect_preserves_registry_for_next_connect() {
	let server = common::Server::run().await;
	let client = connected_client(&server).await;

	let mut sub = client.subscribe("sticky").await.unwrap();
	client.disconnect().await.unwrap();
	assert_eq!(client.current_status(), ClientStatus::Disconnected);

	client.connect().await.unwrap();
	client.flush().await.unwrap();
	client.publish("sticky", b"still here").await.unwrap();
	let msg = sub.next().await.unwrap();
	assert_eq!(&msg.payload[..], b"still here");

	client.dispose().await;
	server.shutdown().await;
}
