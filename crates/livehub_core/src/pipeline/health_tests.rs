#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use livehub_source::ConnectionState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::pipeline::health::{HealthState, spawn_health_server};
use crate::pipeline::stats::StatsSnapshot;

async fn free_addr() -> SocketAddr {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
	listener.local_addr().expect("local addr")
}

async fn get(addr: SocketAddr, path: &str) -> String {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	let mut stream = loop {
		match TcpStream::connect(addr).await {
			Ok(s) => break s,
			Err(_) if tokio::time::Instant::now() < deadline => {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
			Err(e) => panic!("health server never came up: {e}"),
		}
	};

	let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
	stream.write_all(req.as_bytes()).await.expect("write request");

	let mut buf = Vec::new();
	timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
		.await
		.expect("response in time")
		.expect("read response");
	String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn endpoints_report_liveness_readiness_and_stats() {
	let (stats_tx, stats_rx) = watch::channel(StatsSnapshot::default());
	let state = HealthState::new(stats_rx);
	let addr = free_addr().await;
	spawn_health_server(addr, state.clone());

	let resp = get(addr, "/healthz").await;
	assert!(resp.starts_with("HTTP/1.1 200"), "unexpected: {resp}");

	let resp = get(addr, "/readyz").await;
	assert!(resp.starts_with("HTTP/1.1 503"), "not ready before connect: {resp}");

	state.set_ready(true);
	let resp = get(addr, "/readyz").await;
	assert!(resp.starts_with("HTTP/1.1 200"), "unexpected: {resp}");

	stats_tx.send_replace(StatsSnapshot {
		likes: 42,
		..StatsSnapshot::default()
	});
	let resp = get(addr, "/stats").await;
	assert!(resp.starts_with("HTTP/1.1 200"), "unexpected: {resp}");
	assert!(resp.contains("application/json"));
	assert!(resp.contains("\"likes\":42"), "unexpected body: {resp}");

	let resp = get(addr, "/nope").await;
	assert!(resp.starts_with("HTTP/1.1 404"), "unexpected: {resp}");
}

#[tokio::test]
async fn readiness_follows_connection_state() {
	let (_stats_tx, stats_rx) = watch::channel(StatsSnapshot::default());
	let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
	let state = HealthState::new(stats_rx);
	state.track_connection(state_rx);

	state_tx.send_replace(ConnectionState::Connected);
	timeout(Duration::from_secs(1), async {
		while !state.is_ready() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("ready after connect");

	state_tx.send_replace(ConnectionState::Connecting);
	timeout(Duration::from_secs(1), async {
		while state.is_ready() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("not ready while reconnecting");
}
