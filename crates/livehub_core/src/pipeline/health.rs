#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use livehub_source::ConnectionState;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::pipeline::stats::StatsSnapshot;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	stats: watch::Receiver<StatsSnapshot>,
}

impl HealthState {
	pub fn new(stats: watch::Receiver<StatsSnapshot>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			stats,
		}
	}

	pub fn set_ready(&self, ready: bool) {
		self.ready.store(ready, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Keep readiness in step with the upstream connection.
	pub fn track_connection(&self, mut state_rx: watch::Receiver<ConnectionState>) {
		let this = self.clone();
		tokio::spawn(async move {
			loop {
				let connected = *state_rx.borrow_and_update() == ConnectionState::Connected;
				this.set_ready(connected);
				if state_rx.changed().await.is_err() {
					this.set_ready(false);
					break;
				}
			}
		});
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "health server listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	Ok(match req.uri().path() {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => respond(StatusCode::OK, Bytes::from_static(b"ready")),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		"/stats" => {
			let snapshot = *state.stats.borrow();
			match serde_json::to_vec(&snapshot) {
				Ok(body) => {
					let mut resp = respond(StatusCode::OK, body);
					resp.headers_mut()
						.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
					resp
				}
				Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
			}
		}
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	})
}
