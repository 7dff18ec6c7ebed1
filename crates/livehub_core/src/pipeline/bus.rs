#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use livehub_domain::{EventKind, PluginId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::event::Event;
use crate::pipeline::store::BoxFuture;

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives published events for the kinds it subscribed to.
pub trait EventHandler: Send + Sync + 'static {
	fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> EventHandler for F
where
	F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
	fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>> {
		Box::pin(self(event))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
	pub fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for SubscriptionToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "sub-{}", self.0)
	}
}

/// A handler failure, isolated from every other handler.
#[derive(Debug, Error)]
pub enum SubscriberError {
	#[error("subscriber {plugin} panicked: {message}")]
	Panicked { plugin: PluginId, message: String },
	#[error("subscriber {plugin} failed: {message}")]
	Failed { plugin: PluginId, message: String },
	#[error("subscriber {plugin} timed out after {timeout:?}")]
	TimedOut { plugin: PluginId, timeout: Duration },
}

impl SubscriberError {
	pub fn reason(&self) -> &'static str {
		match self {
			SubscriberError::Panicked { .. } => "panicked",
			SubscriberError::Failed { .. } => "failed",
			SubscriberError::TimedOut { .. } => "timed_out",
		}
	}
}

struct Subscription {
	plugin_id: PluginId,
	kinds: BTreeSet<EventKind>,
	handler: Arc<dyn EventHandler>,
}

/// Token-keyed subscription table. At most one token claims a `(plugin, kind)` pair.
#[derive(Default)]
pub struct SubscriptionRegistry {
	next_token: u64,
	subs: BTreeMap<SubscriptionToken, Subscription>,
	by_key: HashMap<(PluginId, EventKind), SubscriptionToken>,
}

impl SubscriptionRegistry {
	/// Register `handler` for `kinds` (empty means every kind). Older claims of
	/// the same plugin on those kinds are released; a token left with no kinds is dropped.
	pub fn subscribe(
		&mut self,
		plugin_id: PluginId,
		kinds: impl IntoIterator<Item = EventKind>,
		handler: Arc<dyn EventHandler>,
	) -> SubscriptionToken {
		let mut kinds: BTreeSet<EventKind> = kinds.into_iter().collect();
		if kinds.is_empty() {
			kinds.extend(EventKind::ALL);
		}

		self.next_token = self.next_token.saturating_add(1);
		let token = SubscriptionToken(self.next_token);

		for kind in &kinds {
			if let Some(prev) = self.by_key.insert((plugin_id.clone(), *kind), token) {
				self.release_kind(prev, *kind);
			}
		}

		debug!(plugin = %plugin_id, %token, kinds = ?kinds, "subscribed");
		self.subs.insert(
			token,
			Subscription {
				plugin_id,
				kinds,
				handler,
			},
		);
		token
	}

	pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
		let Some(sub) = self.subs.remove(&token) else {
			return false;
		};
		for kind in &sub.kinds {
			let key = (sub.plugin_id.clone(), *kind);
			if self.by_key.get(&key) == Some(&token) {
				self.by_key.remove(&key);
			}
		}
		debug!(plugin = %sub.plugin_id, %token, "unsubscribed");
		true
	}

	/// Drop every token held by `plugin_id`; returns how many were removed.
	pub fn unsubscribe_plugin(&mut self, plugin_id: &PluginId) -> usize {
		let tokens: Vec<SubscriptionToken> = self
			.subs
			.iter()
			.filter(|(_, s)| &s.plugin_id == plugin_id)
			.map(|(t, _)| *t)
			.collect();
		tokens.into_iter().filter(|t| self.unsubscribe(*t)).count()
	}

	pub fn handlers_for(&self, kind: EventKind) -> Vec<(SubscriptionToken, PluginId, Arc<dyn EventHandler>)> {
		self.subs
			.iter()
			.filter(|(_, s)| s.kinds.contains(&kind))
			.map(|(t, s)| (*t, s.plugin_id.clone(), Arc::clone(&s.handler)))
			.collect()
	}

	pub fn kinds_of(&self, token: SubscriptionToken) -> Option<Vec<EventKind>> {
		self.subs.get(&token).map(|s| s.kinds.iter().copied().collect())
	}

	pub fn len(&self) -> usize {
		self.subs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.subs.is_empty()
	}

	fn release_kind(&mut self, token: SubscriptionToken, kind: EventKind) {
		let now_empty = match self.subs.get_mut(&token) {
			Some(sub) => {
				sub.kinds.remove(&kind);
				sub.kinds.is_empty()
			}
			None => false,
		};
		if now_empty {
			self.subs.remove(&token);
			debug!(%token, "subscription replaced");
		}
	}
}

/// Outcome of one publish.
#[derive(Debug, Default)]
pub struct PublishReport {
	pub delivered: usize,
	pub errors: Vec<SubscriberError>,
}

/// Fan-out dispatcher over a [`SubscriptionRegistry`].
pub struct EventBus {
	registry: SubscriptionRegistry,
	handler_timeout: Duration,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(DEFAULT_HANDLER_TIMEOUT)
	}
}

impl EventBus {
	pub fn new(handler_timeout: Duration) -> Self {
		Self {
			registry: SubscriptionRegistry::default(),
			handler_timeout,
		}
	}

	pub fn registry(&self) -> &SubscriptionRegistry {
		&self.registry
	}

	pub fn registry_mut(&mut self) -> &mut SubscriptionRegistry {
		&mut self.registry
	}

	/// Invoke every handler subscribed to `event.kind` concurrently, once each.
	pub async fn publish(&self, event: Arc<Event>) -> PublishReport {
		let targets = self.registry.handlers_for(event.kind);
		let timeout = self.handler_timeout;

		let results = join_all(
			targets
				.into_iter()
				.map(|(token, plugin, handler)| dispatch_one(token, plugin, handler, Arc::clone(&event), timeout)),
		)
		.await;

		let mut report = PublishReport::default();
		for result in results {
			match result {
				Ok(()) => report.delivered += 1,
				Err(e) => {
					warn!(kind = %event.kind, reason = e.reason(), error = %e, "subscriber error");
					metrics::counter!("livehub_subscriber_errors_total", "reason" => e.reason()).increment(1);
					report.errors.push(e);
				}
			}
		}
		report
	}
}

async fn dispatch_one(
	token: SubscriptionToken,
	plugin: PluginId,
	handler: Arc<dyn EventHandler>,
	event: Arc<Event>,
	timeout: Duration,
) -> Result<(), SubscriberError> {
	let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
		Ok(fut) => fut,
		Err(panic) => {
			return Err(SubscriberError::Panicked {
				plugin,
				message: panic_message(panic.as_ref()),
			});
		}
	};

	match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
		Ok(Ok(Ok(()))) => Ok(()),
		Ok(Ok(Err(e))) => Err(SubscriberError::Failed {
			plugin,
			message: format!("{e:#}"),
		}),
		Ok(Err(panic)) => Err(SubscriberError::Panicked {
			plugin,
			message: panic_message(panic.as_ref()),
		}),
		Err(_) => {
			debug!(%token, "subscriber timed out");
			Err(SubscriberError::TimedOut { plugin, timeout })
		}
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}
