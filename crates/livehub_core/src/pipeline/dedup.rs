#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_DEDUP_CAPACITY: usize = 1_000;
/// Longest TTL a cache accepts; larger values are clamped.
pub const MAX_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Bounded TTL set of recently processed signatures.
#[derive(Debug)]
pub struct DedupCache {
	ttl: Duration,
	capacity: usize,
	expires_by_signature: HashMap<String, Instant>,
	/// Insertion order; equal TTLs make this expiry order too.
	order: VecDeque<(String, Instant)>,
}

impl Default for DedupCache {
	fn default() -> Self {
		Self::new(DEFAULT_DEDUP_TTL, DEFAULT_DEDUP_CAPACITY)
	}
}

impl DedupCache {
	pub fn new(ttl: Duration, capacity: usize) -> Self {
		Self {
			ttl: ttl.min(MAX_DEDUP_TTL),
			capacity: capacity.max(1),
			expires_by_signature: HashMap::new(),
			order: VecDeque::new(),
		}
	}

	/// `true` (and remembers the signature) unless it was seen within the TTL.
	pub fn should_process(&mut self, signature: &str, now: Instant) -> bool {
		self.purge_expired(now);

		if let Some(expires_at) = self.expires_by_signature.get(signature)
			&& *expires_at > now
		{
			return false;
		}

		let Some(expires_at) = now.checked_add(self.ttl) else {
			return true;
		};
		self.expires_by_signature.insert(signature.to_string(), expires_at);
		self.order.push_back((signature.to_string(), expires_at));

		while self.expires_by_signature.len() > self.capacity {
			let Some((oldest, at)) = self.order.pop_front() else {
				break;
			};
			self.remove_if_current(&oldest, at);
		}
		true
	}

	pub fn contains(&self, signature: &str, now: Instant) -> bool {
		self.expires_by_signature.get(signature).is_some_and(|at| *at > now)
	}

	pub fn clear(&mut self) {
		self.expires_by_signature.clear();
		self.order.clear();
	}

	pub fn len(&self) -> usize {
		self.expires_by_signature.len()
	}

	pub fn is_empty(&self) -> bool {
		self.expires_by_signature.is_empty()
	}

	fn purge_expired(&mut self, now: Instant) {
		while let Some((_, at)) = self.order.front() {
			if *at > now {
				break;
			}
			if let Some((sig, at)) = self.order.pop_front() {
				self.remove_if_current(&sig, at);
			}
		}
	}

	fn remove_if_current(&mut self, signature: &str, at: Instant) {
		if self.expires_by_signature.get(signature) == Some(&at) {
			self.expires_by_signature.remove(signature);
		}
	}
}
