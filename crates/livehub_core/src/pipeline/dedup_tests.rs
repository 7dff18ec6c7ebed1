#![forbid(unsafe_code)]

use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use crate::pipeline::dedup::{DedupCache, MAX_DEDUP_TTL};

#[test]
fn duplicate_within_ttl_is_rejected() {
	let mut cache = DedupCache::new(Duration::from_secs(60), 10);
	let now = Instant::now();

	assert!(cache.should_process("a", now));
	assert!(!cache.should_process("a", now + Duration::from_secs(59)));
	assert_eq!(cache.len(), 1);
}

#[test]
fn signature_is_accepted_again_after_ttl() {
	let mut cache = DedupCache::new(Duration::from_secs(60), 10);
	let now = Instant::now();

	assert!(cache.should_process("a", now));
	assert!(cache.should_process("a", now + Duration::from_secs(61)));
	assert!(cache.contains("a", now + Duration::from_secs(62)));
}

#[test]
fn third_signature_evicts_oldest_at_capacity_two() {
	let mut cache = DedupCache::new(Duration::from_secs(60), 2);
	let now = Instant::now();

	assert!(cache.should_process("first", now));
	assert!(cache.should_process("second", now + Duration::from_millis(1)));
	assert!(cache.should_process("third", now + Duration::from_millis(2)));

	assert_eq!(cache.len(), 2);
	let later = now + Duration::from_millis(3);
	assert!(!cache.contains("first", later), "oldest entry should be evicted");
	assert!(cache.contains("second", later));
	assert!(cache.contains("third", later));

	// The evicted signature is new again.
	assert!(cache.should_process("first", later));
}

#[test]
fn clear_forgets_everything() {
	let mut cache = DedupCache::default();
	let now = Instant::now();
	assert!(cache.should_process("a", now));
	cache.clear();
	assert!(cache.is_empty());
	assert!(cache.should_process("a", now));
}

proptest! {
	#[test]
	fn never_exceeds_capacity(
		capacity in 1usize..16,
		sigs in proptest::collection::vec("[a-f]{1,3}", 0..64),
	) {
		let mut cache = DedupCache::new(Duration::from_secs(60), capacity);
		let start = Instant::now();
		for (i, sig) in sigs.iter().enumerate() {
			cache.should_process(sig, start + Duration::from_millis(i as u64));
			prop_assert!(cache.len() <= capacity);
		}
	}

	#[test]
	fn immediate_repeat_is_always_a_duplicate(sig in "[a-z0-9]{1,24}", capacity in 1usize..8) {
		let mut cache = DedupCache::new(Duration::from_secs(60), capacity);
		let now = Instant::now();
		prop_assert!(cache.should_process(&sig, now));
		prop_assert!(!cache.should_process(&sig, now));
	}
}

#[test]
fn oversized_ttl_is_clamped_instead_of_overflowing() {
	let mut cache = DedupCache::new(Duration::MAX, 4);
	let now = Instant::now();

	assert!(cache.should_process("a", now));
	assert!(!cache.should_process("a", now + Duration::from_secs(3_600)));
	assert!(cache.should_process("a", now + MAX_DEDUP_TTL + Duration::from_secs(1)));
}
