#![forbid(unsafe_code)]

pub mod bus;
pub mod dedup;
pub mod event;
pub mod health;
pub mod manager;
pub mod normalizer;
pub mod stats;
pub mod store;
pub mod streak;

pub use bus::{EventBus, EventHandler, SubscriberError, SubscriptionRegistry, SubscriptionToken};
pub use dedup::DedupCache;
pub use event::{Event, EventDetail, GiftDetail, Session};
pub use manager::{Pipeline, PipelineConfig, PipelineError, PipelineHandle};
pub use normalizer::{NormalizeError, Normalizer};
pub use stats::{StatsAggregator, StatsSnapshot};
pub use store::{InMemoryStatsStore, PersistedStats, SqlStatsStore, StatsStore, StoreOpener};
pub use streak::{StreakCoalescer, StreakState};


#[cfg(test)]
mod dedup_tests;

#[cfg(test)]
mod health_tests;

#[cfg(test)]
mod manager_tests;
