//! Per-session accounting.
//!
//! [`SessionStats`] is a bundle of atomic counters updated once per completed
//! query. All updates are lock-free so the hot path never blocks; reads give
//! a point-in-time snapshot with no cross-counter consistency guarantee,
//! which is fine for an operator dashboard.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::tier::Tier;

/// Thread-safe session counters. Share as `Arc<SessionStats>`.
#[derive(Debug, Default)]
pub struct SessionStats {
    total_queries: AtomicU64,
    cache_hits: AtomicU64,
    local_queries: AtomicU64,
    cloud_queries: AtomicU64,
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
    /// Stored in hundredths of a cent to stay integral under atomics.
    total_cost_centicents: AtomicU64,
    total_saved_centicents: AtomicU64,
}

/// Point-in-time snapshot of the counters, serializable for `/stats`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub local_queries: u64,
    pub cloud_queries: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_cents: f64,
    pub total_saved_cents: f64,
    pub cache_hit_rate: f64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed query.
    ///
    /// Savings are measured against what the same token counts would have
    /// cost on the most expensive named tier (Opus) — the "what if we had
    /// just sent everything to the big model" baseline.
    pub fn record(&self, tier: Tier, input_tokens: u32, output_tokens: u32, cache_hit: bool) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);

        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else if tier.is_local() {
            self.local_queries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cloud_queries.fetch_add(1, Ordering::Relaxed);
        }

        self.total_input_tokens
            .fetch_add(input_tokens as u64, Ordering::Relaxed);
        self.total_output_tokens
            .fetch_add(output_tokens as u64, Ordering::Relaxed);

        let cost = if cache_hit {
            0.0
        } else {
            tier.cost_cents(input_tokens, output_tokens)
        };
        let baseline = Tier::Opus.cost_cents(input_tokens, output_tokens);
        let saved = (baseline - cost).max(0.0);

        self.total_cost_centicents
            .fetch_add(to_centicents(cost), Ordering::Relaxed);
        self.total_saved_centicents
            .fetch_add(to_centicents(saved), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total_queries.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        StatsSnapshot {
            total_queries: total,
            cache_hits: hits,
            local_queries: self.local_queries.load(Ordering::Relaxed),
            cloud_queries: self.cloud_queries.load(Ordering::Relaxed),
            total_input_tokens: self.total_input_tokens.load(Ordering::Relaxed),
            total_output_tokens: self.total_output_tokens.load(Ordering::Relaxed),
            total_cost_cents: from_centicents(self.total_cost_centicents.load(Ordering::Relaxed)),
            total_saved_cents: from_centicents(self.total_saved_centicents.load(Ordering::Relaxed)),
            cache_hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

fn to_centicents(cents: f64) -> u64 {
    (cents * 100.0).round() as u64
}

fn from_centicents(v: u64) -> f64 {
    v as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fresh_stats_are_zero() {
        let snap = SessionStats::new().snapshot();
        assert_eq!(snap.total_queries, 0);
        assert_eq!(snap.total_cost_cents, 0.0);
        assert_eq!(snap.cache_hit_rate, 0.0);
    }

    #[test]
    fn cache_hits_cost_nothing_and_count_separately() {
        let stats = SessionStats::new();
        stats.record(Tier::Cache, 100, 300, true);

        let snap = stats.snapshot();
        assert_eq!(snap.total_queries, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.local_queries, 0);
        assert_eq!(snap.total_cost_cents, 0.0);
        assert_eq!(snap.cache_hit_rate, 1.0);
    }

    #[test]
    fn local_and_cloud_queries_bucket_correctly() {
        let stats = SessionStats::new();
        stats.record(Tier::Local, 100, 300, false);
        stats.record(Tier::Cloud, 100, 300, false);
        stats.record(Tier::Sonnet, 100, 300, false);

        let snap = stats.snapshot();
        assert_eq!(snap.local_queries, 1);
        assert_eq!(snap.cloud_queries, 2);
        assert_eq!(snap.total_input_tokens, 300);
        assert_eq!(snap.total_output_tokens, 900);
    }

    #[test]
    fn savings_measured_against_opus_baseline() {
        let stats = SessionStats::new();
        stats.record(Tier::Local, 1000, 1000, false);

        let snap = stats.snapshot();
        let opus = Tier::Opus.cost_cents(1000, 1000);
        assert!((snap.total_saved_cents - opus).abs() < 0.02);
        assert_eq!(snap.total_cost_cents, 0.0);
    }

    #[test]
    fn opus_queries_save_nothing() {
        let stats = SessionStats::new();
        stats.record(Tier::Opus, 1000, 1000, false);
        assert_eq!(stats.snapshot().total_saved_cents, 0.0);
    }

    #[test]
    fn concurrent_updates_do_not_lose_counts() {
        let stats = Arc::new(SessionStats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = Arc::clone(&stats);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record(Tier::Local, 10, 30, false);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().total_queries, 8000);
        assert_eq!(stats.snapshot().total_input_tokens, 80_000);
    }
}
