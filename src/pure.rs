// Pure Functions Module
// Side-effect-free, deterministic helpers pulled out of the stateful pipeline,
// watcher, dispatcher, and migration code so they can be exhaustively unit
// tested without any I/O fixture.

use std::time::{Duration, Instant};

/// Exponential backoff with the jitter band from `spec.md` §4.5: `base * 2^attempt`,
/// capped at `max_duration`, with jitter of `+/- jitter_fraction` applied on top.
/// `jitter_roll` is a caller-supplied value in `[0.0, 1.0)` (from `fastrand` at the
/// call site) so this function stays deterministic and testable.
pub fn calculate_backoff_duration(
    attempt: u32,
    base_duration: Duration,
    max_duration: Duration,
    jitter_fraction: f64,
    jitter_roll: f64,
) -> Duration {
    let backoff_ms = base_duration.as_millis() as u64 * 2_u64.saturating_pow(attempt);
    let backoff = Duration::from_millis(backoff_ms).min(max_duration);

    // jitter_roll in [0,1) maps to [-jitter_fraction, +jitter_fraction]
    let jitter_signed = (jitter_roll * 2.0 - 1.0) * jitter_fraction;
    let jittered_ms = (backoff.as_millis() as f64) * (1.0 + jitter_signed);
    Duration::from_millis(jittered_ms.max(0.0) as u64)
}

/// The default retry schedule from `spec.md` §4.5: 1s, 4s, 16s.
pub fn default_backoff_schedule() -> [Duration; 3] {
    [
        Duration::from_secs(1),
        Duration::from_secs(4),
        Duration::from_secs(16),
    ]
}

/// A file-based backend's proactive-monitoring threshold checks (`spec.md` §4.6).
/// Each check is independent and throttled by the caller to one warning per
/// condition per scan cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProactiveWarnings {
    pub file_size_exceeded: bool,
    pub total_size_exceeded: bool,
    pub rate_degraded: bool,
}

pub fn evaluate_proactive_warnings(
    largest_file_mb: f64,
    file_size_warning_mb: f64,
    total_size_mb: f64,
    total_size_warning_mb: f64,
    current_rate_per_min: f64,
    baseline_rate_per_min: f64,
    performance_degradation_pct: f64,
) -> ProactiveWarnings {
    let rate_floor = baseline_rate_per_min * (1.0 - performance_degradation_pct / 100.0);
    ProactiveWarnings {
        file_size_exceeded: largest_file_mb > file_size_warning_mb,
        total_size_exceeded: total_size_mb > total_size_warning_mb,
        rate_degraded: baseline_rate_per_min > 0.0 && current_rate_per_min < rate_floor,
    }
}

/// Exponentially weighted average used to build the first-hour ingest-rate
/// baseline referenced by `evaluate_proactive_warnings` (`spec.md` §4.6).
pub fn update_ewma(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        None => sample,
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
    }
}

/// Whether a file discovered during a scan is a candidate for ingestion: its
/// mtime must be strictly after the recorded per-root delta timestamp
/// (`spec.md` §4.6 "Delta ingestion").
pub fn is_scan_candidate(file_mtime_secs: i64, delta_timestamp_secs: i64) -> bool {
    file_mtime_secs > delta_timestamp_secs
}

/// The `tier_hint` a file receives from the bulk-cutoff comparison
/// (`spec.md` §4.4): strictly older than the cutoff is `fast`, otherwise `enriched`.
pub fn tier_hint_for_mtime(
    file_mtime_secs: i64,
    bulk_cutoff_secs: i64,
) -> crate::types::IngestTier {
    if file_mtime_secs < bulk_cutoff_secs {
        crate::types::IngestTier::Fast
    } else {
        crate::types::IngestTier::Enriched
    }
}

/// Deterministic seeded sample of `count` indices in `0..population`, used by the
/// Migration Coordinator's spot-check (`spec.md` §4.9, §8): same `seed` and
/// `population` always produce the same sample, so a resumed verify pass is
/// reproducible.
pub fn seeded_spot_check_indices(seed: u64, population: usize, count: usize) -> Vec<usize> {
    if population == 0 {
        return Vec::new();
    }
    let rng = fastrand::Rng::with_seed(seed);
    let count = count.min(population);
    let mut chosen = std::collections::BTreeSet::new();
    while chosen.len() < count {
        chosen.insert(rng.usize(0..population));
    }
    chosen.into_iter().collect()
}

/// A per-tier-per-database concurrency check. Kept as a pure predicate so the
/// semaphore-acquisition code path (§4.8) has a single place the cap logic is
/// tested against.
pub fn would_exceed_tier_cap(in_flight: usize, cap: Option<usize>) -> bool {
    match cap {
        Some(cap) => in_flight >= cap,
        None => false,
    }
}

/// Derives multihop-escalation seeds from a query result's top hits
/// (`spec.md` §4.8): an explicit chunk/entity id when the engine result
/// carries one, otherwise a content fingerprint, so a caller can escalate to
/// `multihop-query` using whatever the dispatched query actually returned.
pub fn extract_multihop_seeds(result: &serde_json::Value, limit: usize) -> Vec<String> {
    let Some(hits) = result.get("hits").and_then(|h| h.as_array()) else {
        return Vec::new();
    };
    hits.iter()
        .take(limit)
        .filter_map(|hit| {
            hit.get("id")
                .or_else(|| hit.get("metadata").and_then(|m| m.get("chunk_id")))
                .or_else(|| hit.get("metadata").and_then(|m| m.get("entity_id")))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| {
                    hit.get("text")
                        .and_then(|t| t.as_str())
                        .map(|text| crate::types::Fingerprint::of_content(text.as_bytes()).to_hex())
                })
        })
        .collect()
}

/// How long a claimed-but-incomplete ledger entry may sit before startup reclaim
/// treats it as abandoned (`spec.md` §4.3: 24 hours).
pub fn is_stale_claim(claimed_at: Instant, now: Instant, stale_after: Duration) -> bool {
    now.duration_since(claimed_at) > stale_after
}

pub const STALE_CLAIM_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const STALE_HEARTBEAT_AGE: Duration = Duration::from_secs(60); // 2x heartbeat interval

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_duration_schedule() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(16);

        // no jitter (roll = 0.5 -> jitter_signed = 0)
        assert_eq!(
            calculate_backoff_duration(0, base, max, 0.25, 0.5),
            Duration::from_secs(1)
        );
        assert_eq!(
            calculate_backoff_duration(1, base, max, 0.25, 0.5),
            Duration::from_secs(4)
        );
        assert_eq!(
            calculate_backoff_duration(2, base, max, 0.25, 0.5),
            Duration::from_secs(16)
        );
        // caps at max even for large attempts
        assert_eq!(
            calculate_backoff_duration(10, base, max, 0.25, 0.5),
            Duration::from_secs(16)
        );
    }

    #[test]
    fn test_backoff_jitter_band() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(100);
        // roll = 1.0 -> +25%; roll = 0.0 -> -25%
        let high = calculate_backoff_duration(0, base, max, 0.25, 1.0);
        let low = calculate_backoff_duration(0, base, max, 0.25, 0.0);
        assert_eq!(high, Duration::from_millis(1250));
        assert_eq!(low, Duration::from_millis(750));
    }

    #[test]
    fn test_proactive_warnings() {
        let w = evaluate_proactive_warnings(600.0, 500.0, 2000.0, 5000.0, 10.0, 20.0, 20.0);
        assert!(w.file_size_exceeded);
        assert!(!w.total_size_exceeded);
        assert!(w.rate_degraded); // 10 < 20 * 0.8 = 16

        let w = evaluate_proactive_warnings(100.0, 500.0, 2000.0, 5000.0, 18.0, 20.0, 20.0);
        assert!(!w.file_size_exceeded);
        assert!(!w.rate_degraded); // 18 >= 16
    }

    #[test]
    fn test_scan_candidate_and_tier_hint() {
        assert!(is_scan_candidate(200, 100));
        assert!(!is_scan_candidate(100, 100));
        assert!(!is_scan_candidate(50, 100));

        use crate::types::IngestTier;
        assert_eq!(tier_hint_for_mtime(50, 100), IngestTier::Fast);
        assert_eq!(tier_hint_for_mtime(150, 100), IngestTier::Enriched);
    }

    #[test]
    fn test_seeded_spot_check_is_deterministic() {
        let a = seeded_spot_check_indices(42, 1000, 20);
        let b = seeded_spot_check_indices(42, 1000, 20);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert!(a.iter().all(|&i| i < 1000));

        let c = seeded_spot_check_indices(43, 1000, 20);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tier_cap_predicate() {
        assert!(!would_exceed_tier_cap(3, None));
        assert!(!would_exceed_tier_cap(3, Some(4)));
        assert!(would_exceed_tier_cap(4, Some(4)));
    }

    #[test]
    fn test_stale_claim_detection() {
        let now = Instant::now();
        assert!(!is_stale_claim(now, now, STALE_CLAIM_AGE));
    }

    #[test]
    fn test_extract_multihop_seeds_prefers_explicit_id() {
        let result = serde_json::json!({
            "hits": [
                { "text": "alpha beta", "metadata": { "chunk_id": "c1" } },
                { "text": "gamma delta", "metadata": {} },
            ]
        });
        let seeds = extract_multihop_seeds(&result, 5);
        assert_eq!(seeds[0], "c1");
        assert_eq!(seeds.len(), 2);
        assert_ne!(seeds[1], "c1");
    }

    #[test]
    fn test_extract_multihop_seeds_respects_limit_and_empty_hits() {
        let result = serde_json::json!({ "hits": [] });
        assert!(extract_multihop_seeds(&result, 5).is_empty());

        let no_hits = serde_json::json!({});
        assert!(extract_multihop_seeds(&no_hits, 5).is_empty());
    }
}
