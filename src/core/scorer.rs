//! Provider scoring engine
//!
//! Ranks eligible providers on every routing decision using a weighted
//! combination of remaining quota headroom, latency EMA and the static
//! preference weight. The scorer makes no I/O calls: every input arrives
//! as an argument, so identical inputs always produce identical output,
//! including the tie-break order.

use std::cmp::Ordering;

use crate::config::{RoutingWeights, WeightProfile};
use crate::core::types::Priority;

/// Latency (ms) at which the latency score reaches 0.
pub const LATENCY_CEILING_MS: f64 = 3_000.0;

/// Everything known about one provider at scoring time.
#[derive(Debug, Clone)]
pub struct ScoreInput<'a> {
    pub name: &'a str,
    pub rpm_used: u32,
    pub rpm_limit: u32,
    pub tpm_used: u64,
    pub tpm_limit: u64,
    /// Pre-flight estimate for the pending request
    pub estimated_tokens: u64,
    pub latency_ema_ms: f64,
    pub static_weight: f64,
    /// Set when the exhaustion predictor flagged this provider
    pub at_risk: bool,
}

/// Scoring result for a single provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderScore {
    pub name: String,
    pub score: f64,
    pub capacity_score: f64,
    pub latency_score: f64,
    pub static_score: f64,
    pub rpm_headroom: f64,
    pub tpm_headroom: f64,
    pub static_weight: f64,
}

/// Stateless scoring engine.
#[derive(Debug, Clone)]
pub struct Scorer {
    weights: RoutingWeights,
    reserve_fraction: f64,
}

impl Scorer {
    pub fn new(weights: RoutingWeights, reserve_fraction: f64) -> Self {
        Self {
            weights,
            reserve_fraction,
        }
    }

    /// Score a single provider for a request, or `None` when the
    /// provider must not be ranked at all:
    ///
    /// - no capacity left in either quota dimension,
    /// - flagged at-risk (unless the request is high priority),
    /// - RPM usage has eaten into the high-priority reserve and the
    ///   request is not high priority.
    pub fn score_provider(&self, input: &ScoreInput<'_>, priority: Priority) -> Option<ProviderScore> {
        // Non-high requests stop seeing a provider once its RPM usage
        // reaches the reserved fraction boundary.
        if priority != Priority::High && self.reserve_fraction > 0.0 {
            let reserve_floor = input.rpm_limit as f64 * (1.0 - self.reserve_fraction);
            if input.rpm_used as f64 >= reserve_floor {
                return None;
            }
        }

        let rpm_headroom = if input.rpm_limit > 0 {
            (1.0 - input.rpm_used as f64 / input.rpm_limit as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let tpm_projected = input.tpm_used.saturating_add(input.estimated_tokens);
        let tpm_headroom = if input.tpm_limit > 0 {
            (1.0 - tpm_projected as f64 / input.tpm_limit as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let capacity_score = rpm_headroom.min(tpm_headroom);
        if capacity_score <= 0.0 {
            return None;
        }

        if input.at_risk && priority != Priority::High {
            return None;
        }

        let latency_score = (1.0 - input.latency_ema_ms / LATENCY_CEILING_MS).max(0.0);
        let static_score = input.static_weight.clamp(0.0, 1.0);

        let WeightProfile {
            capacity,
            latency,
            static_weight,
        } = self.weights.profile(priority);

        let score =
            capacity_score * capacity + latency_score * latency + static_score * static_weight;

        Some(ProviderScore {
            name: input.name.to_string(),
            score,
            capacity_score,
            latency_score,
            static_score,
            rpm_headroom,
            tpm_headroom,
            static_weight: input.static_weight,
        })
    }

    /// Sort scores into the candidate order: score descending, ties
    /// broken by static weight descending, then name ascending.
    pub fn rank(&self, mut scores: Vec<ProviderScore>) -> Vec<ProviderScore> {
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.static_weight
                        .partial_cmp(&a.static_weight)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.name.cmp(&b.name))
        });
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> Scorer {
        Scorer::new(RoutingWeights::default(), 0.2)
    }

    fn input<'a>(name: &'a str, rpm_used: u32, tpm_used: u64) -> ScoreInput<'a> {
        ScoreInput {
            name,
            rpm_used,
            rpm_limit: 100,
            tpm_used,
            tpm_limit: 10_000,
            estimated_tokens: 100,
            latency_ema_ms: 500.0,
            static_weight: 1.0,
            at_risk: false,
        }
    }

    #[test]
    fn busier_provider_scores_lower() {
        let s = scorer();
        let a = s
            .score_provider(&input("a", 70, 7_000), Priority::Normal)
            .unwrap();
        let b = s
            .score_provider(&input("b", 10, 1_000), Priority::Normal)
            .unwrap();
        assert!(b.score > a.score);
    }

    #[test]
    fn lightly_used_provider_wins_under_normal_priority() {
        // A at 90/9000, B at 10/1000, equal latency and weight: B first.
        // (A is excluded outright for normal priority: 90 >= 80 reserve floor.)
        let s = scorer();
        let ranked = s.rank(
            [input("a", 70, 7_000), input("b", 10, 1_000)]
                .iter()
                .filter_map(|i| s.score_provider(i, Priority::Normal))
                .collect(),
        );
        assert_eq!(ranked[0].name, "b");
    }

    #[test]
    fn capacity_uses_the_bottleneck_dimension() {
        let s = scorer();
        let mut lopsided = input("a", 10, 9_500);
        lopsided.estimated_tokens = 0;
        let score = s.score_provider(&lopsided, Priority::Normal).unwrap();
        assert!((score.capacity_score - 0.05).abs() < 1e-9);
        assert!((score.rpm_headroom - 0.9).abs() < 1e-9);
    }

    #[test]
    fn estimated_tokens_count_against_tpm_headroom() {
        let s = scorer();
        let mut nearly_full = input("a", 0, 9_950);
        nearly_full.estimated_tokens = 100;
        // 9950 + 100 >= 10000: no headroom left, dropped outright
        assert!(s.score_provider(&nearly_full, Priority::Normal).is_none());
    }

    #[test]
    fn zero_headroom_is_dropped_outright() {
        let s = scorer();
        assert!(s
            .score_provider(&input("a", 0, 10_000), Priority::High)
            .is_none());
    }

    #[test]
    fn at_risk_dropped_for_normal_and_low_kept_for_high() {
        let s = scorer();
        let mut risky = input("a", 10, 1_000);
        risky.at_risk = true;
        assert!(s.score_provider(&risky, Priority::Normal).is_none());
        assert!(s.score_provider(&risky, Priority::Low).is_none());
        assert!(s.score_provider(&risky, Priority::High).is_some());
    }

    #[test]
    fn reserve_blocks_only_non_high_requests() {
        // rpm 85/100, reserve 0.2 -> floor at 80: blocked for low/normal,
        // still eligible for high.
        let s = scorer();
        let hot = input("a", 85, 1_000);
        assert!(s.score_provider(&hot, Priority::Low).is_none());
        assert!(s.score_provider(&hot, Priority::Normal).is_none());
        assert!(s.score_provider(&hot, Priority::High).is_some());

        let cool = input("b", 50, 1_000);
        assert!(s.score_provider(&cool, Priority::Low).is_some());
    }

    #[test]
    fn latency_score_floors_at_zero() {
        let s = scorer();
        let mut slow = input("a", 10, 1_000);
        slow.latency_ema_ms = 10_000.0;
        let score = s.score_provider(&slow, Priority::Normal).unwrap();
        assert_eq!(score.latency_score, 0.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let s = scorer();
        let one = s.score_provider(&input("a", 33, 3_300), Priority::High);
        let two = s.score_provider(&input("a", 33, 3_300), Priority::High);
        assert_eq!(one, two);
    }

    #[test]
    fn ties_break_by_weight_then_name() {
        let s = scorer();
        let mut heavy = input("zeta", 10, 1_000);
        heavy.static_weight = 0.9;
        let mut light = input("alpha", 10, 1_000);
        light.static_weight = 0.9;
        let mut lighter = input("beta", 10, 1_000);
        lighter.static_weight = 0.5;

        // Identical capacity/latency: zeta and alpha tie on score and
        // weight, so name ascending decides; beta's lower weight sinks it.
        let ranked = s.rank(
            [heavy, light, lighter]
                .iter()
                .filter_map(|i| s.score_provider(i, Priority::Normal))
                .collect(),
        );
        assert_eq!(ranked[0].name, "alpha");
        assert_eq!(ranked[1].name, "zeta");
        assert_eq!(ranked[2].name, "beta");
    }

    #[test]
    fn priority_profiles_shift_the_ranking() {
        // "fast" has lots of headroom and low latency but a tiny static
        // weight; "preferred" is busier and slower but heavily weighted.
        // Low priority favors the static weight, high favors the rest.
        let s = scorer();
        let mut fast = input("fast", 5, 500);
        fast.latency_ema_ms = 100.0;
        fast.static_weight = 0.1;
        let mut preferred = input("preferred", 50, 5_000);
        preferred.latency_ema_ms = 1_500.0;
        preferred.static_weight = 1.0;

        let rank_for = |priority: Priority| {
            s.rank(
                [fast.clone(), preferred.clone()]
                    .iter()
                    .filter_map(|i| s.score_provider(i, priority))
                    .collect(),
            )
        };

        assert_eq!(rank_for(Priority::High)[0].name, "fast");
        assert_eq!(rank_for(Priority::Low)[0].name, "preferred");
    }
}
