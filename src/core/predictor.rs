//! Quota exhaustion prediction
//!
//! Watches the rate at which each provider's quota is being consumed.
//! A provider whose short-term consumption rate is well above its own
//! long-term average, and whose projected usage would cross a limit
//! within the look-ahead window, is flagged "at risk" so the scorer can
//! shift load away before the hard limit produces 429s.
//!
//! The predictor keeps its own in-process history (the same points as
//! the usage samples) so rate computation never races the state backend.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::ExhaustionConfig;

/// Tracks per-provider consumption velocity and predicts quota
/// exhaustion.
#[derive(Debug)]
pub struct ExhaustionPredictor {
    /// How long observations are retained; the long-term rate is
    /// computed over this horizon
    history: Duration,
    /// Recent sub-window for the short-term rate
    short_window: Duration,
    /// Projection distance
    lookahead: Duration,
    /// Elevation threshold: short rate vs long-term average
    multiplier: f64,
    rings: DashMap<String, VecDeque<(Instant, u64)>>,
}

impl ExhaustionPredictor {
    /// Create a predictor. `window_seconds` is the router's sliding
    /// usage window; history is retained at least twice the short
    /// sub-window so the long-term average has something to average.
    pub fn new(config: &ExhaustionConfig, window_seconds: u64) -> Self {
        let short = config.short_window_seconds.max(1);
        Self {
            history: Duration::from_secs(window_seconds.max(short * 2)),
            short_window: Duration::from_secs(short),
            lookahead: Duration::from_secs(config.lookahead_seconds),
            multiplier: config.multiplier,
            rings: DashMap::new(),
        }
    }

    /// Record a completed request for `provider`.
    pub fn record(&self, provider: &str, tokens: u64) {
        self.record_at(provider, tokens, Instant::now());
    }

    fn record_at(&self, provider: &str, tokens: u64, at: Instant) {
        let mut ring = self.rings.entry(provider.to_string()).or_default();
        ring.push_back((at, tokens));
        Self::purge(&mut ring, at, self.history);
    }

    /// Whether `provider` is projected to cross either limit within the
    /// look-ahead window under its current consumption rate. Providers
    /// with no recorded history are never at risk.
    pub fn is_at_risk(
        &self,
        provider: &str,
        rpm_used: u32,
        rpm_limit: u32,
        tpm_used: u64,
        tpm_limit: u64,
    ) -> bool {
        self.is_at_risk_at(provider, rpm_used, rpm_limit, tpm_used, tpm_limit, Instant::now())
    }

    fn is_at_risk_at(
        &self,
        provider: &str,
        rpm_used: u32,
        rpm_limit: u32,
        tpm_used: u64,
        tpm_limit: u64,
        now: Instant,
    ) -> bool {
        let mut ring = match self.rings.get_mut(provider) {
            Some(ring) => ring,
            None => return false,
        };
        Self::purge(&mut ring, now, self.history);
        let Some(&(oldest, _)) = ring.front() else {
            return false;
        };

        // Long-term rate over the whole retained history.
        let span = now.duration_since(oldest).as_secs_f64().max(1.0);
        let long_rpm = ring.len() as f64 / span * 60.0;
        let long_tpm = ring.iter().map(|&(_, t)| t).sum::<u64>() as f64 / span * 60.0;

        // Short-term rate over the recent sub-window.
        let short_count = ring
            .iter()
            .rev()
            .take_while(|&&(t, _)| now.duration_since(t) <= self.short_window)
            .count();
        let short_tokens: u64 = ring
            .iter()
            .rev()
            .take_while(|&&(t, _)| now.duration_since(t) <= self.short_window)
            .map(|&(_, t)| t)
            .sum();
        let short_span = self.short_window.as_secs_f64().min(span).max(1.0);
        let short_rpm = short_count as f64 / short_span * 60.0;
        let short_tpm = short_tokens as f64 / short_span * 60.0;

        let elevated =
            short_rpm > long_rpm * self.multiplier || short_tpm > long_tpm * self.multiplier;
        if !elevated {
            return false;
        }

        // Project the short-term rate forward over the look-ahead.
        let lookahead_min = self.lookahead.as_secs_f64() / 60.0;
        let projected_rpm = rpm_used as f64 + short_rpm * lookahead_min;
        let projected_tpm = tpm_used as f64 + short_tpm * lookahead_min;

        projected_rpm >= rpm_limit as f64 || projected_tpm >= tpm_limit as f64
    }

    fn purge(ring: &mut VecDeque<(Instant, u64)>, now: Instant, history: Duration) {
        while let Some(&(t, _)) = ring.front() {
            if now.duration_since(t) > history {
                ring.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictor() -> ExhaustionPredictor {
        ExhaustionPredictor::new(&ExhaustionConfig::default(), 60)
    }

    fn seconds_ago(now: Instant, secs: u64) -> Instant {
        now - Duration::from_secs(secs)
    }

    #[test]
    fn no_history_is_never_at_risk() {
        let p = predictor();
        assert!(!p.is_at_risk("openai", 99, 100, 9_999, 10_000));
    }

    #[test]
    fn steady_consumption_is_not_elevated() {
        // One request every 6 seconds for the whole minute: short and
        // long rates match, so nothing is flagged even near the limit.
        let p = predictor();
        let now = Instant::now() + Duration::from_secs(3600);
        for i in (0..10).rev() {
            p.record_at("openai", 100, seconds_ago(now, 6 * i));
        }
        assert!(!p.is_at_risk_at("openai", 80, 100, 8_000, 10_000, now));
    }

    #[test]
    fn burst_with_imminent_exhaustion_is_flagged() {
        // Sparse history followed by a dense burst in the last few
        // seconds; projecting the burst rate forward two minutes blows
        // through the RPM limit.
        let p = predictor();
        let now = Instant::now() + Duration::from_secs(3600);
        p.record_at("openai", 100, seconds_ago(now, 55));
        p.record_at("openai", 100, seconds_ago(now, 50));
        for i in 0..20 {
            p.record_at("openai", 100, now - Duration::from_millis(200 * (19 - i)));
        }
        assert!(p.is_at_risk_at("openai", 60, 100, 2_000, 1_000_000, now));
    }

    #[test]
    fn burst_without_projected_breach_is_not_flagged() {
        // Same elevated rate, but against limits far too large to reach
        // within the look-ahead window.
        let p = predictor();
        let now = Instant::now() + Duration::from_secs(3600);
        p.record_at("openai", 10, seconds_ago(now, 55));
        p.record_at("openai", 10, seconds_ago(now, 50));
        for i in 0..20 {
            p.record_at("openai", 10, now - Duration::from_millis(200 * (19 - i)));
        }
        assert!(!p.is_at_risk_at("openai", 60, 1_000_000, 2_000, u64::MAX, now));
    }

    #[test]
    fn token_burst_alone_can_flag() {
        // Request rate is flat but the recent requests are much larger,
        // so the TPM projection trips the flag.
        let p = predictor();
        let now = Instant::now() + Duration::from_secs(3600);
        for i in (5..10).rev() {
            p.record_at("openai", 10, seconds_ago(now, 6 * i));
        }
        for i in (0..5).rev() {
            p.record_at("openai", 5_000, seconds_ago(now, 6 * i));
        }
        assert!(p.is_at_risk_at("openai", 10, 1_000_000, 25_000, 50_000, now));
    }

    #[test]
    fn old_observations_age_out() {
        let p = predictor();
        let now = Instant::now() + Duration::from_secs(3600);
        p.record_at("openai", 100, seconds_ago(now, 600));
        // The only sample is far past the retention horizon.
        assert!(!p.is_at_risk_at("openai", 99, 100, 9_999, 10_000, now));
    }
}
