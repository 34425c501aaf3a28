//! Pluggable ML predictor ports.
//!
//! The decision engine consumes these through trait objects; trained models
//! plug in from the outside. The heuristics below are the documented
//! fallbacks when no model is loaded, and their use is surfaced as a
//! warning on the decision rather than an error.

use chrono::{DateTime, Timelike, Utc};

use sf_core::{ContinuousCurve, EventType, UniversalId};

/// Features available to the latency predictor at decision time.
#[derive(Debug, Clone, Default)]
pub struct LatencyContext {
    pub esp: Option<String>,
    pub campaign_type: Option<String>,
    pub payload_size_bytes: Option<u64>,
    pub queue_depth_estimate: Option<u64>,
}

pub trait LatencyPredictor: Send + Sync {
    /// Expected gateway latency in seconds for a send fired at `now`.
    /// The engine clamps the result to its configured bounds.
    fn predict(&self, ctx: &LatencyContext, now: DateTime<Utc>, default_seconds: f64) -> f64;
}

/// Median-recent-latency heuristic with congestion penalties.
pub struct HeuristicLatency;

impl LatencyPredictor for HeuristicLatency {
    fn predict(&self, ctx: &LatencyContext, now: DateTime<Utc>, default_seconds: f64) -> f64 {
        let mut latency = default_seconds;

        // Top-of-hour congestion.
        if now.minute() <= 2 {
            latency *= 1.8;
        }
        // Morning/evening batch pressure.
        if matches!(now.hour(), 8 | 9 | 18 | 19) {
            latency *= 1.5;
        }
        // Up to +20% for large payloads.
        if let Some(bytes) = ctx.payload_size_bytes {
            latency *= 1.0 + (bytes as f64 / (2.0 * 1024.0 * 1024.0)).min(0.2);
        }
        latency
    }
}

pub trait SignalWeightPredictor: Send + Sync {
    /// Contextual acceleration weight for a hot-path signal observed
    /// `minutes_ago` minutes before the decision. Never negative.
    fn weight(&self, signal: EventType, minutes_ago: f64) -> f64;
}

/// Exponential-decay heuristic: `2.0 * exp(-minutes_ago / 15)`.
pub struct HeuristicSignalWeight;

impl SignalWeightPredictor for HeuristicSignalWeight {
    fn weight(&self, _signal: EventType, minutes_ago: f64) -> f64 {
        (2.0 * (-minutes_ago.max(0.0) / 15.0).exp()).max(0.0)
    }
}

/// Optional cohort prior for cold-start recipients. When no implementation
/// is wired in (or it abstains), the feature engine falls back to the
/// uniform curve with confidence 0.
pub trait CohortPrior: Send + Sync {
    fn prior_curve(&self, universal_id: &UniversalId) -> Option<ContinuousCurve>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_heuristic_latency_quiet_period_keeps_default() {
        let now = Utc.with_ymd_and_hms(2026, 1, 7, 14, 30, 0).unwrap();
        let latency = HeuristicLatency.predict(&LatencyContext::default(), now, 120.0);
        assert_eq!(latency, 120.0);
    }

    #[test]
    fn test_heuristic_latency_congestion_penalties() {
        let top_of_hour = Utc.with_ymd_and_hms(2026, 1, 7, 14, 1, 0).unwrap();
        assert_eq!(
            HeuristicLatency.predict(&LatencyContext::default(), top_of_hour, 100.0),
            180.0
        );

        let morning_batch = Utc.with_ymd_and_hms(2026, 1, 7, 9, 30, 0).unwrap();
        assert_eq!(
            HeuristicLatency.predict(&LatencyContext::default(), morning_batch, 100.0),
            150.0
        );
    }

    #[test]
    fn test_heuristic_latency_payload_adjustment_caps() {
        let now = Utc.with_ymd_and_hms(2026, 1, 7, 14, 30, 0).unwrap();
        let ctx = LatencyContext {
            payload_size_bytes: Some(100 * 1024 * 1024),
            ..Default::default()
        };
        let latency = HeuristicLatency.predict(&ctx, now, 100.0);
        assert!((latency - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_heuristic_signal_weight_decay() {
        let w0 = HeuristicSignalWeight.weight(EventType::SiteVisit, 0.0);
        assert!((w0 - 2.0).abs() < 1e-12);

        let w5 = HeuristicSignalWeight.weight(EventType::SiteVisit, 5.0);
        assert!((w5 - 2.0 * (-5.0f64 / 15.0).exp()).abs() < 1e-12);
        assert!(w5 > 1.4 && w5 < 1.5);

        let w_old = HeuristicSignalWeight.weight(EventType::SiteVisit, 600.0);
        assert!(w_old >= 0.0 && w_old < 0.001);
    }
}
