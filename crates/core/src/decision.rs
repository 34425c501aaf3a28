//! Timing decision records and the append-only explanation row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::universal_id::UniversalId;

/// Stamped on every decision so a support interaction can recover which
/// inference path produced it.
pub const MODEL_VERSION: &str = "minute_level_click_based";

/// One contextual weight that participated in the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedWeight {
    pub signal: String,
    pub magnitude: f64,
    pub minutes_ago: f64,
}

/// The primary output of the timing layer. Append-only once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingDecision {
    pub decision_id: String,
    pub universal_id: UniversalId,
    /// Canonical minute slot in [0, 10079].
    pub target_minute: u16,
    /// Instant at which the delivery gateway should fire, latency already
    /// subtracted. For suppressed decisions this is the suppression release
    /// instant with no latency subtraction.
    pub trigger_timestamp_utc: DateTime<Utc>,
    pub latency_estimate_seconds: f64,
    pub confidence_score: f64,
    pub model_version: String,
    pub base_curve_peak_minute: u16,
    pub applied_weights: Vec<AppliedWeight>,
    pub suppressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_until: Option<DateTime<Utc>>,
    pub explanation_ref: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Row of the `timing_explanations` table; enough to reconstruct the
/// derivation of one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingExplanation {
    pub decision_id: String,
    pub explanation_ref: String,
    pub universal_id: UniversalId,
    pub target_minute: u16,
    pub trigger_timestamp_utc: DateTime<Utc>,
    pub latency_estimate_seconds: f64,
    pub confidence_score: f64,
    pub model_version: String,
    pub base_curve_peak_minute: u16,
    pub applied_weights: Vec<AppliedWeight>,
    pub suppressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot_path_signal: Option<String>,
    pub hot_path_weight: f64,
    pub created_at_utc: DateTime<Utc>,
}

impl TimingExplanation {
    /// Build the explanation row for a decision. The strongest accelerating
    /// signal is denormalized into its own columns.
    pub fn for_decision(decision: &TimingDecision) -> Self {
        let strongest = decision
            .applied_weights
            .iter()
            .max_by(|a, b| a.magnitude.partial_cmp(&b.magnitude).unwrap());
        Self {
            decision_id: decision.decision_id.clone(),
            explanation_ref: decision.explanation_ref.clone(),
            universal_id: decision.universal_id.clone(),
            target_minute: decision.target_minute,
            trigger_timestamp_utc: decision.trigger_timestamp_utc,
            latency_estimate_seconds: decision.latency_estimate_seconds,
            confidence_score: decision.confidence_score,
            model_version: decision.model_version.clone(),
            base_curve_peak_minute: decision.base_curve_peak_minute,
            applied_weights: decision.applied_weights.clone(),
            suppressed: decision.suppressed,
            suppression_reason: decision.suppression_reason.clone(),
            suppression_until: decision.suppression_until,
            hot_path_signal: strongest.map(|w| w.signal.clone()),
            hot_path_weight: strongest.map(|w| w.magnitude).unwrap_or(0.0),
            created_at_utc: decision.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_decision() -> TimingDecision {
        TimingDecision {
            decision_id: "d1".into(),
            universal_id: UniversalId::new("sf_0123456789abcdef"),
            target_minute: 540,
            trigger_timestamp_utc: Utc::now(),
            latency_estimate_seconds: 120.0,
            confidence_score: 0.4,
            model_version: MODEL_VERSION.into(),
            base_curve_peak_minute: 540,
            applied_weights: vec![
                AppliedWeight {
                    signal: "site_visit".into(),
                    magnitude: 1.4,
                    minutes_ago: 5.0,
                },
                AppliedWeight {
                    signal: "product_view".into(),
                    magnitude: 0.6,
                    minutes_ago: 20.0,
                },
            ],
            suppressed: false,
            suppression_reason: None,
            suppression_until: None,
            explanation_ref: "explain:sf_0123456789abcdef:d1".into(),
            warnings: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_explanation_denormalizes_strongest_signal() {
        let explanation = TimingExplanation::for_decision(&make_decision());
        assert_eq!(explanation.hot_path_signal.as_deref(), Some("site_visit"));
        assert!((explanation.hot_path_weight - 1.4).abs() < 1e-12);
        assert_eq!(explanation.applied_weights.len(), 2);
    }

    #[test]
    fn test_decision_serializes_snake_case() {
        let json = serde_json::to_value(make_decision()).unwrap();
        assert!(json.get("target_minute").is_some());
        assert!(json.get("trigger_timestamp_utc").is_some());
        assert!(json.get("suppression_reason").is_none()); // skipped when None
    }
}
