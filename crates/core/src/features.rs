//! Cached feature snapshot for a universal ID: the serialized engagement
//! curve plus counters and a peak-windows summary for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::curve::ContinuousCurve;
use crate::event::EngagementCounters;
use crate::universal_id::UniversalId;

/// One entry of the top-K peak summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakWindow {
    pub minute_slot: u16,
    pub probability: f64,
    pub readable: String,
}

#[derive(Debug, Clone)]
pub struct FeatureSnapshot {
    pub universal_id: UniversalId,
    pub curve: ContinuousCurve,
    pub curve_confidence: f64,
    /// True when the engine fell back to `opened` events because the
    /// primary event sample was too small.
    pub degraded: bool,
    pub counters: EngagementCounters,
    pub peak_windows: Vec<PeakWindow>,
    pub computed_at: DateTime<Utc>,
}

impl FeatureSnapshot {
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age_seconds: Option<i64>) -> bool {
        match max_age_seconds {
            None => true,
            Some(max) => (now - self.computed_at).num_seconds() < max,
        }
    }
}

/// API-facing summary of a snapshot: everything except the raw 10,080
/// entry vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub universal_id: UniversalId,
    pub curve_confidence: f64,
    pub degraded: bool,
    pub counters: EngagementCounters,
    pub peak_windows: Vec<PeakWindow>,
    pub computed_at: DateTime<Utc>,
}

impl From<&FeatureSnapshot> for FeatureSummary {
    fn from(snap: &FeatureSnapshot) -> Self {
        Self {
            universal_id: snap.universal_id.clone(),
            curve_confidence: snap.curve_confidence,
            degraded: snap.degraded,
            counters: snap.counters.clone(),
            peak_windows: snap.peak_windows.clone(),
            computed_at: snap.computed_at,
        }
    }
}
