//! Configuration surface for the timing layer. All knobs default to the
//! values the engines were tuned with; deployments override via a JSON
//! config file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::EventType;
use crate::identifier::IdentifierType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    // Feature engine
    pub smoothing_sigma_minutes: f64,
    pub laplace_alpha: f64,
    pub lookback_days: i64,
    pub primary_event_type: EventType,
    pub fallback_event_type: EventType,
    /// Fall back to the secondary event type when the primary sample is
    /// smaller than this.
    pub fallback_min_primary_events: usize,
    pub peak_window_top_k: usize,
    /// None = cached curves stay valid until an explicit recompute.
    pub curve_cache_max_age_seconds: Option<i64>,

    // Context signals
    pub hot_path_event_types: Vec<EventType>,
    pub hot_path_window_minutes: i64,
    /// Cooling-off window in hours per circuit-breaker event type;
    /// None = permanent suppression.
    pub circuit_breaker_windows: BTreeMap<EventType, Option<i64>>,

    // Identity resolution
    pub probabilistic_weights: BTreeMap<IdentifierType, f64>,
    pub bfs_depth: usize,
    pub bfs_budget: usize,
    pub phone_default_region: String,
    /// When false the resolver returns IdentityUnresolved instead of
    /// synthesizing a new universal ID.
    pub allow_synthesis: bool,

    // Decision engine
    pub default_latency_seconds: f64,
    pub latency_clamp_min_seconds: f64,
    pub latency_clamp_max_seconds: f64,
    pub decision_deadline_ms: u64,

    // Ingestion
    pub ingest_max_retries: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        let mut circuit_breaker_windows = BTreeMap::new();
        circuit_breaker_windows.insert(EventType::SupportTicket, Some(48));
        circuit_breaker_windows.insert(EventType::Complained, Some(48));
        circuit_breaker_windows.insert(EventType::UnsubscribeRequest, Some(168));
        circuit_breaker_windows.insert(EventType::SpamReport, None);

        let mut probabilistic_weights = BTreeMap::new();
        probabilistic_weights.insert(IdentifierType::KlaviyoId, 0.95);
        probabilistic_weights.insert(IdentifierType::ShopifyCustomerId, 0.90);
        probabilistic_weights.insert(IdentifierType::EspUserId, 0.85);
        probabilistic_weights.insert(IdentifierType::IpDeviceSignature, 0.50);

        Self {
            smoothing_sigma_minutes: 30.0,
            laplace_alpha: 1.0,
            lookback_days: 90,
            primary_event_type: EventType::Clicked,
            fallback_event_type: EventType::Opened,
            fallback_min_primary_events: 5,
            peak_window_top_k: 5,
            curve_cache_max_age_seconds: None,
            hot_path_event_types: vec![
                EventType::SiteVisit,
                EventType::SmsClick,
                EventType::ProductView,
                EventType::CartAdd,
                EventType::SearchPerformed,
            ],
            hot_path_window_minutes: 30,
            circuit_breaker_windows,
            probabilistic_weights,
            bfs_depth: 3,
            bfs_budget: 128,
            phone_default_region: "US".to_string(),
            allow_synthesis: true,
            default_latency_seconds: 120.0,
            latency_clamp_min_seconds: 1.0,
            latency_clamp_max_seconds: 3600.0,
            decision_deadline_ms: 1000,
            ingest_max_retries: 3,
        }
    }
}

impl TimingConfig {
    /// Effective weight for an identifier type: configured override for
    /// probabilistic types, 1.0 for deterministic ones.
    pub fn identifier_weight(&self, id_type: IdentifierType) -> f64 {
        if id_type.is_deterministic() {
            return 1.0;
        }
        self.probabilistic_weights
            .get(&id_type)
            .copied()
            .unwrap_or_else(|| id_type.default_weight())
    }

    pub fn circuit_breaker_types(&self) -> Vec<EventType> {
        self.circuit_breaker_windows.keys().copied().collect()
    }
}
