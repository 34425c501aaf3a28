//! Engagement feature engine.
//!
//! Reduces a recipient's event history into a smoothed probability surface
//! over the week grid plus recency counters, and caches the result. Clicks
//! drive inference; opens are a degraded fallback for click-sparse
//! recipients (open tracking is polluted by mail privacy proxies).
//! Stateless beyond the cache; concurrent recomputes for one recipient are
//! coalesced through a single-flight guard.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use sf_core::{
    minute_grid, ContinuousCurve, FeatureSnapshot, PeakWindow, Result, TimingConfig, TimingError,
    UniversalId, MINUTES_PER_WEEK,
};
use sf_store::{EventStore, FeatureCache};

use crate::predictors::CohortPrior;
use crate::singleflight::Singleflight;

pub struct FeatureEngine {
    events: Arc<dyn EventStore>,
    cache: Arc<dyn FeatureCache>,
    cohort_prior: Option<Arc<dyn CohortPrior>>,
    config: Arc<TimingConfig>,
    inflight: Singleflight<FeatureSnapshot>,
}

impl FeatureEngine {
    pub fn new(
        events: Arc<dyn EventStore>,
        cache: Arc<dyn FeatureCache>,
        config: Arc<TimingConfig>,
    ) -> Self {
        Self {
            events,
            cache,
            cohort_prior: None,
            config,
            inflight: Singleflight::new(),
        }
    }

    pub fn with_cohort_prior(mut self, prior: Arc<dyn CohortPrior>) -> Self {
        self.cohort_prior = Some(prior);
        self
    }

    pub fn features(&self, universal_id: &UniversalId) -> Result<FeatureSnapshot> {
        self.features_at(universal_id, Utc::now())
    }

    /// Cached snapshot when fresh, otherwise a single-flighted recompute.
    /// If the event store is down and a stale snapshot exists, the stale
    /// snapshot is served; with no cache at all this is `CurveUnavailable`.
    pub fn features_at(
        &self,
        universal_id: &UniversalId,
        now: DateTime<Utc>,
    ) -> Result<FeatureSnapshot> {
        match self.cache.get(universal_id) {
            Ok(Some(snapshot))
                if snapshot.is_fresh(now, self.config.curve_cache_max_age_seconds) =>
            {
                return Ok(snapshot);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(universal_id = %universal_id, error = %e, "feature cache read failed");
            }
        }

        self.inflight.run(universal_id.as_str(), || {
            match self.compute_at(universal_id, now) {
                Ok(snapshot) => {
                    if let Err(e) = self.cache.put(&snapshot) {
                        tracing::warn!(universal_id = %universal_id, error = %e, "feature cache write failed");
                    }
                    Ok(snapshot)
                }
                Err(e) if e.is_retryable() => match self.cache.get(universal_id) {
                    Ok(Some(stale)) => {
                        tracing::warn!(universal_id = %universal_id, "serving stale curve, event store unavailable");
                        Ok(stale)
                    }
                    _ => Err(TimingError::CurveUnavailable(e.to_string())),
                },
                Err(e) => Err(e),
            }
        })
    }

    /// Full recompute, bypassing the cache read (the write still happens in
    /// `features_at`; callers of this method persist explicitly).
    pub fn compute_at(
        &self,
        universal_id: &UniversalId,
        now: DateTime<Utc>,
    ) -> Result<FeatureSnapshot> {
        let since = now - Duration::days(self.config.lookback_days);

        let mut timestamps =
            self.events
                .event_timestamps(universal_id, self.config.primary_event_type, since)?;
        let mut degraded = false;
        if timestamps.len() < self.config.fallback_min_primary_events {
            let fallback = self.events.event_timestamps(
                universal_id,
                self.config.fallback_event_type,
                since,
            )?;
            if fallback.len() > timestamps.len() {
                tracing::debug!(
                    universal_id = %universal_id,
                    primary = timestamps.len(),
                    fallback = fallback.len(),
                    "primary sample too small, using fallback events"
                );
                timestamps = fallback;
                degraded = true;
            }
        }

        let counters = self.events.engagement_counters(universal_id, now)?;

        let (curve, curve_confidence) = if timestamps.is_empty() {
            match self
                .cohort_prior
                .as_ref()
                .and_then(|p| p.prior_curve(universal_id))
            {
                Some(prior) => {
                    let confidence = prior.confidence();
                    (prior, confidence)
                }
                None => (ContinuousCurve::uniform(), 0.0),
            }
        } else {
            let mut counts = vec![0.0f64; MINUTES_PER_WEEK];
            for ts in &timestamps {
                counts[minute_grid::datetime_to_slot(*ts)] += 1.0;
            }
            let curve = ContinuousCurve::from_histogram(
                &counts,
                self.config.laplace_alpha,
                self.config.smoothing_sigma_minutes,
            )?;
            let confidence = curve.confidence();
            (curve, confidence)
        };

        let peak_windows = curve
            .top_peaks(self.config.peak_window_top_k)
            .into_iter()
            .map(|(slot, probability)| PeakWindow {
                minute_slot: slot as u16,
                probability,
                readable: minute_grid::slot_to_readable(slot),
            })
            .collect();

        Ok(FeatureSnapshot {
            universal_id: universal_id.clone(),
            curve,
            curve_confidence,
            degraded,
            counters,
            peak_windows,
            computed_at: now,
        })
    }

    /// Batch recompute for all recipients with enough recent events.
    /// Per-recipient failures are logged and skipped.
    pub fn compute_all_at(&self, min_events: u64, now: DateTime<Utc>) -> Result<usize> {
        let since = now - Duration::days(self.config.lookback_days);
        let recipients = self.events.active_universal_ids(min_events, since)?;
        let mut computed = 0usize;
        for universal_id in recipients {
            match self.compute_at(&universal_id, now) {
                Ok(snapshot) => {
                    if let Err(e) = self.cache.put(&snapshot) {
                        tracing::warn!(universal_id = %universal_id, error = %e, "cache write failed");
                        continue;
                    }
                    computed += 1;
                }
                Err(e) => {
                    tracing::warn!(universal_id = %universal_id, error = %e, "feature compute failed");
                }
            }
        }
        tracing::info!(computed, "batch feature compute finished");
        Ok(computed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sf_core::{EngagementEvent, EventType, LatencyFeatures};
    use sf_store::{SqliteEventStore, SqliteFeatureCache};

    fn make_engine() -> (Arc<SqliteEventStore>, Arc<SqliteFeatureCache>, FeatureEngine) {
        let events = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let cache = Arc::new(SqliteFeatureCache::open_in_memory().unwrap());
        let engine = FeatureEngine::new(
            events.clone(),
            cache.clone(),
            Arc::new(TimingConfig::default()),
        );
        (events, cache, engine)
    }

    fn insert(
        events: &SqliteEventStore,
        uid: &str,
        event_id: &str,
        event_type: EventType,
        ts: DateTime<Utc>,
    ) {
        events
            .insert_event(&EngagementEvent {
                event_id: event_id.to_string(),
                esp: "test".into(),
                universal_id: UniversalId::new(uid),
                event_type,
                timestamp: ts,
                recipient_email_hash: None,
                campaign_id: None,
                latency_features: LatencyFeatures::default(),
                metadata: serde_json::json!({}),
            })
            .unwrap();
    }

    fn now() -> DateTime<Utc> {
        // Wednesday.
        Utc.with_ymd_and_hms(2026, 1, 7, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_cold_start_is_uniform_with_zero_confidence() {
        let (_, _, engine) = make_engine();
        let uid = UniversalId::new("sf_cold");
        let snap = engine.features_at(&uid, now()).unwrap();
        assert_eq!(snap.curve_confidence, 0.0);
        assert!(!snap.degraded);
        let sum: f64 = snap.curve.probabilities().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(snap.curve.peak_in_window(0, 0), Some(0));
    }

    #[test]
    fn test_single_click_peaks_near_its_slot() {
        let (events, _, engine) = make_engine();
        let uid = UniversalId::new("sf_one");
        // Monday 09:00 = slot 540, two days before `now`.
        insert(&events, "sf_one", "c1", EventType::Clicked,
               Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());

        let snap = engine.features_at(&uid, now()).unwrap();
        let peak = snap.curve.peak_in_window(0, 0).unwrap();
        assert!((peak as i64 - 540).abs() <= 30);
        assert!(snap.curve_confidence > 0.0);
        assert!(!snap.degraded);
    }

    #[test]
    fn test_click_sparse_recipient_falls_back_to_opens() {
        let (events, _, engine) = make_engine();
        let uid = UniversalId::new("sf_opens");
        insert(&events, "sf_opens", "c1", EventType::Clicked,
               Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());
        for i in 0..10 {
            insert(&events, "sf_opens", &format!("o{}", i), EventType::Opened,
                   Utc.with_ymd_and_hms(2026, 1, 6, 18, i, 0).unwrap());
        }

        let snap = engine.features_at(&uid, now()).unwrap();
        assert!(snap.degraded);
        // Peak follows the opens, Tuesday evening.
        let peak = snap.curve.peak_in_window(0, 0).unwrap();
        let tuesday_18 = 1 * 1440 + 18 * 60;
        assert!((peak as i64 - tuesday_18 as i64).abs() <= 40);
    }

    #[test]
    fn test_enough_clicks_keeps_primary_signal() {
        let (events, _, engine) = make_engine();
        let uid = UniversalId::new("sf_clicks");
        for i in 0..6 {
            insert(&events, "sf_clicks", &format!("c{}", i), EventType::Clicked,
                   Utc.with_ymd_and_hms(2026, 1, 5, 9, i, 0).unwrap());
        }
        insert(&events, "sf_clicks", "o1", EventType::Opened,
               Utc.with_ymd_and_hms(2026, 1, 6, 18, 0, 0).unwrap());

        let snap = engine.features_at(&uid, now()).unwrap();
        assert!(!snap.degraded);
        assert_eq!(snap.counters.clicks_7d, 6);
    }

    #[test]
    fn test_snapshot_cached_and_reused() {
        let (events, cache, engine) = make_engine();
        let uid = UniversalId::new("sf_cached");
        insert(&events, "sf_cached", "c1", EventType::Clicked,
               Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());

        let first = engine.features_at(&uid, now()).unwrap();
        assert!(cache.get(&uid).unwrap().is_some());

        // New events do not show up until a recompute is forced (default
        // max age keeps cache valid).
        insert(&events, "sf_cached", "c2", EventType::Clicked,
               Utc.with_ymd_and_hms(2026, 1, 6, 15, 0, 0).unwrap());
        let second = engine.features_at(&uid, now() + Duration::hours(1)).unwrap();
        assert_eq!(second.computed_at, first.computed_at);
    }

    #[test]
    fn test_max_age_forces_recompute() {
        let events = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let cache = Arc::new(SqliteFeatureCache::open_in_memory().unwrap());
        let config = TimingConfig {
            curve_cache_max_age_seconds: Some(60),
            ..Default::default()
        };
        let engine = FeatureEngine::new(events.clone(), cache, Arc::new(config));
        let uid = UniversalId::new("sf_stale");

        let first = engine.features_at(&uid, now()).unwrap();
        let second = engine
            .features_at(&uid, now() + Duration::seconds(120))
            .unwrap();
        assert!(second.computed_at > first.computed_at);
    }

    #[test]
    fn test_peak_windows_have_labels() {
        let (events, _, engine) = make_engine();
        let uid = UniversalId::new("sf_labels");
        for i in 0..8 {
            insert(&events, "sf_labels", &format!("c{}", i), EventType::Clicked,
                   Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, i).unwrap());
        }
        let snap = engine.features_at(&uid, now()).unwrap();
        assert_eq!(snap.peak_windows.len(), 5);
        assert_eq!(snap.peak_windows[0].minute_slot, 540);
        assert_eq!(snap.peak_windows[0].readable, "Mon 09:00");
        assert!(snap.peak_windows[0].probability >= snap.peak_windows[1].probability);
    }

    #[test]
    fn test_compute_all_skips_sparse_recipients() {
        let (events, cache, engine) = make_engine();
        for i in 0..4 {
            insert(&events, "sf_busy", &format!("c{}", i), EventType::Clicked,
                   Utc.with_ymd_and_hms(2026, 1, 5, 9, i, 0).unwrap());
        }
        insert(&events, "sf_quiet", "c1", EventType::Clicked,
               Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());

        let computed = engine.compute_all_at(3, now()).unwrap();
        assert_eq!(computed, 1);
        assert!(cache.get(&UniversalId::new("sf_busy")).unwrap().is_some());
        assert!(cache.get(&UniversalId::new("sf_quiet")).unwrap().is_none());
    }
}
