//! Real-time context signal pull: hot paths and circuit breakers.

use chrono::{DateTime, Duration, TimeZone, Utc};

use sf_core::{EventType, Result, TimingConfig, UniversalId};
use sf_store::EventStore;

/// An active circuit breaker forcing suppression until `until`.
#[derive(Debug, Clone, PartialEq)]
pub struct Suppression {
    pub reason: EventType,
    pub triggered_at: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

/// A recent hot-path event that temporarily accelerates propensity.
#[derive(Debug, Clone, PartialEq)]
pub struct HotPathSignal {
    pub signal: EventType,
    pub observed_at: DateTime<Utc>,
    pub minutes_ago: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ContextSignals {
    pub suppression: Option<Suppression>,
    pub hot_paths: Vec<HotPathSignal>,
}

/// Release sentinel for breakers with no cooling-off window.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2099, 12, 31, 23, 59, 59).unwrap()
}

/// Query recent context signals for one recipient. Circuit breakers are
/// checked over all time (spam reports never expire); hot paths only within
/// the configured recency window. When several breakers are active, the one
/// holding suppression longest wins.
pub fn pull_context(
    events: &dyn EventStore,
    config: &TimingConfig,
    universal_id: &UniversalId,
    now: DateTime<Utc>,
) -> Result<ContextSignals> {
    let breaker_types = config.circuit_breaker_types();
    let mut suppression: Option<Suppression> = None;
    for (event_type, triggered_at) in
        events.latest_event_per_type(universal_id, &breaker_types, None)?
    {
        let until = match config.circuit_breaker_windows.get(&event_type) {
            Some(Some(hours)) => triggered_at + Duration::hours(*hours),
            _ => far_future(),
        };
        if until <= now {
            continue;
        }
        let longer = suppression.as_ref().map(|s| until > s.until).unwrap_or(true);
        if longer {
            suppression = Some(Suppression {
                reason: event_type,
                triggered_at,
                until,
            });
        }
    }

    let hot_since = now - Duration::minutes(config.hot_path_window_minutes);
    let hot_paths = events
        .latest_event_per_type(universal_id, &config.hot_path_event_types, Some(hot_since))?
        .into_iter()
        .filter(|(_, ts)| *ts <= now)
        .map(|(signal, observed_at)| HotPathSignal {
            signal,
            observed_at,
            minutes_ago: (now - observed_at).num_seconds() as f64 / 60.0,
        })
        .collect();

    Ok(ContextSignals {
        suppression,
        hot_paths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_core::{EngagementEvent, LatencyFeatures};
    use sf_store::SqliteEventStore;

    fn insert(store: &SqliteEventStore, event_id: &str, event_type: EventType, ts: DateTime<Utc>) {
        store
            .insert_event(&EngagementEvent {
                event_id: event_id.to_string(),
                esp: "test".into(),
                universal_id: UniversalId::new("sf_ctx"),
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
        Utc.with_ymd_and_hms(2026, 1, 7, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_active_breaker_detected_with_window() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let uid = UniversalId::new("sf_ctx");
        insert(&store, "t1", EventType::SupportTicket, now() - Duration::hours(1));

        let ctx = pull_context(&store, &TimingConfig::default(), &uid, now()).unwrap();
        let sup = ctx.suppression.unwrap();
        assert_eq!(sup.reason, EventType::SupportTicket);
        assert_eq!(sup.until, now() - Duration::hours(1) + Duration::hours(48));
    }

    #[test]
    fn test_expired_breaker_ignored() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let uid = UniversalId::new("sf_ctx");
        insert(&store, "t1", EventType::SupportTicket, now() - Duration::hours(72));

        let ctx = pull_context(&store, &TimingConfig::default(), &uid, now()).unwrap();
        assert!(ctx.suppression.is_none());
    }

    #[test]
    fn test_spam_report_is_permanent() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let uid = UniversalId::new("sf_ctx");
        insert(&store, "s1", EventType::SpamReport, now() - Duration::days(365));

        let ctx = pull_context(&store, &TimingConfig::default(), &uid, now()).unwrap();
        let sup = ctx.suppression.unwrap();
        assert_eq!(sup.reason, EventType::SpamReport);
        assert_eq!(sup.until, far_future());
    }

    #[test]
    fn test_longest_suppression_wins() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let uid = UniversalId::new("sf_ctx");
        insert(&store, "t1", EventType::SupportTicket, now() - Duration::hours(1));
        insert(&store, "u1", EventType::UnsubscribeRequest, now() - Duration::hours(24));

        let ctx = pull_context(&store, &TimingConfig::default(), &uid, now()).unwrap();
        // 168h window from 24h ago outlasts 48h from 1h ago.
        assert_eq!(ctx.suppression.unwrap().reason, EventType::UnsubscribeRequest);
    }

    #[test]
    fn test_hot_paths_respect_recency_window() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let uid = UniversalId::new("sf_ctx");
        insert(&store, "v1", EventType::SiteVisit, now() - Duration::minutes(5));
        insert(&store, "v2", EventType::ProductView, now() - Duration::minutes(45));

        let ctx = pull_context(&store, &TimingConfig::default(), &uid, now()).unwrap();
        assert_eq!(ctx.hot_paths.len(), 1);
        assert_eq!(ctx.hot_paths[0].signal, EventType::SiteVisit);
        assert!((ctx.hot_paths[0].minutes_ago - 5.0).abs() < 1e-9);
    }
}
