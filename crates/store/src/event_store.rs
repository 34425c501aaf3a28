//! Typed gateway to the append-only engagement event table.
//!
//! Rows are ordered `(esp, universal_id, ts, event_type)` and logically
//! partitioned by month (`month_partition` column). Deduplication collapses
//! on `(esp, event_id, campaign_id)` — the backfill path relies on it.
//! Bot-flagged rows are excluded from engagement pulls so scanner traffic
//! never shapes a curve.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use sf_core::{
    EngagementCounters, EngagementEvent, EventType, Result, UniversalId,
};

use crate::db_err;

pub trait EventStore: Send + Sync {
    /// Insert one event. Returns false when the row was a duplicate of an
    /// already-ingested `(esp, event_id, campaign_id)`.
    fn insert_event(&self, event: &EngagementEvent) -> Result<bool>;

    /// Ascending timestamps of non-bot events of one type since `since`.
    fn event_timestamps(
        &self,
        universal_id: &UniversalId,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// Click/open recency counters relative to `now`.
    fn engagement_counters(
        &self,
        universal_id: &UniversalId,
        now: DateTime<Utc>,
    ) -> Result<EngagementCounters>;

    /// Most recent event per type, optionally restricted to `since`.
    fn latest_event_per_type(
        &self,
        universal_id: &UniversalId,
        types: &[EventType],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(EventType, DateTime<Utc>)>>;

    /// Universal IDs with at least `min_events` events since `since`,
    /// most active first.
    fn active_universal_ids(
        &self,
        min_events: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<UniversalId>>;
}

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Row metadata for one event, for diagnostics and support tooling.
    pub fn fetch_metadata(
        &self,
        esp: &str,
        event_id: &str,
        campaign_id: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                r#"
                SELECT metadata FROM engagement_events
                WHERE esp = ?1 AND event_id = ?2 AND campaign_id = ?3
                "#,
                params![esp, event_id, campaign_id.unwrap_or("")],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS engagement_events (
                esp TEXT NOT NULL,
                event_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL DEFAULT '',
                universal_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                month_partition TEXT NOT NULL,
                recipient_email_hash TEXT,
                latency_seconds REAL,
                send_time_ms INTEGER,
                hour_of_day INTEGER,
                minute INTEGER,
                day_of_week INTEGER,
                campaign_type TEXT,
                payload_size_bytes INTEGER,
                queue_depth_estimate INTEGER,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                PRIMARY KEY (esp, event_id, campaign_id)
            );

            CREATE INDEX IF NOT EXISTS idx_events_recipient
                ON engagement_events(universal_id, event_type, ts_ms);
            CREATE INDEX IF NOT EXISTS idx_events_order
                ON engagement_events(esp, universal_id, ts_ms, event_type);
            CREATE INDEX IF NOT EXISTS idx_events_partition
                ON engagement_events(month_partition);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }
}

impl EventStore for SqliteEventStore {
    fn insert_event(&self, event: &EngagementEvent) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let metadata = serde_json::to_string(&event.metadata)
            .unwrap_or_else(|_| "{}".to_string());
        let changed = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO engagement_events (
                    esp, event_id, campaign_id, universal_id, event_type,
                    ts_ms, month_partition, recipient_email_hash,
                    latency_seconds, send_time_ms, hour_of_day, minute,
                    day_of_week, campaign_type, payload_size_bytes,
                    queue_depth_estimate, metadata, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                          ?13, ?14, ?15, ?16, ?17, ?18)
                "#,
                params![
                    event.esp,
                    event.event_id,
                    event.campaign_id.clone().unwrap_or_default(),
                    event.universal_id.as_str(),
                    event.event_type.as_str(),
                    event.timestamp.timestamp_millis(),
                    event.timestamp.format("%Y-%m").to_string(),
                    event.recipient_email_hash,
                    event.latency_features.latency_seconds,
                    event
                        .latency_features
                        .send_time
                        .map(|t| t.timestamp_millis()),
                    event.latency_features.hour_of_day,
                    event.latency_features.minute,
                    event.latency_features.day_of_week,
                    event.latency_features.campaign_type,
                    event.latency_features.payload_size_bytes,
                    event.latency_features.queue_depth_estimate,
                    metadata,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    fn event_timestamps(
        &self,
        universal_id: &UniversalId,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT ts_ms FROM engagement_events
                WHERE universal_id = ?1
                  AND event_type = ?2
                  AND ts_ms >= ?3
                  AND COALESCE(json_extract(metadata, '$.suspected_bot'), 0) = 0
                ORDER BY ts_ms
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![
                    universal_id.as_str(),
                    event_type.as_str(),
                    since.timestamp_millis()
                ],
                |row| row.get::<_, i64>(0),
            )
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(ts_from_millis(row.map_err(db_err)?));
        }
        Ok(out)
    }

    fn engagement_counters(
        &self,
        universal_id: &UniversalId,
        now: DateTime<Utc>,
    ) -> Result<EngagementCounters> {
        let conn = self.conn.lock().unwrap();
        let d1 = (now - chrono::Duration::days(1)).timestamp_millis();
        let d7 = (now - chrono::Duration::days(7)).timestamp_millis();
        let d30 = (now - chrono::Duration::days(30)).timestamp_millis();

        let mut stmt = conn
            .prepare(
                r#"
                SELECT event_type,
                       MIN(ts_ms),
                       MAX(ts_ms),
                       SUM(CASE WHEN ts_ms >= ?3 THEN 1 ELSE 0 END),
                       SUM(CASE WHEN ts_ms >= ?4 THEN 1 ELSE 0 END),
                       SUM(CASE WHEN ts_ms >= ?5 THEN 1 ELSE 0 END)
                FROM engagement_events
                WHERE universal_id = ?1
                  AND event_type IN ('clicked', 'opened')
                  AND ts_ms <= ?2
                  AND COALESCE(json_extract(metadata, '$.suspected_bot'), 0) = 0
                GROUP BY event_type
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![
                    universal_id.as_str(),
                    now.timestamp_millis(),
                    d30,
                    d7,
                    d1
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .map_err(db_err)?;

        let mut counters = EngagementCounters::default();
        for row in rows {
            let (event_type, first_ms, last_ms, c30, c7, c1) = row.map_err(db_err)?;
            match event_type.as_str() {
                "clicked" => {
                    counters.clicks_1d = c1 as u64;
                    counters.clicks_7d = c7 as u64;
                    counters.clicks_30d = c30 as u64;
                    counters.first_click_ts = Some(ts_from_millis(first_ms));
                    counters.last_click_ts = Some(ts_from_millis(last_ms));
                }
                "opened" => {
                    counters.opens_1d = c1 as u64;
                    counters.opens_7d = c7 as u64;
                    counters.opens_30d = c30 as u64;
                    counters.first_open_ts = Some(ts_from_millis(first_ms));
                    counters.last_open_ts = Some(ts_from_millis(last_ms));
                }
                _ => {}
            }
        }
        Ok(counters)
    }

    fn latest_event_per_type(
        &self,
        universal_id: &UniversalId,
        types: &[EventType],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(EventType, DateTime<Utc>)>> {
        let conn = self.conn.lock().unwrap();
        let since_ms = since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let mut out = Vec::new();
        for &event_type in types {
            let latest: Option<i64> = conn
                .query_row(
                    r#"
                    SELECT MAX(ts_ms) FROM engagement_events
                    WHERE universal_id = ?1 AND event_type = ?2 AND ts_ms >= ?3
                    "#,
                    params![universal_id.as_str(), event_type.as_str(), since_ms],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()
                .map_err(db_err)?
                .flatten();
            if let Some(ms) = latest {
                out.push((event_type, ts_from_millis(ms)));
            }
        }
        // Most recent first, matching how the context pull consumes them.
        out.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(out)
    }

    fn active_universal_ids(
        &self,
        min_events: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<UniversalId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT universal_id, COUNT(*) AS event_count
                FROM engagement_events
                WHERE ts_ms >= ?1 AND universal_id != ''
                GROUP BY universal_id
                HAVING event_count >= ?2
                ORDER BY event_count DESC
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![since.timestamp_millis(), min_events as i64],
                |row| row.get::<_, String>(0),
            )
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(UniversalId::new(row.map_err(db_err)?));
        }
        Ok(out)
    }
}

fn ts_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sf_core::LatencyFeatures;

    fn make_event(event_id: &str, event_type: EventType, ts: DateTime<Utc>) -> EngagementEvent {
        EngagementEvent {
            event_id: event_id.to_string(),
            esp: "klaviyo".to_string(),
            universal_id: UniversalId::new("sf_1111111111111111"),
            event_type,
            timestamp: ts,
            recipient_email_hash: Some("a".repeat(64)),
            campaign_id: Some("c1".to_string()),
            latency_features: LatencyFeatures::default(),
            metadata: serde_json::json!({}),
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_insert_deduplicates_on_esp_event_campaign() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let event = make_event("e1", EventType::Clicked, utc(2026, 1, 5, 9, 0));
        assert!(store.insert_event(&event).unwrap());
        assert!(!store.insert_event(&event).unwrap());

        let mut other_campaign = event.clone();
        other_campaign.campaign_id = Some("c2".to_string());
        assert!(store.insert_event(&other_campaign).unwrap());
    }

    #[test]
    fn test_event_timestamps_ordered_and_filtered() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let uid = UniversalId::new("sf_1111111111111111");
        store
            .insert_event(&make_event("e2", EventType::Clicked, utc(2026, 1, 6, 10, 0)))
            .unwrap();
        store
            .insert_event(&make_event("e1", EventType::Clicked, utc(2026, 1, 5, 9, 0)))
            .unwrap();
        store
            .insert_event(&make_event("e3", EventType::Opened, utc(2026, 1, 5, 9, 30)))
            .unwrap();

        let ts = store
            .event_timestamps(&uid, EventType::Clicked, utc(2026, 1, 1, 0, 0))
            .unwrap();
        assert_eq!(ts, vec![utc(2026, 1, 5, 9, 0), utc(2026, 1, 6, 10, 0)]);

        let none = store
            .event_timestamps(&uid, EventType::Clicked, utc(2026, 2, 1, 0, 0))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_bot_flagged_events_excluded_from_pulls() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let uid = UniversalId::new("sf_1111111111111111");
        let mut bot = make_event("e1", EventType::Opened, utc(2026, 1, 5, 9, 0));
        bot.metadata = serde_json::json!({"suspected_bot": true, "bot_reasons": ["instant_open"]});
        store.insert_event(&bot).unwrap();
        store
            .insert_event(&make_event("e2", EventType::Opened, utc(2026, 1, 5, 10, 0)))
            .unwrap();

        let ts = store
            .event_timestamps(&uid, EventType::Opened, utc(2026, 1, 1, 0, 0))
            .unwrap();
        assert_eq!(ts, vec![utc(2026, 1, 5, 10, 0)]);

        let counters = store.engagement_counters(&uid, utc(2026, 1, 5, 12, 0)).unwrap();
        assert_eq!(counters.opens_1d, 1);
    }

    #[test]
    fn test_engagement_counters_windows() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let uid = UniversalId::new("sf_1111111111111111");
        let now = utc(2026, 1, 30, 12, 0);
        store
            .insert_event(&make_event("c1", EventType::Clicked, now - chrono::Duration::hours(2)))
            .unwrap();
        store
            .insert_event(&make_event("c2", EventType::Clicked, now - chrono::Duration::days(3)))
            .unwrap();
        store
            .insert_event(&make_event("c3", EventType::Clicked, now - chrono::Duration::days(20)))
            .unwrap();
        store
            .insert_event(&make_event("o1", EventType::Opened, now - chrono::Duration::days(6)))
            .unwrap();

        let counters = store.engagement_counters(&uid, now).unwrap();
        assert_eq!(counters.clicks_1d, 1);
        assert_eq!(counters.clicks_7d, 2);
        assert_eq!(counters.clicks_30d, 3);
        assert_eq!(counters.opens_7d, 1);
        assert_eq!(
            counters.last_click_ts,
            Some(now - chrono::Duration::hours(2))
        );
        assert_eq!(
            counters.first_click_ts,
            Some(now - chrono::Duration::days(20))
        );
    }

    #[test]
    fn test_latest_event_per_type_with_recency_window() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let uid = UniversalId::new("sf_1111111111111111");
        let now = utc(2026, 1, 10, 12, 0);
        store
            .insert_event(&make_event("s1", EventType::SiteVisit, now - chrono::Duration::minutes(5)))
            .unwrap();
        store
            .insert_event(&make_event("s2", EventType::SupportTicket, now - chrono::Duration::hours(1)))
            .unwrap();

        let recent = store
            .latest_event_per_type(
                &uid,
                &[EventType::SiteVisit, EventType::ProductView],
                Some(now - chrono::Duration::minutes(30)),
            )
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].0, EventType::SiteVisit);

        let all_time = store
            .latest_event_per_type(&uid, &[EventType::SupportTicket], None)
            .unwrap();
        assert_eq!(all_time.len(), 1);
    }

    #[test]
    fn test_active_universal_ids_threshold() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        for i in 0..4 {
            store
                .insert_event(&make_event(
                    &format!("e{}", i),
                    EventType::Clicked,
                    utc(2026, 1, 5, 9, i),
                ))
                .unwrap();
        }
        let mut lone = make_event("x1", EventType::Clicked, utc(2026, 1, 5, 9, 0));
        lone.universal_id = UniversalId::new("sf_2222222222222222");
        store.insert_event(&lone).unwrap();

        let active = store
            .active_universal_ids(3, utc(2026, 1, 1, 0, 0))
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].as_str(), "sf_1111111111111111");
    }
}
