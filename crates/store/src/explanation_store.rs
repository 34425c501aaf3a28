//! Append-only log of timing-decision explanations.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use sf_core::{Result, TimingError, TimingExplanation, UniversalId};

use crate::db_err;

pub trait ExplanationLog: Send + Sync {
    fn append(&self, explanation: &TimingExplanation) -> Result<()>;

    fn by_ref(&self, explanation_ref: &str) -> Result<Option<TimingExplanation>>;
}

pub struct SqliteExplanationLog {
    conn: Mutex<Connection>,
}

impl SqliteExplanationLog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;
        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS timing_explanations (
                decision_id TEXT PRIMARY KEY,
                explanation_ref TEXT NOT NULL,
                universal_id TEXT NOT NULL,
                target_minute INTEGER NOT NULL,
                trigger_timestamp_utc TEXT NOT NULL,
                latency_estimate_seconds REAL NOT NULL,
                confidence_score REAL NOT NULL,
                model_version TEXT NOT NULL,
                base_curve_peak_minute INTEGER NOT NULL,
                applied_weights TEXT NOT NULL,
                suppressed INTEGER NOT NULL,
                suppression_reason TEXT,
                suppression_until TEXT,
                hot_path_signal TEXT,
                hot_path_weight REAL NOT NULL DEFAULT 0,
                created_at_utc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_explanations_ref
                ON timing_explanations(explanation_ref);
            CREATE INDEX IF NOT EXISTS idx_explanations_uid
                ON timing_explanations(universal_id, created_at_utc);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TimingError::BackendUnavailable(format!("corrupt timestamp: {}", e)))
}

impl ExplanationLog for SqliteExplanationLog {
    fn append(&self, explanation: &TimingExplanation) -> Result<()> {
        let weights = serde_json::to_string(&explanation.applied_weights)
            .map_err(|e| TimingError::BackendUnavailable(format!("encode weights: {}", e)))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO timing_explanations (
                decision_id, explanation_ref, universal_id, target_minute,
                trigger_timestamp_utc, latency_estimate_seconds,
                confidence_score, model_version, base_curve_peak_minute,
                applied_weights, suppressed, suppression_reason,
                suppression_until, hot_path_signal, hot_path_weight,
                created_at_utc
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                      ?13, ?14, ?15, ?16)
            "#,
            params![
                explanation.decision_id,
                explanation.explanation_ref,
                explanation.universal_id.as_str(),
                explanation.target_minute,
                explanation.trigger_timestamp_utc.to_rfc3339(),
                explanation.latency_estimate_seconds,
                explanation.confidence_score,
                explanation.model_version,
                explanation.base_curve_peak_minute,
                weights,
                explanation.suppressed as i64,
                explanation.suppression_reason,
                explanation.suppression_until.map(|t| t.to_rfc3339()),
                explanation.hot_path_signal,
                explanation.hot_path_weight,
                explanation.created_at_utc.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn by_ref(&self, explanation_ref: &str) -> Result<Option<TimingExplanation>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT decision_id, explanation_ref, universal_id, target_minute,
                       trigger_timestamp_utc, latency_estimate_seconds,
                       confidence_score, model_version, base_curve_peak_minute,
                       applied_weights, suppressed, suppression_reason,
                       suppression_until, hot_path_signal, hot_path_weight,
                       created_at_utc
                FROM timing_explanations
                WHERE explanation_ref = ?1
                "#,
                params![explanation_ref],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, i64>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, Option<String>>(12)?,
                        row.get::<_, Option<String>>(13)?,
                        row.get::<_, f64>(14)?,
                        row.get::<_, String>(15)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some(row) = row else { return Ok(None) };
        let applied_weights = serde_json::from_str(&row.9)
            .map_err(|e| TimingError::BackendUnavailable(format!("corrupt weights: {}", e)))?;
        Ok(Some(TimingExplanation {
            decision_id: row.0,
            explanation_ref: row.1,
            universal_id: UniversalId::new(row.2),
            target_minute: row.3 as u16,
            trigger_timestamp_utc: parse_ts(&row.4)?,
            latency_estimate_seconds: row.5,
            confidence_score: row.6,
            model_version: row.7,
            base_curve_peak_minute: row.8 as u16,
            applied_weights,
            suppressed: row.10 != 0,
            suppression_reason: row.11,
            suppression_until: match row.12 {
                Some(s) => Some(parse_ts(&s)?),
                None => None,
            },
            hot_path_signal: row.13,
            hot_path_weight: row.14,
            created_at_utc: parse_ts(&row.15)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_core::{AppliedWeight, MODEL_VERSION};

    fn make_explanation(decision_id: &str) -> TimingExplanation {
        TimingExplanation {
            decision_id: decision_id.to_string(),
            explanation_ref: format!("explain:sf_x:{}", decision_id),
            universal_id: UniversalId::new("sf_x"),
            target_minute: 540,
            trigger_timestamp_utc: Utc::now(),
            latency_estimate_seconds: 120.0,
            confidence_score: 0.42,
            model_version: MODEL_VERSION.to_string(),
            base_curve_peak_minute: 540,
            applied_weights: vec![AppliedWeight {
                signal: "site_visit".into(),
                magnitude: 1.43,
                minutes_ago: 5.0,
            }],
            suppressed: false,
            suppression_reason: None,
            suppression_until: None,
            hot_path_signal: Some("site_visit".into()),
            hot_path_weight: 1.43,
            created_at_utc: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_fetch_by_ref() {
        let log = SqliteExplanationLog::open_in_memory().unwrap();
        let explanation = make_explanation("d1");
        log.append(&explanation).unwrap();

        let loaded = log.by_ref(&explanation.explanation_ref).unwrap().unwrap();
        assert_eq!(loaded.decision_id, "d1");
        assert_eq!(loaded.target_minute, 540);
        assert_eq!(loaded.applied_weights.len(), 1);
        assert_eq!(loaded.hot_path_signal.as_deref(), Some("site_visit"));
    }

    #[test]
    fn test_missing_ref_is_none() {
        let log = SqliteExplanationLog::open_in_memory().unwrap();
        assert!(log.by_ref("explain:nobody:d0").unwrap().is_none());
    }
}
