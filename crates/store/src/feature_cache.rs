//! Keyed binary cache for serialized engagement curves and counters.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use sf_core::{ContinuousCurve, FeatureSnapshot, Result, TimingError, UniversalId};

use crate::db_err;

pub trait FeatureCache: Send + Sync {
    fn get(&self, universal_id: &UniversalId) -> Result<Option<FeatureSnapshot>>;

    /// Replace-on-write; the key is the universal ID.
    fn put(&self, snapshot: &FeatureSnapshot) -> Result<()>;
}

pub struct SqliteFeatureCache {
    conn: Mutex<Connection>,
}

impl SqliteFeatureCache {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS feature_cache (
                universal_id TEXT PRIMARY KEY,
                curve BLOB NOT NULL,
                curve_confidence REAL NOT NULL,
                degraded INTEGER NOT NULL,
                counters TEXT NOT NULL,
                peak_windows TEXT NOT NULL,
                computed_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }
}

impl FeatureCache for SqliteFeatureCache {
    fn get(&self, universal_id: &UniversalId) -> Result<Option<FeatureSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT curve, curve_confidence, degraded, counters, peak_windows, computed_at
                FROM feature_cache WHERE universal_id = ?1
                "#,
                params![universal_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((curve_bytes, curve_confidence, degraded, counters, peaks, computed_at)) = row
        else {
            return Ok(None);
        };

        let curve = ContinuousCurve::from_bytes(&curve_bytes)?;
        let counters = serde_json::from_str(&counters)
            .map_err(|e| TimingError::BackendUnavailable(format!("corrupt counters: {}", e)))?;
        let peak_windows = serde_json::from_str(&peaks)
            .map_err(|e| TimingError::BackendUnavailable(format!("corrupt peaks: {}", e)))?;
        let computed_at = DateTime::parse_from_rfc3339(&computed_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| TimingError::BackendUnavailable(format!("corrupt timestamp: {}", e)))?;

        Ok(Some(FeatureSnapshot {
            universal_id: universal_id.clone(),
            curve_confidence,
            curve,
            degraded: degraded != 0,
            counters,
            peak_windows,
            computed_at,
        }))
    }

    fn put(&self, snapshot: &FeatureSnapshot) -> Result<()> {
        let counters = serde_json::to_string(&snapshot.counters)
            .map_err(|e| TimingError::BackendUnavailable(format!("encode counters: {}", e)))?;
        let peaks = serde_json::to_string(&snapshot.peak_windows)
            .map_err(|e| TimingError::BackendUnavailable(format!("encode peaks: {}", e)))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO feature_cache (
                universal_id, curve, curve_confidence, degraded,
                counters, peak_windows, computed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                snapshot.universal_id.as_str(),
                snapshot.curve.to_bytes(),
                snapshot.curve_confidence,
                snapshot.degraded as i64,
                counters,
                peaks,
                snapshot.computed_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}
