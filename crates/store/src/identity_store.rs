//! Persistence for the identity edge graph, resolution cache, and
//! append-only audit log.
//!
//! Edges are keyed on the unordered identifier pair: the pair is
//! canonicalized before writing, re-inserting an existing edge refreshes
//! `updated_at` and keeps the maximum weight seen. The resolution cache is
//! last-writer-wins on `last_seen`; `created_at` survives updates so
//! conflict merges can pick the older universal ID.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use sf_core::{
    AuditRecord, Identifier, IdentifierType, IdentityEdge, ResolutionEntry, Result, TimingError,
    UniversalId,
};

use crate::db_err;

pub trait IdentityStore: Send + Sync {
    /// Idempotent upsert on the unordered pair.
    fn upsert_edge(&self, edge: &IdentityEdge) -> Result<()>;

    /// All identifiers connected to `of` by one edge, with edge weights.
    fn neighbors(&self, of: &Identifier) -> Result<Vec<(Identifier, f64)>>;

    fn cached_resolution(&self, identifier: &Identifier) -> Result<Option<ResolutionEntry>>;

    /// Last-writer-wins on `last_seen`; `created_at` is preserved for
    /// existing rows.
    fn cache_resolution(&self, entry: &ResolutionEntry) -> Result<()>;

    fn append_audit(&self, record: &AuditRecord) -> Result<()>;

    fn audit_for_resolution(&self, resolution_id: &str) -> Result<Vec<AuditRecord>>;

    fn audit_for_universal_id(&self, universal_id: &UniversalId) -> Result<Vec<AuditRecord>>;

    /// All cache rows currently pointing at `universal_id`.
    fn identifiers_for(&self, universal_id: &UniversalId) -> Result<Vec<ResolutionEntry>>;

    /// Total edge rows; used to verify merge idempotence.
    fn edge_count(&self) -> Result<u64>;
}

pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
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

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS identity_graph (
                identifier_a TEXT NOT NULL,
                type_a TEXT NOT NULL,
                identifier_b TEXT NOT NULL,
                type_b TEXT NOT NULL,
                weight REAL NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (identifier_a, type_a, identifier_b, type_b)
            );
            CREATE INDEX IF NOT EXISTS idx_graph_b
                ON identity_graph(identifier_b, type_b);

            CREATE TABLE IF NOT EXISTS resolved_identities (
                identifier TEXT NOT NULL,
                identifier_type TEXT NOT NULL,
                universal_id TEXT NOT NULL,
                confidence REAL NOT NULL,
                last_seen TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (identifier, identifier_type)
            );
            CREATE INDEX IF NOT EXISTS idx_resolved_uid
                ON resolved_identities(universal_id);

            CREATE TABLE IF NOT EXISTS identity_audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resolution_id TEXT NOT NULL,
                universal_id TEXT NOT NULL,
                input_identifier TEXT NOT NULL,
                input_type TEXT NOT NULL,
                step TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_resolution
                ON identity_audit_log(resolution_id);
            CREATE INDEX IF NOT EXISTS idx_audit_uid
                ON identity_audit_log(universal_id);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }
}

/// Canonical storage order for the unordered pair.
fn canonical<'a>(edge: &'a IdentityEdge) -> (&'a Identifier, &'a Identifier) {
    let ka = (&edge.a.value, edge.a.id_type.as_str());
    let kb = (&edge.b.value, edge.b.id_type.as_str());
    if ka <= kb {
        (&edge.a, &edge.b)
    } else {
        (&edge.b, &edge.a)
    }
}

fn parse_type(s: &str) -> Result<IdentifierType> {
    IdentifierType::parse(s)
        .ok_or_else(|| TimingError::BackendUnavailable(format!("unknown identifier type: {}", s)))
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl IdentityStore for SqliteIdentityStore {
    fn upsert_edge(&self, edge: &IdentityEdge) -> Result<()> {
        let (a, b) = canonical(edge);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO identity_graph (
                identifier_a, type_a, identifier_b, type_b,
                weight, source, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(identifier_a, type_a, identifier_b, type_b) DO UPDATE SET
                weight = MAX(identity_graph.weight, excluded.weight),
                updated_at = excluded.updated_at
            "#,
            params![
                a.value,
                a.id_type.as_str(),
                b.value,
                b.id_type.as_str(),
                edge.weight,
                edge.source,
                edge.created_at.to_rfc3339(),
                edge.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn neighbors(&self, of: &Identifier) -> Result<Vec<(Identifier, f64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT identifier_b, type_b, weight FROM identity_graph
                WHERE identifier_a = ?1 AND type_a = ?2
                UNION ALL
                SELECT identifier_a, type_a, weight FROM identity_graph
                WHERE identifier_b = ?1 AND type_b = ?2
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![of.value, of.id_type.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (value, type_str, weight) = row.map_err(db_err)?;
            out.push((Identifier::new(parse_type(&type_str)?, value), weight));
        }
        // Highest-weight edges first; the resolver explores in this order.
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    fn cached_resolution(&self, identifier: &Identifier) -> Result<Option<ResolutionEntry>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT universal_id, confidence, last_seen, created_at
            FROM resolved_identities
            WHERE identifier = ?1 AND identifier_type = ?2
            "#,
            params![identifier.value, identifier.id_type.as_str()],
            |row| {
                Ok(ResolutionEntry {
                    identifier: identifier.clone(),
                    universal_id: UniversalId::new(row.get::<_, String>(0)?),
                    confidence: row.get(1)?,
                    last_seen: parse_ts(&row.get::<_, String>(2)?),
                    created_at: parse_ts(&row.get::<_, String>(3)?),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn cache_resolution(&self, entry: &ResolutionEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO resolved_identities (
                identifier, identifier_type, universal_id,
                confidence, last_seen, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(identifier, identifier_type) DO UPDATE SET
                universal_id = excluded.universal_id,
                confidence = excluded.confidence,
                last_seen = excluded.last_seen
            "#,
            params![
                entry.identifier.value,
                entry.identifier.id_type.as_str(),
                entry.universal_id.as_str(),
                entry.confidence,
                entry.last_seen.to_rfc3339(),
                entry.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO identity_audit_log (
                resolution_id, universal_id, input_identifier,
                input_type, step, confidence, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.resolution_id,
                record.universal_id.as_str(),
                record.input_identifier,
                record.input_type.as_str(),
                record.step,
                record.confidence,
                record.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn audit_for_resolution(&self, resolution_id: &str) -> Result<Vec<AuditRecord>> {
        self.audit_query(
            "SELECT resolution_id, universal_id, input_identifier, input_type, step, confidence, created_at
             FROM identity_audit_log WHERE resolution_id = ?1 ORDER BY id",
            resolution_id,
        )
    }

    fn audit_for_universal_id(&self, universal_id: &UniversalId) -> Result<Vec<AuditRecord>> {
        self.audit_query(
            "SELECT resolution_id, universal_id, input_identifier, input_type, step, confidence, created_at
             FROM identity_audit_log WHERE universal_id = ?1 ORDER BY id",
            universal_id.as_str(),
        )
    }

    fn identifiers_for(&self, universal_id: &UniversalId) -> Result<Vec<ResolutionEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT identifier, identifier_type, confidence, last_seen, created_at
                FROM resolved_identities
                WHERE universal_id = ?1
                ORDER BY last_seen DESC
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![universal_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (value, type_str, confidence, last_seen, created_at) = row.map_err(db_err)?;
            out.push(ResolutionEntry {
                identifier: Identifier::new(parse_type(&type_str)?, value),
                universal_id: universal_id.clone(),
                confidence,
                last_seen: parse_ts(&last_seen),
                created_at: parse_ts(&created_at),
            });
        }
        Ok(out)
    }

    fn edge_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM identity_graph", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .map_err(db_err)
    }
}

impl SqliteIdentityStore {
    fn audit_query(&self, sql: &str, param: &str) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![param], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (resolution_id, universal_id, input_identifier, input_type, step, confidence, created_at) =
                row.map_err(db_err)?;
            out.push(AuditRecord {
                resolution_id,
                universal_id: UniversalId::new(universal_id),
                input_identifier,
                input_type: parse_type(&input_type)?,
                step,
                confidence,
                created_at: parse_ts(&created_at),
            });
        }
        Ok(out)
    }
}
