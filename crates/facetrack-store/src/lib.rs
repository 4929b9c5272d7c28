//! facetrack-store: SQLite persistence for enrollments, rosters and attendance.
//!
//! Embeddings are stored as little-endian f32 blobs. The configured embedding
//! dimension is pinned in a `meta` row on first open; reopening with a different
//! dimension fails instead of mixing vector spaces.

use chrono::{DateTime, SecondsFormat, Utc};
use facetrack_core::store::new_enrollment;
use facetrack_core::{
    Embedding, Enrollment, EnrollmentId, IdentityId, RosterError, RosterSource, ScanReport, Scope,
    StoreError, VectorOrigin, VectorStore,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

/// Max bound parameters per bulk lookup statement.
const BULK_CHUNK: usize = 500;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS enrollment (
    enrollment_id TEXT PRIMARY KEY,
    identity_id   INTEGER NOT NULL,
    embedding     BLOB NOT NULL,
    model_version TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_enrollment_identity ON enrollment(identity_id);
CREATE TABLE IF NOT EXISTS roster_member (
    scope       TEXT NOT NULL,
    identity_id INTEGER NOT NULL,
    PRIMARY KEY (scope, identity_id)
);
CREATE TABLE IF NOT EXISTS attendance_log (
    session_id  INTEGER NOT NULL,
    identity_id INTEGER NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('present', 'absent')),
    timestamp   TEXT,
    score       REAL,
    PRIMARY KEY (session_id, identity_id)
);
";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database was created for {stored}-dim embeddings, configured for {configured}")]
    DimensionChanged { stored: usize, configured: usize },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database lock poisoned")]
    Poisoned,
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<DbError> for RosterError {
    fn from(e: DbError) -> Self {
        RosterError::Backend(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(Self::Present),
            "absent" => Ok(Self::Absent),
            other => Err(DbError::Corrupt(format!("attendance status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub session_id: i64,
    pub identity: IdentityId,
    pub status: AttendanceStatus,
    pub timestamp: Option<DateTime<Utc>>,
    /// Match distance that marked the identity present.
    pub score: Option<f32>,
}

/// Enrollment, roster and attendance tables behind one connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    dimension: usize,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, DbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), dimension, "opened enrollment database");
        Self::init(conn, dimension)
    }

    pub fn open_in_memory(dimension: usize) -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?, dimension)
    }

    fn init(conn: Connection, dimension: usize) -> Result<Self, DbError> {
        conn.execute_batch(SCHEMA_SQL)?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'dimension'", [], |row| {
                row.get(0)
            })
            .optional()?;
        match stored {
            Some(raw) => {
                let stored: usize = raw
                    .parse()
                    .map_err(|_| DbError::Corrupt(format!("meta dimension {raw:?}")))?;
                if stored != dimension {
                    return Err(DbError::DimensionChanged {
                        stored,
                        configured: dimension,
                    });
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('dimension', ?1)",
                    params![dimension.to_string()],
                )?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            dimension,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Every enrollment in the database, for preloading a [`facetrack_core::MemoryStore`].
    pub fn all_enrollments(&self) -> Result<Vec<Enrollment>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT enrollment_id, identity_id, embedding, model_version, created_at
                 FROM enrollment",
            )
            .map_err(DbError::from)?;
        let rows = stmt
            .query_map([], read_row)
            .map_err(DbError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DbError::from)?;
        rows.into_iter()
            .map(|row| row.into_enrollment(self.dimension))
            .collect()
    }

    /// `(identities, enrollments)` currently stored.
    pub fn counts(&self) -> Result<(usize, usize), DbError> {
        let conn = self.lock()?;
        let (identities, enrollments): (i64, i64) = conn.query_row(
            "SELECT COUNT(DISTINCT identity_id), COUNT(*) FROM enrollment",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((identities as usize, enrollments as usize))
    }

    /// Returns `false` if the identity was already a member.
    pub fn add_member(&self, scope: &Scope, identity: IdentityId) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO roster_member (scope, identity_id) VALUES (?1, ?2)",
            params![scope.0, identity.0],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_member(&self, scope: &Scope, identity: IdentityId) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM roster_member WHERE scope = ?1 AND identity_id = ?2",
            params![scope.0, identity.0],
        )?;
        Ok(deleted > 0)
    }

    /// Merge a closed scan into the log for `session_id`.
    ///
    /// Matched identities become `present` with their first-accepted time and
    /// score. Unmatched roster members are written `absent` only if the session
    /// has no row for them yet. A `present` row is never downgraded, and a
    /// repeat scan keeps the earliest recorded time. Returns rows written.
    pub fn record_attendance(&self, session_id: i64, report: &ScanReport) -> Result<usize, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut present = tx.prepare(
                "INSERT INTO attendance_log (session_id, identity_id, status, timestamp, score)
                 VALUES (?1, ?2, 'present', ?3, ?4)
                 ON CONFLICT (session_id, identity_id) DO UPDATE SET
                     status = 'present',
                     timestamp = CASE
                         WHEN attendance_log.status = 'present'
                          AND attendance_log.timestamp <= excluded.timestamp
                         THEN attendance_log.timestamp ELSE excluded.timestamp END,
                     score = CASE
                         WHEN attendance_log.status = 'present'
                          AND attendance_log.timestamp <= excluded.timestamp
                         THEN attendance_log.score ELSE excluded.score END",
            )?;
            for (identity, at) in &report.attendance {
                written += present.execute(params![
                    session_id,
                    identity.0,
                    format_time(at),
                    report.scores.get(identity).map(|s| f64::from(*s))
                ])?;
            }

            let mut absent = tx.prepare(
                "INSERT OR IGNORE INTO attendance_log (session_id, identity_id, status)
                 VALUES (?1, ?2, 'absent')",
            )?;
            for identity in &report.absent {
                written += absent.execute(params![session_id, identity.0])?;
            }
        }
        tx.commit()?;
        tracing::info!(
            session_id,
            present = report.attendance.len(),
            absent = report.absent.len(),
            "attendance recorded"
        );
        Ok(written)
    }

    pub fn attendance(&self, session_id: i64) -> Result<Vec<AttendanceRecord>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT identity_id, status, timestamp, score FROM attendance_log
             WHERE session_id = ?1 ORDER BY identity_id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(identity, status, timestamp, score)| {
                Ok(AttendanceRecord {
                    session_id,
                    identity: IdentityId(identity),
                    status: status.parse()?,
                    timestamp: timestamp.as_deref().map(parse_time).transpose()?,
                    score: score.map(|s| s as f32),
                })
            })
            .collect()
    }
}

/// Raw enrollment row before dimension checks.
struct EnrollmentRow {
    id: String,
    identity: i64,
    blob: Vec<u8>,
    model_version: Option<String>,
    created_at: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnrollmentRow> {
    Ok(EnrollmentRow {
        id: row.get(0)?,
        identity: row.get(1)?,
        blob: row.get(2)?,
        model_version: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl EnrollmentRow {
    fn into_enrollment(self, dimension: usize) -> Result<Enrollment, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map(EnrollmentId)
            .map_err(|e| DbError::Corrupt(format!("enrollment id {:?}: {e}", self.id)))?;
        let identity = IdentityId(self.identity);
        let values = decode_embedding(&self.blob)?;
        let embedding = Embedding {
            values,
            model_version: self.model_version,
        };
        embedding.validate(
            dimension,
            VectorOrigin::Enrollment {
                identity,
                enrollment: id,
            },
        )?;
        Ok(Enrollment {
            id,
            identity,
            embedding,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

/// Fixed-width UTC so stored timestamps compare correctly as text.
fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, DbError> {
    if blob.len() % 4 != 0 {
        return Err(DbError::Corrupt(format!(
            "embedding blob of {} bytes is not a whole number of f32s",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl VectorStore for SqliteStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn add(&self, identity: IdentityId, embedding: Embedding) -> Result<Enrollment, StoreError> {
        let enrollment = new_enrollment(self.dimension, identity, embedding)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO enrollment (enrollment_id, identity_id, embedding, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                enrollment.id.to_string(),
                identity.0,
                encode_embedding(&enrollment.embedding.values),
                enrollment.embedding.model_version,
                format_time(&enrollment.created_at)
            ],
        )
        .map_err(DbError::from)?;
        tracing::info!(identity = %identity, enrollment = %enrollment.id, "enrollment stored");
        Ok(enrollment)
    }

    fn remove(&self, enrollment: EnrollmentId) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM enrollment WHERE enrollment_id = ?1",
                params![enrollment.to_string()],
            )
            .map_err(DbError::from)?;
        if deleted > 0 {
            tracing::info!(enrollment = %enrollment, "enrollment deleted");
        }
        Ok(deleted > 0)
    }

    fn list_by_identity(&self, identity: IdentityId) -> Result<Vec<Enrollment>, StoreError> {
        let mut map = self.list_by_identities(&[identity])?;
        Ok(map.remove(&identity).unwrap_or_default())
    }

    fn list_by_identities(
        &self,
        identities: &[IdentityId],
    ) -> Result<HashMap<IdentityId, Vec<Enrollment>>, StoreError> {
        let mut out: HashMap<IdentityId, Vec<Enrollment>> =
            identities.iter().map(|id| (*id, Vec::new())).collect();
        let conn = self.lock()?;

        for chunk in identities.chunks(BULK_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT enrollment_id, identity_id, embedding, model_version, created_at
                 FROM enrollment WHERE identity_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql).map_err(DbError::from)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter().map(|id| id.0)), read_row)
                .map_err(DbError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(DbError::from)?;
            for row in rows {
                let enrollment = row.into_enrollment(self.dimension)?;
                out.entry(enrollment.identity).or_default().push(enrollment);
            }
        }

        tracing::debug!(
            identities = identities.len(),
            enrollments = out.values().map(Vec::len).sum::<usize>(),
            "bulk enrollment lookup"
        );
        Ok(out)
    }
}

impl RosterSource for SqliteStore {
    fn members(&self, scope: &Scope) -> Result<Vec<IdentityId>, RosterError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT identity_id FROM roster_member WHERE scope = ?1 ORDER BY identity_id")
            .map_err(DbError::from)?;
        let ids = stmt
            .query_map(params![scope.0], |row| row.get::<_, i64>(0))
            .map_err(DbError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DbError::from)?;
        Ok(ids.into_iter().map(IdentityId).collect())
    }
}
