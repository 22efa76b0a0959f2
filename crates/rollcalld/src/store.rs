//! SQLite persistence for identities and attendance records.
//!
//! All access goes through one `tokio-rusqlite` connection thread, and every
//! check-then-insert runs inside a single transaction on that thread. The
//! `UNIQUE` constraints on `identities.email` and
//! `attendance(identity_id, day)` back the checks up.

use std::path::Path;

use chrono::{DateTime, Local, NaiveDate, NaiveTime, SubsecRound, Utc};
use rollcall_core::{Embedding, EmbeddingError, EuclideanMatcher, FaceTemplate, Matcher};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    email       TEXT NOT NULL UNIQUE COLLATE NOCASE,
    role        TEXT NOT NULL,
    embedding   TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id           TEXT PRIMARY KEY,
    identity_id  TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    marked_at    TEXT NOT NULL,
    day          TEXT NOT NULL,
    status       TEXT NOT NULL,
    UNIQUE (identity_id, day)
);

CREATE INDEX IF NOT EXISTS idx_attendance_marked_at ON attendance(marked_at);
"#;

/// Fixed-width UTC timestamps so that text order is time order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
#[error("stored embedding for identity {identity_id} is invalid: {source}")]
pub struct CorruptEmbedding {
    pub identity_id: String,
    #[source]
    pub source: EmbeddingError,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error(transparent)]
    CorruptEmbedding(#[from] CorruptEmbedding),
    #[error("refusing to store embedding: {0}")]
    InvalidEmbedding(#[from] EmbeddingError),
    #[error("could not create database directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            "admin" => Ok(Role::Admin),
            other => Err(format!(
                "invalid role {other:?}, expected student, teacher or admin"
            )),
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
}

impl FromSql for AttendanceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "present" => Ok(AttendanceStatus::Present),
            other => Err(FromSqlError::Other(
                format!("unknown attendance status {other:?}").into(),
            )),
        }
    }
}

/// A registered person. The embedding stays in storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub identity_id: String,
    pub marked_at: DateTime<Utc>,
    /// Local calendar day the record counts for.
    pub day: NaiveDate,
    pub status: AttendanceStatus,
}

/// An attendance record joined with the identity it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEntry {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub identity: Identity,
}

/// Validated input for a new identity.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub embedding: Embedding,
}

#[derive(Debug)]
pub enum RegisterOutcome {
    Created(Identity),
    EmailTaken,
    /// The face is within the duplicate threshold of an existing identity.
    FaceTaken { identity_id: String, distance: f32 },
}

#[derive(Debug)]
pub enum MarkOutcome {
    Created(AttendanceRecord),
    AlreadyMarked,
}

/// Inclusive range of local calendar days; either end may be open.
#[derive(Debug, Clone, Copy, Default)]
pub struct DayRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
    embedding_dim: usize,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path, embedding_dim: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        tracing::info!(path = %path.display(), "database opened");
        Self::init(conn, embedding_dim).await
    }

    pub async fn open_in_memory(embedding_dim: usize) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn, embedding_dim).await
    }

    async fn init(conn: tokio_rusqlite::Connection, embedding_dim: usize) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self {
            conn,
            embedding_dim,
        })
    }

    /// Insert a new identity unless its email or face is already registered.
    ///
    /// The email check, the duplicate-face scan and the insert share one
    /// transaction, so two concurrent registrations cannot both pass.
    pub async fn register(
        &self,
        new: NewIdentity,
        duplicate_threshold: f32,
    ) -> Result<RegisterOutcome, StoreError> {
        let dim = self.embedding_dim;
        new.embedding.validate(dim)?;
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let email_taken: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM identities WHERE email = ?1)",
                    [&new.email],
                    |row| row.get(0),
                )?;
                if email_taken {
                    return Ok(RegisterOutcome::EmailTaken);
                }

                let gallery = parse_gallery(read_gallery(&tx)?, dim).map_err(other)?;
                let result = EuclideanMatcher
                    .compare(&new.embedding, &gallery, duplicate_threshold)
                    .map_err(other)?;
                if let Some(identity_id) = result.identity_id {
                    return Ok(RegisterOutcome::FaceTaken {
                        identity_id,
                        distance: result.distance,
                    });
                }

                let identity = Identity {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: new.name,
                    email: new.email,
                    role: new.role,
                    created_at: Utc::now().trunc_subsecs(6),
                };
                let inserted = tx.execute(
                    "INSERT INTO identities (id, name, email, role, embedding, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        identity.id,
                        identity.name,
                        identity.email,
                        identity.role,
                        new.embedding.to_csv(),
                        timestamp(&identity.created_at),
                    ],
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => return Ok(RegisterOutcome::EmailTaken),
                    Err(e) => return Err(e.into()),
                }
                tx.commit()?;
                Ok(RegisterOutcome::Created(identity))
            })
            .await?;
        Ok(outcome)
    }

    /// All identities, oldest first.
    pub async fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        let identities = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, email, role, created_at
                     FROM identities ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map([], |row| identity_from_row(row, 0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(identities)
    }

    pub async fn identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        let id = id.to_string();
        let identity = self
            .conn
            .call(move |conn| {
                let identity = conn
                    .query_row(
                        "SELECT id, name, email, role, created_at FROM identities WHERE id = ?1",
                        [&id],
                        |row| identity_from_row(row, 0),
                    )
                    .optional()?;
                Ok(identity)
            })
            .await?;
        Ok(identity)
    }

    pub async fn count_identities(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(count.max(0) as usize)
    }

    /// Every registered embedding, validated against the configured dimension.
    pub async fn gallery(&self) -> Result<Vec<FaceTemplate>, StoreError> {
        let rows = self.conn.call(|conn| Ok(read_gallery(conn)?)).await?;
        Ok(parse_gallery(rows, self.embedding_dim)?)
    }

    /// Record attendance for `identity_id` unless one already exists in the
    /// local calendar day containing `now`.
    pub async fn mark_attendance(
        &self,
        identity_id: &str,
        now: DateTime<Local>,
    ) -> Result<MarkOutcome, StoreError> {
        let day = now.date_naive();
        let window_start = timestamp(&local_midnight(day));
        let window_end = timestamp(&local_midnight(next_day(day)));
        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            identity_id: identity_id.to_string(),
            marked_at: now.with_timezone(&Utc).trunc_subsecs(6),
            day,
            status: AttendanceStatus::Present,
        };

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let exists: bool = tx.query_row(
                    "SELECT EXISTS(
                         SELECT 1 FROM attendance
                         WHERE identity_id = ?1 AND marked_at >= ?2 AND marked_at < ?3
                     )",
                    params![record.identity_id, window_start, window_end],
                    |row| row.get(0),
                )?;
                if exists {
                    return Ok(MarkOutcome::AlreadyMarked);
                }

                let inserted = tx.execute(
                    "INSERT INTO attendance (id, identity_id, marked_at, day, status)
                     VALUES (?1, ?2, ?3, ?4, 'present')",
                    params![
                        record.id,
                        record.identity_id,
                        timestamp(&record.marked_at),
                        record.day.format(DAY_FORMAT).to_string(),
                    ],
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => return Ok(MarkOutcome::AlreadyMarked),
                    Err(e) => return Err(e.into()),
                }
                tx.commit()?;
                Ok(MarkOutcome::Created(record))
            })
            .await?;
        Ok(outcome)
    }

    /// Attendance records with their identities, newest first.
    pub async fn attendance(&self, range: DayRange) -> Result<Vec<AttendanceEntry>, StoreError> {
        let from = range.start.map(|d| timestamp(&local_midnight(d)));
        let until = range.end.map(|d| timestamp(&local_midnight(next_day(d))));

        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.id, a.identity_id, a.marked_at, a.day, a.status,
                            i.id, i.name, i.email, i.role, i.created_at
                     FROM attendance a
                     JOIN identities i ON i.id = a.identity_id
                     WHERE (?1 IS NULL OR a.marked_at >= ?1)
                       AND (?2 IS NULL OR a.marked_at < ?2)
                     ORDER BY a.marked_at DESC",
                )?;
                let rows = stmt
                    .query_map(params![from, until], |row| {
                        Ok(AttendanceEntry {
                            record: AttendanceRecord {
                                id: row.get(0)?,
                                identity_id: row.get(1)?,
                                marked_at: parse_timestamp(row, 2)?,
                                day: parse_day(row, 3)?,
                                status: row.get(4)?,
                            },
                            identity: identity_from_row(row, 5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }
}

fn other<E>(err: E) -> tokio_rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    tokio_rusqlite::Error::Other(Box::new(err))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn read_gallery(conn: &rusqlite::Connection) -> rusqlite::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT id, embedding FROM identities")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_gallery(rows: Vec<(String, String)>, dim: usize) -> Result<Vec<FaceTemplate>, CorruptEmbedding> {
    rows.into_iter()
        .map(|(identity_id, raw)| match Embedding::from_csv(&raw, dim) {
            Ok(embedding) => Ok(FaceTemplate {
                identity_id,
                embedding,
            }),
            Err(source) => Err(CorruptEmbedding {
                identity_id,
                source,
            }),
        })
        .collect()
}

fn identity_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        email: row.get(offset + 2)?,
        role: row.get(offset + 3)?,
        created_at: parse_timestamp(row, offset + 4)?,
    })
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_day(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DAY_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn next_day(day: NaiveDate) -> NaiveDate {
    day.succ_opt().unwrap_or(NaiveDate::MAX)
}

/// Start of `day` in local server time. A midnight skipped by a DST jump
/// falls back to midnight UTC.
fn local_midnight(day: NaiveDate) -> DateTime<Utc> {
    let midnight = day.and_time(NaiveTime::MIN);
    midnight
        .and_local_timezone(Local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}
