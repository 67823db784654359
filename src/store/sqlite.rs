//! SQLite flag storage
//!
//! ## Tables
//!
//! - `flags` - unique flag names with description and enabled state
//! - `variants` - per-flag variant keys, unique per flag
//! - `segments` - ordered by `(rank, id)` within a flag
//! - `constraints`, `distributions` - owned by a segment, cascade on delete
//! - `flag_snapshots` - append-only history, no foreign key so it outlives
//!   the flag
//!
//! Foreign keys are enforced: a variant cannot be deleted while a
//! distribution references it.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::FlagStore;
use crate::entity::{
    Attachment, Constraint, Distribution, Flag, FlagSnapshot, FlagState, Id, NewConstraint,
    NewDistribution, Segment, Variant,
};
use crate::error::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS variants (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flag_id INTEGER NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    attachment TEXT NOT NULL DEFAULT '{}',
    UNIQUE (flag_id, key)
);

CREATE TABLE IF NOT EXISTS segments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flag_id INTEGER NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
    description TEXT NOT NULL DEFAULT '',
    rollout_percent INTEGER NOT NULL,
    rank INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS constraints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    segment_id INTEGER NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
    property TEXT NOT NULL,
    operator TEXT NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS distributions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    segment_id INTEGER NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
    variant_id INTEGER NOT NULL REFERENCES variants(id),
    variant_key TEXT NOT NULL,
    percent INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS flag_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flag_id INTEGER NOT NULL,
    updated_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    hash TEXT NOT NULL,
    state TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_variants_flag ON variants(flag_id);
CREATE INDEX IF NOT EXISTS idx_segments_flag_rank ON segments(flag_id, rank, id);
CREATE INDEX IF NOT EXISTS idx_constraints_segment ON constraints(segment_id);
CREATE INDEX IF NOT EXISTS idx_distributions_segment ON distributions(segment_id);
CREATE INDEX IF NOT EXISTS idx_distributions_variant ON distributions(variant_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_flag ON flag_snapshots(flag_id);
"#;

/// Relational flag storage backed by SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Opening SQLite flag store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory SQLite flag store");
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    /// Insert a segment with an explicit rank, bypassing rank assignment.
    pub fn insert_segment(
        &self,
        flag_id: Id,
        description: &str,
        rollout_percent: u32,
        rank: i64,
    ) -> Result<Segment, StoreError> {
        let conn = self.lock()?;
        insert_segment(&conn, flag_id, description, rollout_percent, rank)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let current: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?
        .unwrap_or(0);

    if current < SCHEMA_VERSION {
        info!("Creating flag store schema v{}", SCHEMA_VERSION);
        conn.execute_batch(SCHEMA)?;
        conn.execute("DELETE FROM schema_version", [])?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
    } else {
        debug!("Flag store schema is up to date (v{})", current);
    }
    Ok(())
}

fn to_sql_id(id: Id) -> i64 {
    id as i64
}

fn from_sql_id(id: i64) -> Id {
    id as Id
}

fn flag_from_row(row: &Row) -> rusqlite::Result<Flag> {
    Ok(Flag {
        id: from_sql_id(row.get("id")?),
        name: row.get("name")?,
        description: row.get("description")?,
        enabled: row.get("enabled")?,
    })
}

fn variant_from_row(row: &Row) -> rusqlite::Result<(Variant, String)> {
    Ok((
        Variant {
            id: from_sql_id(row.get("id")?),
            flag_id: from_sql_id(row.get("flag_id")?),
            key: row.get("key")?,
            attachment: Attachment::new(),
        },
        row.get("attachment")?,
    ))
}

fn segment_from_row(row: &Row) -> rusqlite::Result<Segment> {
    Ok(Segment {
        id: from_sql_id(row.get("id")?),
        flag_id: from_sql_id(row.get("flag_id")?),
        description: row.get("description")?,
        rollout_percent: row.get("rollout_percent")?,
        rank: row.get("rank")?,
    })
}

fn constraint_from_row(row: &Row) -> rusqlite::Result<Constraint> {
    Ok(Constraint {
        id: from_sql_id(row.get("id")?),
        segment_id: from_sql_id(row.get("segment_id")?),
        property: row.get("property")?,
        operator: row.get("operator")?,
        value: row.get("value")?,
    })
}

fn distribution_from_row(row: &Row) -> rusqlite::Result<Distribution> {
    Ok(Distribution {
        id: from_sql_id(row.get("id")?),
        segment_id: from_sql_id(row.get("segment_id")?),
        variant_id: from_sql_id(row.get("variant_id")?),
        variant_key: row.get("variant_key")?,
        percent: row.get("percent")?,
    })
}

fn decode_variant((mut variant, attachment): (Variant, String)) -> Result<Variant, StoreError> {
    variant.attachment = serde_json::from_str(&attachment)?;
    Ok(variant)
}

/// Translate a foreign key failure into [`StoreError::Integrity`].
fn integrity(context: &str, err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Integrity(format!("{}: {}", context, err))
        }
        other => StoreError::Sqlite(other),
    }
}

fn insert_segment(
    conn: &Connection,
    flag_id: Id,
    description: &str,
    rollout_percent: u32,
    rank: i64,
) -> Result<Segment, StoreError> {
    conn.execute(
        "INSERT INTO segments (flag_id, description, rollout_percent, rank) VALUES (?1, ?2, ?3, ?4)",
        params![to_sql_id(flag_id), description, rollout_percent, rank],
    )
    .map_err(|e| integrity("inserting segment", e))?;
    Ok(Segment {
        id: from_sql_id(conn.last_insert_rowid()),
        flag_id,
        description: description.to_string(),
        rollout_percent,
        rank,
    })
}

/// Bind a list of strings as `?1, ?2, ...` starting after `offset` params.
fn placeholders(count: usize, offset: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", i + offset))
        .collect::<Vec<_>>()
        .join(", ")
}

impl FlagStore for SqliteStore {
    fn get_or_create_flag(&self, name: &str) -> Result<Flag, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO flags (name) VALUES (?1)",
            params![name],
        )?;
        let flag = conn.query_row(
            "SELECT * FROM flags WHERE name = ?1",
            params![name],
            flag_from_row,
        )?;
        Ok(flag)
    }

    fn update_flag(
        &self,
        flag: &mut Flag,
        description: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE flags SET description = ?1, enabled = ?2 WHERE id = ?3",
            params![description, enabled, to_sql_id(flag.id)],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "flag",
                id: flag.id,
            });
        }
        flag.description = description.to_string();
        flag.enabled = enabled;
        Ok(())
    }

    fn get_flag(&self, flag_id: Id) -> Result<Option<Flag>, StoreError> {
        let conn = self.lock()?;
        let flag = conn
            .query_row(
                "SELECT * FROM flags WHERE id = ?1",
                params![to_sql_id(flag_id)],
                flag_from_row,
            )
            .optional()?;
        Ok(flag)
    }

    fn list_flags(&self) -> Result<Vec<Flag>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM flags ORDER BY name")?;
        let flags = stmt
            .query_map([], flag_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(flags)
    }

    fn delete_flags_not_in(&self, names: &[String]) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "DELETE FROM flags WHERE name NOT IN ({})",
            placeholders(names.len(), 0)
        );
        let deleted = conn
            .execute(&sql, rusqlite::params_from_iter(names.iter()))
            .map_err(|e| integrity("deleting flags", e))?;
        Ok(deleted)
    }

    fn ensure_variants_exist(
        &self,
        flag_id: Id,
        keys: &[String],
    ) -> Result<Vec<Variant>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            tx.execute(
                "INSERT OR IGNORE INTO variants (flag_id, key) VALUES (?1, ?2)",
                params![to_sql_id(flag_id), key],
            )
            .map_err(|e| integrity("inserting variant", e))?;
            let row = tx.query_row(
                "SELECT * FROM variants WHERE flag_id = ?1 AND key = ?2",
                params![to_sql_id(flag_id), key],
                variant_from_row,
            )?;
            result.push(decode_variant(row)?);
        }
        tx.commit()?;
        Ok(result)
    }

    fn list_variants(&self, flag_id: Id) -> Result<Vec<Variant>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM variants WHERE flag_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![to_sql_id(flag_id)], variant_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_variant).collect()
    }

    fn delete_variants_not_in(&self, flag_id: Id, keys: &[String]) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "DELETE FROM variants WHERE flag_id = ?1 AND key NOT IN ({})",
            placeholders(keys.len(), 1)
        );
        let mut values: Vec<rusqlite::types::Value> = vec![to_sql_id(flag_id).into()];
        values.extend(keys.iter().map(|k| k.clone().into()));
        let deleted = conn
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(|e| integrity("deleting variants", e))?;
        Ok(deleted)
    }

    fn list_segments(&self, flag_id: Id) -> Result<Vec<Segment>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM segments WHERE flag_id = ?1 ORDER BY rank, id")?;
        let segments = stmt
            .query_map(params![to_sql_id(flag_id)], segment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(segments)
    }

    fn append_segment(
        &self,
        flag_id: Id,
        description: &str,
        rollout_percent: u32,
    ) -> Result<Segment, StoreError> {
        let conn = self.lock()?;
        let rank: i64 = conn.query_row(
            "SELECT COALESCE(MAX(rank) + 1, 0) FROM segments WHERE flag_id = ?1",
            params![to_sql_id(flag_id)],
            |row| row.get(0),
        )?;
        insert_segment(&conn, flag_id, description, rollout_percent, rank)
    }

    fn update_segment(
        &self,
        segment: &mut Segment,
        description: &str,
        rollout_percent: u32,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE segments SET description = ?1, rollout_percent = ?2 WHERE id = ?3",
            params![description, rollout_percent, to_sql_id(segment.id)],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "segment",
                id: segment.id,
            });
        }
        segment.description = description.to_string();
        segment.rollout_percent = rollout_percent;
        Ok(())
    }

    fn delete_segments_after(
        &self,
        flag_id: Id,
        reference: &Segment,
    ) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut deleted = tx.execute(
            "DELETE FROM segments WHERE flag_id = ?1 AND rank > ?2",
            params![to_sql_id(flag_id), reference.rank],
        )?;
        deleted += tx.execute(
            "DELETE FROM segments WHERE flag_id = ?1 AND rank = ?2 AND id >= ?3",
            params![to_sql_id(flag_id), reference.rank, to_sql_id(reference.id)],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    fn replace_constraints(
        &self,
        segment_id: Id,
        constraints: &[NewConstraint],
    ) -> Result<Vec<Constraint>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM constraints WHERE segment_id = ?1",
            params![to_sql_id(segment_id)],
        )?;
        let mut created = Vec::with_capacity(constraints.len());
        for c in constraints {
            tx.execute(
                "INSERT INTO constraints (segment_id, property, operator, value) VALUES (?1, ?2, ?3, ?4)",
                params![to_sql_id(segment_id), c.property, c.operator, c.value],
            )
            .map_err(|e| integrity("inserting constraint", e))?;
            created.push(Constraint {
                id: from_sql_id(tx.last_insert_rowid()),
                segment_id,
                property: c.property.clone(),
                operator: c.operator.clone(),
                value: c.value.clone(),
            });
        }
        tx.commit()?;
        Ok(created)
    }

    fn list_constraints(&self, segment_id: Id) -> Result<Vec<Constraint>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM constraints WHERE segment_id = ?1 ORDER BY id")?;
        let constraints = stmt
            .query_map(params![to_sql_id(segment_id)], constraint_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(constraints)
    }

    fn replace_distributions(
        &self,
        segment_id: Id,
        distributions: &[NewDistribution],
    ) -> Result<Vec<Distribution>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM distributions WHERE segment_id = ?1",
            params![to_sql_id(segment_id)],
        )?;
        let mut created = Vec::with_capacity(distributions.len());
        for d in distributions {
            tx.execute(
                "INSERT INTO distributions (segment_id, variant_id, variant_key, percent) VALUES (?1, ?2, ?3, ?4)",
                params![to_sql_id(segment_id), to_sql_id(d.variant_id), d.variant_key, d.percent],
            )
            .map_err(|e| integrity("inserting distribution", e))?;
            created.push(Distribution {
                id: from_sql_id(tx.last_insert_rowid()),
                segment_id,
                variant_id: d.variant_id,
                variant_key: d.variant_key.clone(),
                percent: d.percent,
            });
        }
        tx.commit()?;
        Ok(created)
    }

    fn list_distributions(&self, segment_id: Id) -> Result<Vec<Distribution>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM distributions WHERE segment_id = ?1 ORDER BY id")?;
        let distributions = stmt
            .query_map(params![to_sql_id(segment_id)], distribution_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(distributions)
    }

    fn save_snapshot(
        &self,
        flag_id: Id,
        updated_by: &str,
        created_at: DateTime<Utc>,
        hash: &str,
        state: &FlagState,
    ) -> Result<FlagSnapshot, StoreError> {
        let conn = self.lock()?;
        let state_json = serde_json::to_string(state)?;
        conn.execute(
            "INSERT INTO flag_snapshots (flag_id, updated_by, created_at, hash, state) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![to_sql_id(flag_id), updated_by, created_at.to_rfc3339(), hash, state_json],
        )?;
        Ok(FlagSnapshot {
            id: from_sql_id(conn.last_insert_rowid()),
            flag_id,
            updated_by: updated_by.to_string(),
            created_at,
            hash: hash.to_string(),
            state: state.clone(),
        })
    }

    fn list_snapshots(&self, flag_id: Id) -> Result<Vec<FlagSnapshot>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, updated_by, created_at, hash, state FROM flag_snapshots WHERE flag_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![to_sql_id(flag_id)], |row| {
                Ok((
                    from_sql_id(row.get(0)?),
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, updated_by, created_at, hash, state)| {
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StoreError::Internal(format!("bad snapshot timestamp: {}", e)))?
                    .with_timezone(&Utc);
                Ok(FlagSnapshot {
                    id,
                    flag_id,
                    updated_by,
                    created_at,
                    hash,
                    state: serde_json::from_str(&state)?,
                })
            })
            .collect()
    }
}
