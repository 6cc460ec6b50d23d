//! Schema versions and migrations.
//!
//! Each migration moves the on-disk layout up exactly one version inside a
//! single transaction, bumping `schema_version` in the same transaction, so a
//! step either lands completely or not at all. Fresh stores skip the chain and
//! create the current layout directly.

use crate::config::StoreConfig;
use crate::error::{StorageError, StorageResult};
use crate::metadata_keys;
use duckdb::{Connection, params};
use tracing::{debug, error, info, warn};

/// Schema version this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Oldest on-disk version the migration chain can bridge. Anything older is reset.
pub const MIN_MIGRATABLE_VERSION: u32 = 1;

/// Body of a migration step. Runs inside the step's transaction.
pub type MigrationFn = fn(&Connection) -> duckdb::Result<()>;

/// One idempotent step from `version - 1` to `version`.
#[derive(Clone, Copy, Debug)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub apply: MigrationFn,
}

const MIGRATIONS: [Migration; 3] = [
    Migration {
        version: 1,
        name: "initial entities, outbox and metadata",
        apply: migrate_v1,
    },
    Migration {
        version: 2,
        name: "conflicts table",
        apply: migrate_v2,
    },
    Migration {
        version: 3,
        name: "durable outbox sequence counter",
        apply: migrate_v3,
    },
];

/// A target schema version together with the migration chain that reaches it.
#[derive(Clone, Debug)]
pub struct Schema {
    version: u32,
    migrations: Vec<Migration>,
}

impl Schema {
    /// The schema this build expects.
    pub fn current() -> Self {
        Self {
            version: CURRENT_SCHEMA_VERSION,
            migrations: MIGRATIONS.to_vec(),
        }
    }

    /// Stops the chain at `version`. Used to produce stores of an older layout.
    pub fn truncated(mut self, version: u32) -> Self {
        self.migrations.retain(|m| m.version <= version);
        self.version = version;
        self
    }

    /// Replaces the step for `migration.version`, or appends it.
    pub fn with_migration(mut self, migration: Migration) -> Self {
        self.migrations.retain(|m| m.version != migration.version);
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version);
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Creates this schema's layout on an empty database.
    fn create_fresh(&self, conn: &Connection) -> duckdb::Result<()> {
        if self.version == CURRENT_SCHEMA_VERSION {
            return create_current_tables(conn);
        }
        for migration in &self.migrations {
            (migration.apply)(conn)?;
        }
        Ok(())
    }
}

/// Brings the database to `schema.version()`.
///
/// Falls back to [`reset_schema`] when the stored version cannot be bridged or
/// a migration step keeps failing. Only a failing reset is returned as an error.
pub(crate) fn initialize(
    conn: &mut Connection,
    schema: &Schema,
    config: &StoreConfig,
) -> StorageResult<()> {
    let target = schema.version();
    let stored = read_schema_version(conn)?;

    match stored {
        None if list_tables(conn)?.is_empty() => {
            info!("[STORE] creating schema v{target}");
            let tx = conn.transaction()?;
            schema.create_fresh(&tx)?;
            set_schema_version(&tx, target)?;
            tx.commit()?;
        }
        None => {
            warn!("[STORE] tables present but no schema version recorded, resetting");
            reset_schema(conn, schema)?;
        }
        Some(v) if v == target => {
            debug!("[STORE] schema v{v} is current");
        }
        Some(v) if v > target || v < MIN_MIGRATABLE_VERSION => {
            warn!("[STORE] schema v{v} cannot be migrated to v{target}, resetting");
            reset_schema(conn, schema)?;
        }
        Some(v) => {
            if let Err(e) = migrate(conn, schema, v, config.migration_retries) {
                error!("[STORE] {e}; falling back to full reset");
                reset_schema(conn, schema)?;
            }
        }
    }

    Ok(())
}

/// Runs every step above `from` in ascending order.
fn migrate(conn: &mut Connection, schema: &Schema, from: u32, retries: u32) -> StorageResult<()> {
    let target = schema.version();
    let mut current = from;

    for migration in schema
        .migrations()
        .iter()
        .filter(|m| m.version > from && m.version <= target)
    {
        let mut attempt = 0;
        loop {
            match apply_migration(conn, migration) {
                Ok(()) => break,
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "[STORE] migration v{} ({}) failed, retry {attempt}/{retries}: {e}",
                        migration.version, migration.name
                    );
                }
                Err(e) => {
                    return Err(StorageError::MigrationFailed {
                        version: migration.version,
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!("[STORE] migrated to v{} ({})", migration.version, migration.name);
        current = migration.version;
    }

    if current != target {
        return Err(StorageError::MigrationFailed {
            version: target,
            reason: format!("no migration path from v{current}"),
        });
    }
    Ok(())
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> duckdb::Result<()> {
    let tx = conn.transaction()?;
    (migration.apply)(&tx)?;
    set_schema_version(&tx, migration.version)?;
    tx.commit()
}

/// Drops every table and recreates the layout at `schema.version()`.
///
/// The one-shot reset marker survives, so a marker already applied is never
/// re-applied to data written after this reset.
pub(crate) fn reset_schema(conn: &mut Connection, schema: &Schema) -> StorageResult<()> {
    let tables = list_tables(conn)?;
    let reset_marker = read_reset_marker(conn, &tables);
    let tx = conn.transaction()?;
    for table in &tables {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", table.replace('"', "\"\"")))?;
    }
    schema.create_fresh(&tx)?;
    set_schema_version(&tx, schema.version())?;
    if let Some(marker) = &reset_marker {
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
            params![metadata_keys::RESET_APPLIED, marker],
        )?;
    }
    tx.commit()?;
    info!(
        "[STORE] reset complete: dropped {} tables, schema v{}",
        tables.len(),
        schema.version()
    );
    Ok(())
}

fn read_reset_marker(conn: &Connection, tables: &[String]) -> Option<String> {
    if !tables.iter().any(|t| t == "metadata") {
        return None;
    }
    let result = conn.query_row(
        "SELECT value FROM metadata WHERE key = ?",
        params![metadata_keys::RESET_APPLIED],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(marker) => Some(marker),
        Err(duckdb::Error::QueryReturnedNoRows) => None,
        Err(e) => {
            warn!("[STORE] reset marker unreadable, not carried over: {e}");
            None
        }
    }
}

/// Names of all base tables in the store.
pub(crate) fn list_tables(conn: &Connection) -> StorageResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_catalog = current_database() AND table_schema = 'main' \
         AND table_type = 'BASE TABLE' ORDER BY table_name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tables)
}

/// Reads the recorded schema version. `None` when the metadata table or the
/// key is missing; an unparseable value reads as version 0.
pub(crate) fn read_schema_version(conn: &Connection) -> StorageResult<Option<u32>> {
    if !list_tables(conn)?.iter().any(|t| t == "metadata") {
        return Ok(None);
    }
    let result = conn.query_row(
        "SELECT value FROM metadata WHERE key = ?",
        params![metadata_keys::SCHEMA_VERSION],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(raw) => Ok(Some(raw.parse().unwrap_or(0))),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn set_schema_version(conn: &Connection, version: u32) -> duckdb::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
        params![metadata_keys::SCHEMA_VERSION, version.to_string()],
    )?;
    Ok(())
}

// -- Layouts --

const METADATA_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS metadata (
        key VARCHAR PRIMARY KEY,
        value VARCHAR NOT NULL
    );
"#;

const ENTITIES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS entities (
        id VARCHAR PRIMARY KEY,
        entity_type VARCHAR NOT NULL,
        server_id VARCHAR,
        payload_json TEXT NOT NULL,
        local_version BIGINT NOT NULL DEFAULT 0,
        sync_status VARCHAR NOT NULL,
        updated_at BIGINT NOT NULL,
        deleted_locally BOOLEAN NOT NULL DEFAULT FALSE
    );
"#;

const OUTBOX_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS outbox (
        sequence BIGINT PRIMARY KEY,
        entity_id VARCHAR NOT NULL,
        entity_type VARCHAR NOT NULL,
        operation VARCHAR NOT NULL,
        payload_json TEXT NOT NULL,
        attempts BIGINT NOT NULL DEFAULT 0,
        last_error VARCHAR,
        enqueued_at BIGINT NOT NULL
    );
"#;

// Remote side of a conflict, kept until the consumer resolves it.
const CONFLICTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS conflicts (
        entity_id VARCHAR PRIMARY KEY,
        server_id VARCHAR NOT NULL,
        entity_type VARCHAR NOT NULL,
        remote_payload_json TEXT NOT NULL,
        remote_updated_at BIGINT NOT NULL,
        remote_deleted BOOLEAN NOT NULL DEFAULT FALSE,
        detected_at BIGINT NOT NULL
    );
"#;

// Single-row high-water mark so sequences are never reused, even after the
// outbox empties.
const OUTBOX_COUNTER_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS outbox_counter (
        id INTEGER PRIMARY KEY,
        last_sequence BIGINT NOT NULL
    );
"#;

fn create_current_tables(conn: &Connection) -> duckdb::Result<()> {
    conn.execute_batch(METADATA_TABLE)?;
    conn.execute_batch(ENTITIES_TABLE)?;
    conn.execute_batch(OUTBOX_TABLE)?;
    conn.execute_batch(CONFLICTS_TABLE)?;
    conn.execute_batch(OUTBOX_COUNTER_TABLE)?;
    conn.execute(
        "INSERT OR IGNORE INTO outbox_counter (id, last_sequence) VALUES (1, 0)",
        [],
    )?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> duckdb::Result<()> {
    conn.execute_batch(METADATA_TABLE)?;
    conn.execute_batch(ENTITIES_TABLE)?;
    conn.execute_batch(OUTBOX_TABLE)?;
    Ok(())
}

fn migrate_v2(conn: &Connection) -> duckdb::Result<()> {
    conn.execute_batch(CONFLICTS_TABLE)
}

fn migrate_v3(conn: &Connection) -> duckdb::Result<()> {
    conn.execute_batch(OUTBOX_COUNTER_TABLE)?;
    // v2 stores assigned sequences from the outbox itself; continue above them.
    conn.execute(
        "INSERT OR IGNORE INTO outbox_counter (id, last_sequence) \
         SELECT 1, COALESCE(MAX(sequence), 0) FROM outbox",
        [],
    )?;
    Ok(())
}
