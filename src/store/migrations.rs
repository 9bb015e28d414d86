//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "messages",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_key TEXT NOT NULL UNIQUE,
                message_type TEXT NOT NULL,
                message_state TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                is_disabled INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                process_after_utc TEXT NOT NULL,
                archive_after_utc TEXT NOT NULL,
                content TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_on_utc TEXT NOT NULL,
                last_updated_by TEXT NOT NULL,
                last_updated_on_utc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_ready
                ON messages(is_disabled, message_state);
            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_on_utc);
            CREATE INDEX IF NOT EXISTS idx_messages_archive_after ON messages(archive_after_utc);

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                file_type TEXT NOT NULL,
                content BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);

            CREATE TABLE IF NOT EXISTS message_properties (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                UNIQUE (message_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_message_properties_message
                ON message_properties(message_id);
        "#,
    },
    Migration {
        version: 2,
        name: "provider_types",
        sql: r#"
            CREATE TABLE IF NOT EXISTS provider_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                priority INTEGER NOT NULL DEFAULT 0,
                is_disabled INTEGER NOT NULL DEFAULT 0,
                can_process_emails INTEGER NOT NULL DEFAULT 0,
                can_process_texts INTEGER NOT NULL DEFAULT 0,
                created_by TEXT NOT NULL,
                created_on_utc TEXT NOT NULL,
                last_updated_by TEXT NOT NULL,
                last_updated_on_utc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS provider_parameters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_type_id INTEGER NOT NULL
                    REFERENCES provider_types(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_provider_parameters_provider
                ON provider_parameters(provider_type_id);
        "#,
    },
    Migration {
        version: 3,
        name: "pipeline_logs_and_archive",
        sql: r#"
            CREATE TABLE IF NOT EXISTS pipeline_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                provider_type_id INTEGER,
                provider_name TEXT,
                outcome TEXT NOT NULL,
                detail TEXT,
                created_by TEXT NOT NULL,
                created_on_utc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pipeline_logs_message ON pipeline_logs(message_id);

            CREATE TABLE IF NOT EXISTS archived_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                message_key TEXT NOT NULL,
                message_type TEXT NOT NULL,
                message_state TEXT NOT NULL,
                error_count INTEGER NOT NULL,
                snapshot TEXT NOT NULL,
                archived_by TEXT NOT NULL,
                archived_on_utc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_archived_messages_key ON archived_messages(message_key);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Highest version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Get the highest applied migration version, or 0 if none.
pub(crate) async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
