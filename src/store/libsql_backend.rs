//! libSQL backend: implements the message, provider, and log repositories.
//!
//! Holds a single connection. Every operation takes the backend lock first, so
//! multi-statement transactions never interleave on the shared connection.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::model::{
    ArchivedMessage, Attachment, LogOutcome, Message, MessageContent, MessageId, MessageProperty,
    MessageType, ParameterValue, PipelineLog, PipelineLogId, PropertyValue, ProviderId,
    ProviderParameter, ProviderType, normalize_key,
};
use crate::store::migrations;
use crate::store::traits::{MessageStore, PipelineLogStore, ProviderRegistry};

const MESSAGE_COLUMNS: &str = "id, message_key, message_type, message_state, priority, \
     is_disabled, error_count, process_after_utc, archive_after_utc, content, created_by, \
     created_on_utc, last_updated_by, last_updated_on_utc";

const PROVIDER_COLUMNS: &str = "id, name, priority, is_disabled, can_process_emails, \
     can_process_texts, created_by, created_on_utc, last_updated_by, last_updated_on_utc";

const LOG_COLUMNS: &str =
    "id, message_id, provider_type_id, provider_name, outcome, detail, created_by, created_on_utc";

const ARCHIVE_COLUMNS: &str = "message_id, message_key, message_type, message_state, \
     error_count, snapshot, archived_by, archived_on_utc";

/// libSQL database backend.
pub struct LibSqlBackend {
    // Never read; owns the database the connection belongs to.
    _db: LibSqlDatabase,
    conn: Connection,
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: db,
            conn,
            lock: Mutex::new(()),
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        self.conn
            .execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&self.conn).await
    }

    /// Applied schema version.
    pub async fn schema_version(&self) -> Result<i64, DatabaseError> {
        let _guard = self.lock.lock().await;
        migrations::get_current_version(&self.conn).await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp text. Fixed width, so string order is time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn flag(b: bool) -> i64 {
    i64::from(b)
}

fn query_err(context: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::from_libsql(context, e)
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, DatabaseError> {
    raw.parse().map_err(DatabaseError::Serialization)
}

/// Map a libsql Row to a Message without children.
///
/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let err = query_err("message row parse");
    let message_type: MessageType = parse_enum(&row.get::<String>(2).map_err(&err)?)?;
    let content_json: String = row.get(9).map_err(&err)?;
    let content: MessageContent = serde_json::from_str(&content_json)
        .map_err(|e| DatabaseError::Serialization(format!("message content: {e}")))?;
    if content.message_type() != message_type {
        return Err(DatabaseError::Serialization(format!(
            "content is {} but row says {}",
            content.message_type(),
            message_type
        )));
    }

    Ok(Message {
        id: Some(row.get::<i64>(0).map_err(&err)?),
        message_key: row.get(1).map_err(&err)?,
        message_state: parse_enum(&row.get::<String>(3).map_err(&err)?)?,
        priority: row.get::<i64>(4).map_err(&err)? as i32,
        is_disabled: row.get::<i64>(5).map_err(&err)? != 0,
        error_count: row.get::<i64>(6).map_err(&err)?.max(0) as u32,
        process_after_utc: parse_datetime(&row.get::<String>(7).map_err(&err)?),
        archive_after_utc: parse_datetime(&row.get::<String>(8).map_err(&err)?),
        content,
        attachments: Vec::new(),
        properties: Vec::new(),
        created_by: row.get(10).map_err(&err)?,
        created_on_utc: parse_datetime(&row.get::<String>(11).map_err(&err)?),
        last_updated_by: row.get(12).map_err(&err)?,
        last_updated_on_utc: parse_datetime(&row.get::<String>(13).map_err(&err)?),
    })
}

fn row_to_provider(row: &libsql::Row) -> Result<ProviderType, DatabaseError> {
    let err = query_err("provider row parse");
    Ok(ProviderType {
        id: Some(row.get::<i64>(0).map_err(&err)?),
        name: row.get(1).map_err(&err)?,
        priority: row.get::<i64>(2).map_err(&err)? as i32,
        is_disabled: row.get::<i64>(3).map_err(&err)? != 0,
        can_process_emails: row.get::<i64>(4).map_err(&err)? != 0,
        can_process_texts: row.get::<i64>(5).map_err(&err)? != 0,
        parameters: Vec::new(),
        created_by: row.get(6).map_err(&err)?,
        created_on_utc: parse_datetime(&row.get::<String>(7).map_err(&err)?),
        last_updated_by: row.get(8).map_err(&err)?,
        last_updated_on_utc: parse_datetime(&row.get::<String>(9).map_err(&err)?),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<PipelineLog, DatabaseError> {
    let err = query_err("pipeline log row parse");
    let outcome: LogOutcome = parse_enum(&row.get::<String>(4).map_err(&err)?)?;
    Ok(PipelineLog {
        id: Some(row.get::<i64>(0).map_err(&err)?),
        message_id: row.get(1).map_err(&err)?,
        provider_type_id: row.get::<i64>(2).ok(),
        provider_name: row.get::<String>(3).ok(),
        outcome,
        detail: row.get::<String>(5).ok(),
        created_by: row.get(6).map_err(&err)?,
        created_on_utc: parse_datetime(&row.get::<String>(7).map_err(&err)?),
    })
}

fn row_to_archived(row: &libsql::Row) -> Result<ArchivedMessage, DatabaseError> {
    let err = query_err("archived message row parse");
    let snapshot: String = row.get(5).map_err(&err)?;
    Ok(ArchivedMessage {
        message_id: row.get(0).map_err(&err)?,
        message_key: row.get(1).map_err(&err)?,
        message_type: parse_enum(&row.get::<String>(2).map_err(&err)?)?,
        message_state: parse_enum(&row.get::<String>(3).map_err(&err)?)?,
        error_count: row.get::<i64>(4).map_err(&err)?.max(0) as u32,
        snapshot: serde_json::from_str(&snapshot)
            .map_err(|e| DatabaseError::Serialization(format!("archive snapshot: {e}")))?,
        archived_by: row.get(6).map_err(&err)?,
        archived_on_utc: parse_datetime(&row.get::<String>(7).map_err(&err)?),
    })
}

// ── Message rows ────────────────────────────────────────────────────

async fn query_messages(
    conn: &Connection,
    sql: &str,
    args: impl IntoParams,
) -> Result<Vec<Message>, DatabaseError> {
    let mut rows = conn.query(sql, args).await.map_err(query_err("query_messages"))?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("query_messages"))? {
        messages.push(row_to_message(&row)?);
    }
    for message in &mut messages {
        load_children(conn, message).await?;
    }
    Ok(messages)
}

async fn load_message(conn: &Connection, id: MessageId) -> Result<Option<Message>, DatabaseError> {
    let mut found = query_messages(
        conn,
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        params![id],
    )
    .await?;
    Ok(found.pop())
}

async fn load_children(conn: &Connection, message: &mut Message) -> Result<(), DatabaseError> {
    let Some(id) = message.id else {
        return Ok(());
    };

    let mut rows = conn
        .query(
            "SELECT name, mime_type, file_type, content FROM attachments
             WHERE message_id = ?1 ORDER BY position ASC",
            params![id],
        )
        .await
        .map_err(query_err("load attachments"))?;
    let err = query_err("attachment row parse");
    message.attachments.clear();
    while let Some(row) = rows.next().await.map_err(query_err("load attachments"))? {
        message.attachments.push(Attachment {
            name: row.get(0).map_err(&err)?,
            mime_type: row.get(1).map_err(&err)?,
            file_type: parse_enum(&row.get::<String>(2).map_err(&err)?)?,
            content: row.get::<Vec<u8>>(3).map_err(&err)?,
        });
    }

    let mut rows = conn
        .query(
            "SELECT name, kind, value FROM message_properties
             WHERE message_id = ?1 ORDER BY position ASC",
            params![id],
        )
        .await
        .map_err(query_err("load properties"))?;
    let err = query_err("property row parse");
    message.properties.clear();
    while let Some(row) = rows.next().await.map_err(query_err("load properties"))? {
        let name: String = row.get(0).map_err(&err)?;
        let kind: String = row.get(1).map_err(&err)?;
        let raw: String = row.get(2).map_err(&err)?;
        let value = PropertyValue::parse(&kind, &raw).map_err(DatabaseError::Serialization)?;
        message.properties.push(MessageProperty { name, value });
    }
    Ok(())
}

async fn insert_children(
    conn: &Connection,
    id: MessageId,
    message: &Message,
) -> Result<(), DatabaseError> {
    for (position, att) in message.attachments.iter().enumerate() {
        conn.execute(
            "INSERT INTO attachments (message_id, position, name, mime_type, file_type, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                position as i64,
                att.name.clone(),
                att.mime_type.clone(),
                att.file_type.as_str(),
                att.content.clone(),
            ],
        )
        .await
        .map_err(query_err("insert attachment"))?;
    }
    for (position, prop) in message.properties.iter().enumerate() {
        conn.execute(
            "INSERT INTO message_properties (message_id, position, name, kind, value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                position as i64,
                prop.name.clone(),
                prop.value.kind(),
                prop.value.to_storage(),
            ],
        )
        .await
        .map_err(query_err("insert property"))?;
    }
    Ok(())
}

async fn delete_children(conn: &Connection, id: MessageId) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM attachments WHERE message_id = ?1", params![id])
        .await
        .map_err(query_err("delete attachments"))?;
    conn.execute(
        "DELETE FROM message_properties WHERE message_id = ?1",
        params![id],
    )
    .await
    .map_err(query_err("delete properties"))?;
    Ok(())
}

async fn insert_message_rows(
    conn: &Connection,
    message: &Message,
    user: &str,
    now: &DateTime<Utc>,
) -> Result<MessageId, DatabaseError> {
    let content = serde_json::to_string(&message.content)
        .map_err(|e| DatabaseError::Serialization(format!("message content: {e}")))?;
    conn.execute(
        "INSERT INTO messages (message_key, message_type, message_state, priority, is_disabled,
            error_count, process_after_utc, archive_after_utc, content, created_by,
            created_on_utc, last_updated_by, last_updated_on_utc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?10, ?12)",
        params![
            normalize_key(&message.message_key),
            message.message_type().as_str(),
            message.message_state.as_str(),
            i64::from(message.priority),
            flag(message.is_disabled),
            i64::from(message.error_count),
            ts(&message.process_after_utc),
            ts(&message.archive_after_utc),
            content,
            user,
            ts(&message.created_on_utc),
            ts(now),
        ],
    )
    .await
    .map_err(query_err("insert message"))?;
    let id = conn.last_insert_rowid();
    insert_children(conn, id, message).await?;
    Ok(id)
}

async fn update_message_rows(
    conn: &Connection,
    id: MessageId,
    message: &Message,
    user: &str,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let content = serde_json::to_string(&message.content)
        .map_err(|e| DatabaseError::Serialization(format!("message content: {e}")))?;
    // State and error_count change only through record_outcome; the channel
    // is fixed at creation.
    let changed = conn
        .execute(
            "UPDATE messages SET priority = ?1, is_disabled = ?2, content = ?3,
                last_updated_by = ?4, last_updated_on_utc = ?5
             WHERE id = ?6 AND message_type = ?7",
            params![
                i64::from(message.priority),
                flag(message.is_disabled),
                content,
                user,
                ts(now),
                id,
                message.message_type().as_str(),
            ],
        )
        .await
        .map_err(query_err("update message"))?;

    if changed == 0 {
        return Err(match load_message(conn, id).await? {
            Some(stored) => DatabaseError::Constraint(format!(
                "message {} is {} and cannot become {}",
                stored.message_key,
                stored.message_type(),
                message.message_type()
            )),
            None => DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            },
        });
    }

    delete_children(conn, id).await?;
    insert_children(conn, id, message).await?;
    Ok(())
}

async fn record_outcome_rows(
    conn: &Connection,
    id: MessageId,
    message: &Message,
    logs: &[PipelineLog],
    user: &str,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    for log in logs {
        insert_log(conn, log).await?;
    }

    // error_count never decreases; Sent is final.
    let changed = conn
        .execute(
            "UPDATE messages SET message_state = ?1, error_count = MAX(error_count, ?2),
                last_updated_by = ?3, last_updated_on_utc = ?4
             WHERE id = ?5 AND message_state <> 'sent'",
            params![
                message.message_state.as_str(),
                i64::from(message.error_count),
                user,
                ts(now),
                id,
            ],
        )
        .await
        .map_err(query_err("record outcome"))?;

    if changed == 0 {
        return Err(match load_message(conn, id).await? {
            Some(stored) => DatabaseError::Constraint(format!(
                "message {} is already sent",
                stored.message_key
            )),
            None => DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            },
        });
    }
    Ok(())
}

async fn insert_log(conn: &Connection, log: &PipelineLog) -> Result<PipelineLogId, DatabaseError> {
    conn.execute(
        "INSERT INTO pipeline_logs (message_id, provider_type_id, provider_name, outcome,
            detail, created_by, created_on_utc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            log.message_id,
            opt_int(log.provider_type_id),
            opt_text(log.provider_name.as_deref()),
            log.outcome.as_str(),
            opt_text(log.detail.as_deref()),
            log.created_by.clone(),
            ts(&log.created_on_utc),
        ],
    )
    .await
    .map_err(query_err("insert pipeline log"))?;
    Ok(conn.last_insert_rowid())
}

async fn archive_message_rows(
    conn: &Connection,
    id: MessageId,
    user: &str,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let stored = load_message(conn, id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "message".into(),
            id: id.to_string(),
        })?;
    let snapshot = serde_json::to_string(&stored)
        .map_err(|e| DatabaseError::Serialization(format!("archive snapshot: {e}")))?;

    conn.execute(
        &format!("INSERT INTO archived_messages ({ARCHIVE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            id,
            stored.message_key.clone(),
            stored.message_type().as_str(),
            stored.message_state.as_str(),
            i64::from(stored.error_count),
            snapshot,
            user,
            ts(now),
        ],
    )
    .await
    .map_err(query_err("insert archived message"))?;

    delete_children(conn, id).await?;
    conn.execute("DELETE FROM messages WHERE id = ?1", params![id])
        .await
        .map_err(query_err("delete archived message"))?;
    Ok(())
}

// ── Provider rows ───────────────────────────────────────────────────

async fn query_providers(
    conn: &Connection,
    sql: &str,
    args: impl IntoParams,
) -> Result<Vec<ProviderType>, DatabaseError> {
    let mut rows = conn.query(sql, args).await.map_err(query_err("query_providers"))?;
    let mut providers = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("query_providers"))? {
        providers.push(row_to_provider(&row)?);
    }
    for provider in &mut providers {
        load_parameters(conn, provider).await?;
    }
    Ok(providers)
}

async fn load_parameters(conn: &Connection, provider: &mut ProviderType) -> Result<(), DatabaseError> {
    let Some(id) = provider.id else {
        return Ok(());
    };
    let mut rows = conn
        .query(
            "SELECT name, value FROM provider_parameters
             WHERE provider_type_id = ?1 ORDER BY position ASC",
            params![id],
        )
        .await
        .map_err(query_err("load parameters"))?;
    let err = query_err("parameter row parse");
    provider.parameters.clear();
    while let Some(row) = rows.next().await.map_err(query_err("load parameters"))? {
        provider.parameters.push(ProviderParameter {
            name: row.get(0).map_err(&err)?,
            value: ParameterValue::Encrypted(row.get(1).map_err(&err)?),
        });
    }
    Ok(())
}

async fn replace_parameters(
    conn: &Connection,
    id: ProviderId,
    provider: &ProviderType,
) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM provider_parameters WHERE provider_type_id = ?1",
        params![id],
    )
    .await
    .map_err(query_err("delete parameters"))?;

    for (position, param) in provider.parameters.iter().enumerate() {
        let ParameterValue::Encrypted(sealed) = &param.value else {
            return Err(DatabaseError::Constraint(format!(
                "parameter {} of provider {} is not encrypted",
                param.name, provider.name
            )));
        };
        conn.execute(
            "INSERT INTO provider_parameters (provider_type_id, position, name, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, position as i64, param.name.clone(), sealed.clone()],
        )
        .await
        .map_err(query_err("insert parameter"))?;
    }
    Ok(())
}

async fn load_provider(conn: &Connection, id: ProviderId) -> Result<ProviderType, DatabaseError> {
    query_providers(
        conn,
        &format!("SELECT {PROVIDER_COLUMNS} FROM provider_types WHERE id = ?1"),
        params![id],
    )
    .await?
    .pop()
    .ok_or_else(|| DatabaseError::NotFound {
        entity: "provider".into(),
        id: id.to_string(),
    })
}

/// Run `body` inside a transaction, committing on success and rolling back on error.
macro_rules! in_transaction {
    ($conn:expr, $context:literal, |$tx:ident| $body:expr) => {{
        let $tx = $conn.transaction().await.map_err(query_err($context))?;
        match $body {
            Ok(value) => {
                $tx.commit().await.map_err(query_err($context))?;
                Ok(value)
            }
            Err(e) => {
                let _ = $tx.rollback().await;
                Err(e)
            }
        }
    }};
}

#[async_trait]
impl MessageStore for LibSqlBackend {
    async fn find_ready_to_process(&self) -> Result<Vec<Message>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_messages(
            &self.conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE is_disabled = 0
                   AND message_state NOT IN ('failed', 'sent')
                   AND process_after_utc <= ?1
                 ORDER BY created_on_utc DESC, priority ASC, id ASC"
            ),
            params![ts(&Utc::now())],
        )
        .await
    }

    async fn find_ready_to_retry(
        &self,
        max_error_count: u32,
    ) -> Result<Vec<Message>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_messages(
            &self.conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE is_disabled = 0
                   AND message_state = 'failed'
                   AND error_count < ?1
                 ORDER BY created_on_utc DESC, priority ASC, id ASC"
            ),
            params![i64::from(max_error_count)],
        )
        .await
    }

    async fn find_ready_to_archive(
        &self,
        max_days_to_live: u32,
    ) -> Result<Vec<Message>, DatabaseError> {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::days(i64::from(max_days_to_live));
        let _guard = self.lock.lock().await;
        query_messages(
            &self.conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE is_disabled = 0
                   AND (archive_after_utc <= ?1 OR created_on_utc <= ?2)
                 ORDER BY created_on_utc ASC, id ASC"
            ),
            params![ts(&now), ts(&cutoff)],
        )
        .await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Message>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut found = query_messages(
            &self.conn,
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_key = ?1"),
            params![normalize_key(key)],
        )
        .await?;
        Ok(found.pop())
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, DatabaseError> {
        let _guard = self.lock.lock().await;
        load_message(&self.conn, id).await
    }

    async fn create(&self, message: &Message, user: &str) -> Result<Message, DatabaseError> {
        let now = Utc::now();
        let _guard = self.lock.lock().await;
        let id: MessageId = in_transaction!(self.conn, "create message", |tx| {
            insert_message_rows(&tx, message, user, &now).await
        })?;
        debug!(message_id = id, message_key = %message.message_key, "Message inserted into DB");
        load_message(&self.conn, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            })
    }

    async fn update(&self, message: &Message, user: &str) -> Result<Message, DatabaseError> {
        let id = message.id.ok_or_else(|| DatabaseError::NotFound {
            entity: "message".into(),
            id: message.message_key.clone(),
        })?;
        let now = Utc::now();
        let _guard = self.lock.lock().await;
        in_transaction!(self.conn, "update message", |tx| {
            update_message_rows(&tx, id, message, user, &now).await
        })?;
        debug!(message_id = id, state = %message.message_state, "Message updated in DB");
        load_message(&self.conn, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            })
    }

    async fn record_outcome(
        &self,
        message: &Message,
        logs: &[PipelineLog],
        user: &str,
    ) -> Result<Message, DatabaseError> {
        let id = message.id.ok_or_else(|| DatabaseError::NotFound {
            entity: "message".into(),
            id: message.message_key.clone(),
        })?;
        let now = Utc::now();
        let _guard = self.lock.lock().await;
        in_transaction!(self.conn, "record outcome", |tx| {
            record_outcome_rows(&tx, id, message, logs, user, &now).await
        })?;
        debug!(
            message_id = id,
            state = %message.message_state,
            logs = logs.len(),
            "Dispatch outcome recorded"
        );
        load_message(&self.conn, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            })
    }

    async fn delete(&self, message: &Message, user: &str) -> Result<(), DatabaseError> {
        let id = message.id.ok_or_else(|| DatabaseError::NotFound {
            entity: "message".into(),
            id: message.message_key.clone(),
        })?;
        let _guard = self.lock.lock().await;
        in_transaction!(self.conn, "delete message", |tx| {
            async {
                delete_children(&tx, id).await?;
                tx.execute("DELETE FROM messages WHERE id = ?1", params![id])
                    .await
                    .map_err(query_err("delete message"))
            }
            .await
        })?;
        debug!(message_id = id, user, "Message deleted from DB");
        Ok(())
    }

    async fn archive(&self, message: &Message, user: &str) -> Result<(), DatabaseError> {
        let id = message.id.ok_or_else(|| DatabaseError::NotFound {
            entity: "message".into(),
            id: message.message_key.clone(),
        })?;
        let now = Utc::now();
        let _guard = self.lock.lock().await;
        in_transaction!(self.conn, "archive message", |tx| {
            archive_message_rows(&tx, id, user, &now).await
        })?;
        debug!(message_id = id, message_key = %message.message_key, "Message archived");
        Ok(())
    }

    async fn find_archived_by_key(
        &self,
        key: &str,
    ) -> Result<Option<ArchivedMessage>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ARCHIVE_COLUMNS} FROM archived_messages
                     WHERE message_key = ?1 ORDER BY id DESC LIMIT 1"
                ),
                params![normalize_key(key)],
            )
            .await
            .map_err(query_err("find_archived_by_key"))?;
        match rows.next().await.map_err(query_err("find_archived_by_key"))? {
            Some(row) => Ok(Some(row_to_archived(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProviderRegistry for LibSqlBackend {
    async fn find_for_emails(&self) -> Result<Vec<ProviderType>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_providers(
            &self.conn,
            &format!(
                "SELECT {PROVIDER_COLUMNS} FROM provider_types
                 WHERE is_disabled = 0 AND can_process_emails = 1
                 ORDER BY priority DESC, name ASC"
            ),
            (),
        )
        .await
    }

    async fn find_for_texts(&self) -> Result<Vec<ProviderType>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_providers(
            &self.conn,
            &format!(
                "SELECT {PROVIDER_COLUMNS} FROM provider_types
                 WHERE is_disabled = 0 AND can_process_texts = 1
                 ORDER BY priority DESC, name ASC"
            ),
            (),
        )
        .await
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ProviderType>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut found = query_providers(
            &self.conn,
            &format!("SELECT {PROVIDER_COLUMNS} FROM provider_types WHERE name = ?1"),
            params![name.trim()],
        )
        .await?;
        Ok(found.pop())
    }

    async fn find_all(&self) -> Result<Vec<ProviderType>, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_providers(
            &self.conn,
            &format!("SELECT {PROVIDER_COLUMNS} FROM provider_types ORDER BY priority DESC, name ASC"),
            (),
        )
        .await
    }

    async fn create(
        &self,
        provider: &ProviderType,
        user: &str,
    ) -> Result<ProviderType, DatabaseError> {
        let now = ts(&Utc::now());
        let _guard = self.lock.lock().await;
        let id: ProviderId = in_transaction!(self.conn, "create provider", |tx| {
            async {
                tx.execute(
                    "INSERT INTO provider_types (name, priority, is_disabled, can_process_emails,
                        can_process_texts, created_by, created_on_utc, last_updated_by,
                        last_updated_on_utc)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6, ?7)",
                    params![
                        provider.name.trim(),
                        i64::from(provider.priority),
                        flag(provider.is_disabled),
                        flag(provider.can_process_emails),
                        flag(provider.can_process_texts),
                        user,
                        now.clone(),
                    ],
                )
                .await
                .map_err(query_err("insert provider"))?;
                let id = tx.last_insert_rowid();
                replace_parameters(&tx, id, provider).await?;
                Ok::<_, DatabaseError>(id)
            }
            .await
        })?;
        debug!(provider_id = id, provider = %provider.name, "Provider inserted into DB");
        load_provider(&self.conn, id).await
    }

    async fn update(
        &self,
        provider: &ProviderType,
        user: &str,
    ) -> Result<ProviderType, DatabaseError> {
        let id = provider.id.ok_or_else(|| DatabaseError::NotFound {
            entity: "provider".into(),
            id: provider.name.clone(),
        })?;
        let now = ts(&Utc::now());
        let _guard = self.lock.lock().await;
        in_transaction!(self.conn, "update provider", |tx| {
            async {
                let changed = tx
                    .execute(
                        "UPDATE provider_types SET name = ?1, priority = ?2, is_disabled = ?3,
                            can_process_emails = ?4, can_process_texts = ?5,
                            last_updated_by = ?6, last_updated_on_utc = ?7
                         WHERE id = ?8",
                        params![
                            provider.name.trim(),
                            i64::from(provider.priority),
                            flag(provider.is_disabled),
                            flag(provider.can_process_emails),
                            flag(provider.can_process_texts),
                            user,
                            now.clone(),
                            id,
                        ],
                    )
                    .await
                    .map_err(query_err("update provider"))?;
                if changed == 0 {
                    return Err(DatabaseError::NotFound {
                        entity: "provider".into(),
                        id: id.to_string(),
                    });
                }
                replace_parameters(&tx, id, provider).await
            }
            .await
        })?;
        debug!(provider_id = id, provider = %provider.name, "Provider updated in DB");
        load_provider(&self.conn, id).await
    }
}

#[async_trait]
impl PipelineLogStore for LibSqlBackend {
    async fn create(&self, log: &PipelineLog) -> Result<PipelineLog, DatabaseError> {
        let _guard = self.lock.lock().await;
        let id = insert_log(&self.conn, log).await?;
        Ok(PipelineLog {
            id: Some(id),
            ..log.clone()
        })
    }

    async fn find_by_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<PipelineLog>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM pipeline_logs WHERE message_id = ?1 ORDER BY id ASC"
                ),
                params![message_id],
            )
            .await
            .map_err(query_err("find_by_message"))?;
        let mut logs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("find_by_message"))? {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }
}
