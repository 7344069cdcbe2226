//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as fixed-width RFC 3339 UTC strings with millisecond precision so that
//! SQL comparisons on the text columns order chronologically.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::automation::rule::{AutomationRule, RuleRun, RunOutcome};
use crate::error::DatabaseError;
use crate::identity::model::{
    Channel, Contact, Conversation, DeliveryStatus, Lead, LeadPriority, LeadStage, LeadTask,
    MediaDescriptor, Message,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
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

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_all<T>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams + Send,
        map: fn(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            out.push(map(&row)?);
        }
        Ok(out)
    }

    async fn query_one<T>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams + Send,
        map: fn(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(map(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn exec(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams + Send,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(sql, params)
            .await
            .map_err(|e| write_error(op, e))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp text.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
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
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

/// Unique-constraint failures become `Constraint`, everything else `Query`.
fn write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(field: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

/// Read a text column, naming it in the error.
fn col_str(row: &libsql::Row, idx: i32, field: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

fn col_opt_str(row: &libsql::Row, idx: i32, field: &str) -> Result<Option<String>, DatabaseError> {
    row.get::<Option<String>>(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

fn col_i64(row: &libsql::Row, idx: i32, field: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

fn col_uuid(row: &libsql::Row, idx: i32, field: &str) -> Result<Uuid, DatabaseError> {
    let raw: String = col_str(row, idx, field)?;
    Uuid::parse_str(&raw).map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn col_opt_uuid(row: &libsql::Row, idx: i32, field: &str) -> Result<Option<Uuid>, DatabaseError> {
    let raw: Option<String> = col_opt_str(row, idx, field)?;
    raw.filter(|s| !s.is_empty())
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn col_ts(row: &libsql::Row, idx: i32, field: &str) -> Result<DateTime<Utc>, DatabaseError> {
    let raw: String = col_str(row, idx, field)?;
    Ok(parse_datetime(&raw))
}

fn col_opt_ts(
    row: &libsql::Row,
    idx: i32,
    field: &str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    let raw: Option<String> = col_opt_str(row, idx, field)?;
    Ok(raw.as_deref().map(parse_datetime))
}

fn col_parse<T>(row: &libsql::Row, idx: i32, field: &str) -> Result<T, DatabaseError>
where
    T: FromStr<Err = String>,
{
    let raw: String = col_str(row, idx, field)?;
    raw.parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("{field}: {e}")))
}

/// Decode a SCREAMING_SNAKE enum stored by its serde name.
fn col_tag<T: DeserializeOwned>(row: &libsql::Row, idx: i32, field: &str) -> Result<T, DatabaseError> {
    let raw: String = col_str(row, idx, field)?;
    serde_json::from_value(serde_json::Value::String(raw))
        .map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

// ── Row mapping ─────────────────────────────────────────────────────

const CONTACT_COLUMNS: &str = "id, address, channel, display_name, created_at, updated_at";

fn row_to_contact(row: &libsql::Row) -> Result<Contact, DatabaseError> {
    Ok(Contact {
        id: col_uuid(row, 0, "contact.id")?,
        address: col_str(row, 1, "contact.address")?,
        channel: col_parse(row, 2, "contact.channel")?,
        display_name: col_opt_str(row, 3, "contact.display_name")?,
        created_at: col_ts(row, 4, "contact.created_at")?,
        updated_at: col_ts(row, 5, "contact.updated_at")?,
    })
}

const LEAD_COLUMNS: &str = "id, contact_id, stage, priority, score, next_follow_up_at, expires_at, archived_at, created_at, updated_at";

const OPEN_LEAD: &str =
    "archived_at IS NULL AND stage NOT IN ('COMPLETED_WON', 'COMPLETED_LOST')";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    Ok(Lead {
        id: col_uuid(row, 0, "lead.id")?,
        contact_id: col_uuid(row, 1, "lead.contact_id")?,
        stage: col_parse(row, 2, "lead.stage")?,
        priority: col_parse(row, 3, "lead.priority")?,
        score: col_i64(row, 4, "lead.score")?,
        next_follow_up_at: col_opt_ts(row, 5, "lead.next_follow_up_at")?,
        expires_at: col_opt_ts(row, 6, "lead.expires_at")?,
        archived_at: col_opt_ts(row, 7, "lead.archived_at")?,
        created_at: col_ts(row, 8, "lead.created_at")?,
        updated_at: col_ts(row, 9, "lead.updated_at")?,
    })
}

const CONVERSATION_COLUMNS: &str = "id, contact_id, channel, lead_id, last_message_at, last_inbound_at, last_outbound_at, unread_count, memory, memory_version, archived_at, created_at, updated_at";

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let id = col_uuid(row, 0, "conversation.id")?;
    let memory_raw: String = col_str(row, 8, "conversation.memory")?;
    let memory = serde_json::from_str(&memory_raw).unwrap_or_else(|e| {
        warn!(conversation_id = %id, error = %e, "Unreadable conversation memory, treating as empty");
        serde_json::json!({})
    });
    let unread: i64 = col_i64(row, 7, "conversation.unread_count")?;

    Ok(Conversation {
        id,
        contact_id: col_uuid(row, 1, "conversation.contact_id")?,
        channel: col_parse(row, 2, "conversation.channel")?,
        lead_id: col_opt_uuid(row, 3, "conversation.lead_id")?,
        last_message_at: col_opt_ts(row, 4, "conversation.last_message_at")?,
        last_inbound_at: col_opt_ts(row, 5, "conversation.last_inbound_at")?,
        last_outbound_at: col_opt_ts(row, 6, "conversation.last_outbound_at")?,
        unread_count: u32::try_from(unread.max(0)).unwrap_or(u32::MAX),
        memory,
        memory_version: col_i64(row, 9, "conversation.memory_version")?,
        archived_at: col_opt_ts(row, 10, "conversation.archived_at")?,
        created_at: col_ts(row, 11, "conversation.created_at")?,
        updated_at: col_ts(row, 12, "conversation.updated_at")?,
    })
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, contact_id, lead_id, channel, direction, kind, body, media, status, provider_message_id, content_hash, origin, reply_key, error, created_at, updated_at";

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let media_raw: Option<String> = col_opt_str(row, 8, "message.media")?;
    let media: Option<MediaDescriptor> = media_raw
        .as_deref()
        .map(|raw| from_json("message.media", raw))
        .transpose()?;

    Ok(Message {
        id: col_uuid(row, 0, "message.id")?,
        conversation_id: col_uuid(row, 1, "message.conversation_id")?,
        contact_id: col_uuid(row, 2, "message.contact_id")?,
        lead_id: col_opt_uuid(row, 3, "message.lead_id")?,
        channel: col_parse(row, 4, "message.channel")?,
        direction: col_tag(row, 5, "message.direction")?,
        kind: col_tag(row, 6, "message.kind")?,
        body: col_str(row, 7, "message.body")?,
        media,
        status: col_parse(row, 9, "message.status")?,
        provider_message_id: col_opt_str(row, 10, "message.provider_message_id")?,
        content_hash: col_opt_str(row, 11, "message.content_hash")?,
        origin: col_tag(row, 12, "message.origin")?,
        reply_key: col_opt_str(row, 13, "message.reply_key")?,
        error: col_opt_str(row, 14, "message.error")?,
        created_at: col_ts(row, 15, "message.created_at")?,
        updated_at: col_ts(row, 16, "message.updated_at")?,
    })
}

const TASK_COLUMNS: &str = "id, lead_id, rule_id, title, due_at, created_at, completed_at";

fn row_to_task(row: &libsql::Row) -> Result<LeadTask, DatabaseError> {
    Ok(LeadTask {
        id: col_uuid(row, 0, "task.id")?,
        lead_id: col_uuid(row, 1, "task.lead_id")?,
        rule_id: col_opt_uuid(row, 2, "task.rule_id")?,
        title: col_str(row, 3, "task.title")?,
        due_at: col_opt_ts(row, 4, "task.due_at")?,
        created_at: col_ts(row, 5, "task.created_at")?,
        completed_at: col_opt_ts(row, 6, "task.completed_at")?,
    })
}

const RULE_COLUMNS: &str = "id, name, enabled, trigger_config, conditions, cooldown_minutes, actions, next_run_at, last_run_at, created_at, updated_at";

fn row_to_rule(row: &libsql::Row) -> Result<AutomationRule, DatabaseError> {
    let trigger_raw: String = col_str(row, 3, "rule.trigger_config")?;
    let conditions_raw: String = col_str(row, 4, "rule.conditions")?;
    let actions_raw: String = col_str(row, 6, "rule.actions")?;
    let enabled: i64 = col_i64(row, 2, "rule.enabled")?;
    let cooldown: i64 = col_i64(row, 5, "rule.cooldown_minutes")?;

    Ok(AutomationRule {
        id: col_uuid(row, 0, "rule.id")?,
        name: col_str(row, 1, "rule.name")?,
        enabled: enabled != 0,
        trigger: from_json("rule.trigger_config", &trigger_raw)?,
        conditions: from_json("rule.conditions", &conditions_raw)?,
        cooldown_minutes: u32::try_from(cooldown.max(0)).unwrap_or(u32::MAX),
        actions: from_json("rule.actions", &actions_raw)?,
        next_run_at: col_opt_ts(row, 7, "rule.next_run_at")?,
        last_run_at: col_opt_ts(row, 8, "rule.last_run_at")?,
        created_at: col_ts(row, 9, "rule.created_at")?,
        updated_at: col_ts(row, 10, "rule.updated_at")?,
    })
}

const RULE_RUN_COLUMNS: &str = "id, rule_id, lead_id, conversation_id, ran_at, outcome, detail";

fn row_to_rule_run(row: &libsql::Row) -> Result<RuleRun, DatabaseError> {
    Ok(RuleRun {
        id: col_uuid(row, 0, "rule_run.id")?,
        rule_id: col_uuid(row, 1, "rule_run.rule_id")?,
        lead_id: col_opt_uuid(row, 2, "rule_run.lead_id")?,
        conversation_id: col_opt_uuid(row, 3, "rule_run.conversation_id")?,
        ran_at: col_ts(row, 4, "rule_run.ran_at")?,
        outcome: col_parse::<RunOutcome>(row, 5, "rule_run.outcome")?,
        detail: col_opt_str(row, 6, "rule_run.detail")?,
    })
}

fn row_to_ran_at(row: &libsql::Row) -> Result<DateTime<Utc>, DatabaseError> {
    col_ts(row, 0, "rule_run.ran_at")
}

/// SQL list of the outcomes that start a cooldown, e.g. `'FIRED', 'FAILED'`.
fn cooldown_outcomes() -> String {
    RunOutcome::ALL
        .iter()
        .filter(|o| o.counts_for_cooldown())
        .map(|o| format!("'{}'", o.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn insert_contact_if_absent(&self, contact: &Contact) -> Result<bool, DatabaseError> {
        let inserted = self
            .exec(
                "insert_contact_if_absent",
                "INSERT OR IGNORE INTO contacts (id, address, channel, display_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    contact.id.to_string(),
                    contact.address.clone(),
                    contact.channel.as_str(),
                    opt_text(contact.display_name.as_deref()),
                    fmt_ts(contact.created_at),
                    fmt_ts(contact.updated_at),
                ],
            )
            .await?;
        if inserted > 0 {
            debug!(contact_id = %contact.id, address = %contact.address, "Contact created");
        }
        Ok(inserted > 0)
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, DatabaseError> {
        self.query_one(
            "get_contact",
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![id.to_string()],
            row_to_contact,
        )
        .await
    }

    async fn get_contact_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Contact>, DatabaseError> {
        self.query_one(
            "get_contact_by_address",
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE address = ?1"),
            params![address],
            row_to_contact,
        )
        .await
    }

    async fn set_contact_name_if_missing(
        &self,
        id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "set_contact_name_if_missing",
            "UPDATE contacts SET display_name = ?2, updated_at = ?3
             WHERE id = ?1 AND (display_name IS NULL OR display_name = '')",
            params![id.to_string(), name, fmt_ts(now)],
        )
        .await?;
        Ok(())
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead_if_absent(&self, lead: &Lead) -> Result<bool, DatabaseError> {
        let inserted = self
            .exec(
                "insert_lead_if_absent",
                "INSERT OR IGNORE INTO leads (id, contact_id, stage, priority, score,
                    next_follow_up_at, expires_at, archived_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    lead.id.to_string(),
                    lead.contact_id.to_string(),
                    lead.stage.as_str(),
                    lead.priority.as_str(),
                    lead.score,
                    opt_ts(lead.next_follow_up_at),
                    opt_ts(lead.expires_at),
                    opt_ts(lead.archived_at),
                    fmt_ts(lead.created_at),
                    fmt_ts(lead.updated_at),
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        self.query_one(
            "get_lead",
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
            params![id.to_string()],
            row_to_lead,
        )
        .await
    }

    async fn get_open_lead(&self, contact_id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        self.query_one(
            "get_open_lead",
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE contact_id = ?1 AND {OPEN_LEAD}"),
            params![contact_id.to_string()],
            row_to_lead,
        )
        .await
    }

    async fn get_latest_lead(&self, contact_id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        self.query_one(
            "get_latest_lead",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads WHERE contact_id = ?1 AND archived_at IS NULL
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ),
            params![contact_id.to_string()],
            row_to_lead,
        )
        .await
    }

    async fn update_lead_stage(
        &self,
        id: Uuid,
        stage: LeadStage,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .exec(
                "update_lead_stage",
                "UPDATE leads SET stage = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), stage.as_str(), fmt_ts(now)],
            )
            .await?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "lead".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn advance_lead_stage(
        &self,
        id: Uuid,
        from: LeadStage,
        to: LeadStage,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .exec(
                "advance_lead_stage",
                "UPDATE leads SET stage = ?3, updated_at = ?4 WHERE id = ?1 AND stage = ?2",
                params![id.to_string(), from.as_str(), to.as_str(), fmt_ts(now)],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn update_lead_priority(
        &self,
        id: Uuid,
        priority: LeadPriority,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "update_lead_priority",
            "UPDATE leads SET priority = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), priority.as_str(), fmt_ts(now)],
        )
        .await?;
        Ok(())
    }

    async fn adjust_lead_score(
        &self,
        id: Uuid,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "adjust_lead_score",
            "UPDATE leads SET score = score + ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), delta, fmt_ts(now)],
        )
        .await?;
        Ok(())
    }

    async fn set_lead_follow_up(
        &self,
        id: Uuid,
        at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "set_lead_follow_up",
            "UPDATE leads SET next_follow_up_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), opt_ts(at), fmt_ts(now)],
        )
        .await?;
        Ok(())
    }

    async fn set_lead_expiry(
        &self,
        id: Uuid,
        at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "set_lead_expiry",
            "UPDATE leads SET expires_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), opt_ts(at), fmt_ts(now)],
        )
        .await?;
        Ok(())
    }

    async fn archive_lead(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.exec(
            "archive_lead",
            "UPDATE leads SET archived_at = ?2, updated_at = ?2 WHERE id = ?1 AND archived_at IS NULL",
            params![id.to_string(), fmt_ts(now)],
        )
        .await?;
        Ok(())
    }

    async fn list_follow_up_due(&self, now: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError> {
        self.query_all(
            "list_follow_up_due",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads
                 WHERE {OPEN_LEAD} AND next_follow_up_at IS NOT NULL AND next_follow_up_at <= ?1
                 ORDER BY next_follow_up_at"
            ),
            params![fmt_ts(now)],
            row_to_lead,
        )
        .await
    }

    async fn list_expiring(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Lead>, DatabaseError> {
        self.query_all(
            "list_expiring",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads
                 WHERE {OPEN_LEAD} AND expires_at IS NOT NULL AND expires_at >= ?1 AND expires_at <= ?2
                 ORDER BY expires_at"
            ),
            params![fmt_ts(now), fmt_ts(until)],
            row_to_lead,
        )
        .await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn insert_conversation_if_absent(
        &self,
        conversation: &Conversation,
    ) -> Result<bool, DatabaseError> {
        let memory = to_json(&conversation.memory)?;
        let inserted = self
            .exec(
                "insert_conversation_if_absent",
                "INSERT OR IGNORE INTO conversations (id, contact_id, channel, lead_id,
                    last_message_at, last_inbound_at, last_outbound_at, unread_count,
                    memory, memory_version, archived_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    conversation.id.to_string(),
                    conversation.contact_id.to_string(),
                    conversation.channel.as_str(),
                    opt_uuid(conversation.lead_id),
                    opt_ts(conversation.last_message_at),
                    opt_ts(conversation.last_inbound_at),
                    opt_ts(conversation.last_outbound_at),
                    i64::from(conversation.unread_count),
                    memory,
                    conversation.memory_version,
                    opt_ts(conversation.archived_at),
                    fmt_ts(conversation.created_at),
                    fmt_ts(conversation.updated_at),
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        self.query_one(
            "get_conversation",
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id.to_string()],
            row_to_conversation,
        )
        .await
    }

    async fn find_conversation(
        &self,
        contact_id: Uuid,
        channel: Channel,
    ) -> Result<Option<Conversation>, DatabaseError> {
        self.query_one(
            "find_conversation",
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE contact_id = ?1 AND channel = ?2"
            ),
            params![contact_id.to_string(), channel.as_str()],
            row_to_conversation,
        )
        .await
    }

    async fn latest_conversation_for_contact(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<Conversation>, DatabaseError> {
        self.query_one(
            "latest_conversation_for_contact",
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE contact_id = ?1 AND archived_at IS NULL
                 ORDER BY COALESCE(last_message_at, created_at) DESC LIMIT 1"
            ),
            params![contact_id.to_string()],
            row_to_conversation,
        )
        .await
    }

    async fn set_conversation_lead(
        &self,
        id: Uuid,
        lead_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "set_conversation_lead",
            "UPDATE conversations SET lead_id = ?2, updated_at = ?3
             WHERE id = ?1 AND (lead_id IS NULL OR lead_id != ?2)",
            params![id.to_string(), lead_id.to_string(), fmt_ts(now)],
        )
        .await?;
        Ok(())
    }

    async fn record_conversation_inbound(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "record_conversation_inbound",
            "UPDATE conversations SET
                last_message_at = MAX(COALESCE(last_message_at, ''), ?2),
                last_inbound_at = MAX(COALESCE(last_inbound_at, ''), ?2),
                unread_count = unread_count + 1,
                updated_at = ?2
             WHERE id = ?1",
            params![id.to_string(), fmt_ts(at)],
        )
        .await?;
        Ok(())
    }

    async fn record_conversation_outbound(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "record_conversation_outbound",
            "UPDATE conversations SET
                last_message_at = MAX(COALESCE(last_message_at, ''), ?2),
                last_outbound_at = MAX(COALESCE(last_outbound_at, ''), ?2),
                updated_at = ?2
             WHERE id = ?1",
            params![id.to_string(), fmt_ts(at)],
        )
        .await?;
        Ok(())
    }

    async fn mark_conversation_read(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .exec(
                "mark_conversation_read",
                "UPDATE conversations SET unread_count = 0, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), fmt_ts(now)],
            )
            .await?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_conversation_memory(
        &self,
        id: Uuid,
        expected_version: i64,
        memory: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .exec(
                "update_conversation_memory",
                "UPDATE conversations SET memory = ?3, memory_version = memory_version + 1, updated_at = ?4
                 WHERE id = ?1 AND memory_version = ?2",
                params![id.to_string(), expected_version, to_json(memory)?, fmt_ts(now)],
            )
            .await?;
        if changed == 0 {
            debug!(conversation_id = %id, expected_version, "Memory version mismatch");
        }
        Ok(changed > 0)
    }

    async fn list_awaiting_customer(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        self.query_all(
            "list_awaiting_customer",
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE archived_at IS NULL
                   AND last_outbound_at IS NOT NULL AND last_outbound_at <= ?1
                   AND (last_inbound_at IS NULL OR last_inbound_at < last_outbound_at)
                 ORDER BY last_outbound_at"
            ),
            params![fmt_ts(cutoff)],
            row_to_conversation,
        )
        .await
    }

    async fn list_unanswered_inbound(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        self.query_all(
            "list_unanswered_inbound",
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE archived_at IS NULL
                   AND last_inbound_at IS NOT NULL AND last_inbound_at <= ?1
                   AND (last_outbound_at IS NULL OR last_outbound_at < last_inbound_at)
                 ORDER BY last_inbound_at"
            ),
            params![fmt_ts(cutoff)],
            row_to_conversation,
        )
        .await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message_if_absent(&self, message: &Message) -> Result<bool, DatabaseError> {
        let media = match &message.media {
            Some(m) => libsql::Value::Text(to_json(m)?),
            None => libsql::Value::Null,
        };
        let inserted = self
            .exec(
                "insert_message_if_absent",
                "INSERT OR IGNORE INTO messages (id, conversation_id, contact_id, lead_id, channel,
                    direction, kind, body, media, status, provider_message_id, content_hash,
                    origin, reply_key, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.contact_id.to_string(),
                    opt_uuid(message.lead_id),
                    message.channel.as_str(),
                    message.direction.as_str(),
                    message.kind.as_str(),
                    message.body.clone(),
                    media,
                    message.status.as_str(),
                    opt_text(message.provider_message_id.as_deref()),
                    opt_text(message.content_hash.as_deref()),
                    message.origin.as_str(),
                    opt_text(message.reply_key.as_deref()),
                    opt_text(message.error.as_deref()),
                    fmt_ts(message.created_at),
                    fmt_ts(message.updated_at),
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError> {
        self.query_one(
            "get_message",
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.to_string()],
            row_to_message,
        )
        .await
    }

    async fn delete_message(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.exec(
            "delete_message",
            "DELETE FROM messages WHERE id = ?1",
            params![id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn get_message_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        self.query_one(
            "get_message_by_provider_id",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE channel = ?1 AND provider_message_id = ?2"
            ),
            params![channel.as_str(), provider_message_id],
            row_to_message,
        )
        .await
    }

    async fn update_message_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "update_message_delivery",
            "UPDATE messages SET status = ?2,
                provider_message_id = COALESCE(?3, provider_message_id),
                error = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                status.as_str(),
                opt_text(provider_message_id),
                opt_text(error),
                fmt_ts(now),
            ],
        )
        .await?;
        Ok(())
    }

    async fn recent_outbound(
        &self,
        contact_id: Uuid,
        lead_id: Option<Uuid>,
        channel: Channel,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>, DatabaseError> {
        self.query_all(
            "recent_outbound",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE contact_id = ?1 AND lead_id IS ?2 AND channel = ?3
                   AND direction = 'OUTBOUND' AND status != 'FAILED' AND created_at >= ?4
                 ORDER BY created_at DESC, rowid DESC"
            ),
            params![
                contact_id.to_string(),
                opt_uuid(lead_id),
                channel.as_str(),
                fmt_ts(since),
            ],
            row_to_message,
        )
        .await
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        let mut messages = self
            .query_all(
                "list_messages",
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![conversation_id.to_string(), limit as i64],
                row_to_message,
            )
            .await?;
        messages.reverse();
        Ok(messages)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &LeadTask) -> Result<(), DatabaseError> {
        self.exec(
            "insert_task",
            "INSERT INTO lead_tasks (id, lead_id, rule_id, title, due_at, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task.id.to_string(),
                task.lead_id.to_string(),
                opt_uuid(task.rule_id),
                task.title.clone(),
                opt_ts(task.due_at),
                fmt_ts(task.created_at),
                opt_ts(task.completed_at),
            ],
        )
        .await?;
        debug!(task_id = %task.id, lead_id = %task.lead_id, "Task created");
        Ok(())
    }

    async fn list_tasks_for_lead(&self, lead_id: Uuid) -> Result<Vec<LeadTask>, DatabaseError> {
        self.query_all(
            "list_tasks_for_lead",
            &format!("SELECT {TASK_COLUMNS} FROM lead_tasks WHERE lead_id = ?1 ORDER BY created_at"),
            params![lead_id.to_string()],
            row_to_task,
        )
        .await
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn insert_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError> {
        self.exec(
            "insert_rule",
            "INSERT INTO automation_rules (id, name, enabled, trigger_type, trigger_config,
                conditions, cooldown_minutes, actions, next_run_at, last_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rule.id.to_string(),
                rule.name.clone(),
                rule.enabled as i64,
                rule.trigger.type_tag(),
                to_json(&rule.trigger)?,
                to_json(&rule.conditions)?,
                i64::from(rule.cooldown_minutes),
                to_json(&rule.actions)?,
                opt_ts(rule.next_run_at),
                opt_ts(rule.last_run_at),
                fmt_ts(rule.created_at),
                fmt_ts(rule.updated_at),
            ],
        )
        .await?;
        info!(rule_id = %rule.id, name = %rule.name, "Rule saved");
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, DatabaseError> {
        self.query_one(
            "get_rule",
            &format!("SELECT {RULE_COLUMNS} FROM automation_rules WHERE id = ?1"),
            params![id.to_string()],
            row_to_rule,
        )
        .await
    }

    async fn list_rules(&self) -> Result<Vec<AutomationRule>, DatabaseError> {
        self.query_all(
            "list_rules",
            &format!("SELECT {RULE_COLUMNS} FROM automation_rules ORDER BY created_at"),
            (),
            row_to_rule,
        )
        .await
    }

    async fn list_enabled_rules(&self) -> Result<Vec<AutomationRule>, DatabaseError> {
        self.query_all(
            "list_enabled_rules",
            &format!(
                "SELECT {RULE_COLUMNS} FROM automation_rules WHERE enabled = 1 ORDER BY created_at"
            ),
            (),
            row_to_rule,
        )
        .await
    }

    async fn list_due_scheduled_rules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AutomationRule>, DatabaseError> {
        self.query_all(
            "list_due_scheduled_rules",
            &format!(
                "SELECT {RULE_COLUMNS} FROM automation_rules
                 WHERE enabled = 1 AND trigger_type = 'SCHEDULED'
                   AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at"
            ),
            params![fmt_ts(now)],
            row_to_rule,
        )
        .await
    }

    async fn set_rule_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .exec(
                "set_rule_enabled",
                "UPDATE automation_rules SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), enabled as i64, fmt_ts(now)],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn swap_rule_schedule(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .exec(
                "swap_rule_schedule",
                "UPDATE automation_rules SET next_run_at = ?3, last_run_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND next_run_at IS ?2",
                params![
                    id.to_string(),
                    opt_ts(expected),
                    opt_ts(next_run_at),
                    fmt_ts(now)
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    // ── Rule runs ───────────────────────────────────────────────────

    async fn record_rule_run(&self, run: &RuleRun) -> Result<(), DatabaseError> {
        self.exec(
            "record_rule_run",
            "INSERT INTO rule_runs (id, rule_id, lead_id, conversation_id, ran_at, outcome, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.id.to_string(),
                run.rule_id.to_string(),
                opt_uuid(run.lead_id),
                opt_uuid(run.conversation_id),
                fmt_ts(run.ran_at),
                run.outcome.as_str(),
                opt_text(run.detail.as_deref()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn claim_rule_run(
        &self,
        run: &RuleRun,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        // Check and insert are one statement, so concurrent claims serialize.
        let inserted = self
            .exec(
                "claim_rule_run",
                &format!(
                    "INSERT INTO rule_runs (id, rule_id, lead_id, conversation_id, ran_at, outcome, detail)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
                     WHERE NOT EXISTS (
                         SELECT 1 FROM rule_runs
                         WHERE rule_id = ?2 AND lead_id IS ?3
                           AND outcome IN ({}) AND ran_at > ?8
                     )",
                    cooldown_outcomes()
                ),
                params![
                    run.id.to_string(),
                    run.rule_id.to_string(),
                    opt_uuid(run.lead_id),
                    opt_uuid(run.conversation_id),
                    fmt_ts(run.ran_at),
                    run.outcome.as_str(),
                    opt_text(run.detail.as_deref()),
                    fmt_ts(since),
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn finish_rule_run(
        &self,
        id: Uuid,
        outcome: RunOutcome,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "finish_rule_run",
            "UPDATE rule_runs SET outcome = ?2, detail = ?3 WHERE id = ?1",
            params![id.to_string(), outcome.as_str(), opt_text(detail)],
        )
        .await?;
        Ok(())
    }

    async fn last_rule_fire(
        &self,
        rule_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        self.query_one(
            "last_rule_fire",
            &format!(
                "SELECT ran_at FROM rule_runs
                 WHERE rule_id = ?1 AND lead_id = ?2 AND outcome IN ({})
                 ORDER BY ran_at DESC LIMIT 1",
                cooldown_outcomes()
            ),
            params![rule_id.to_string(), lead_id.to_string()],
            row_to_ran_at,
        )
        .await
    }

    async fn list_rule_runs(
        &self,
        rule_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RuleRun>, DatabaseError> {
        self.query_all(
            "list_rule_runs",
            &format!(
                "SELECT {RULE_RUN_COLUMNS} FROM rule_runs WHERE rule_id = ?1
                 ORDER BY ran_at DESC, rowid DESC LIMIT ?2"
            ),
            params![rule_id.to_string(), limit as i64],
            row_to_rule_run,
        )
        .await
    }
}
