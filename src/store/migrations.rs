//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//!
//! Idempotency of the pipeline rests on the unique indexes declared here:
//! one contact per address, one open lead per contact, one conversation per
//! (contact, channel), one message per (channel, provider id).

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
        name: "identity_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                channel TEXT NOT NULL,
                display_name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_address ON contacts(address);

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL REFERENCES contacts(id),
                stage TEXT NOT NULL DEFAULT 'NEW',
                priority TEXT NOT NULL DEFAULT 'NORMAL',
                score INTEGER NOT NULL DEFAULT 0,
                next_follow_up_at TEXT,
                expires_at TEXT,
                archived_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_contact ON leads(contact_id, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_leads_one_open ON leads(contact_id)
                WHERE archived_at IS NULL AND stage NOT IN ('COMPLETED_WON', 'COMPLETED_LOST');
            CREATE INDEX IF NOT EXISTS idx_leads_follow_up ON leads(next_follow_up_at);
            CREATE INDEX IF NOT EXISTS idx_leads_expires ON leads(expires_at);

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL REFERENCES contacts(id),
                channel TEXT NOT NULL,
                lead_id TEXT REFERENCES leads(id),
                last_message_at TEXT,
                last_inbound_at TEXT,
                last_outbound_at TEXT,
                unread_count INTEGER NOT NULL DEFAULT 0,
                memory TEXT NOT NULL DEFAULT '{}',
                memory_version INTEGER NOT NULL DEFAULT 0,
                archived_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_contact_channel
                ON conversations(contact_id, channel);
            CREATE INDEX IF NOT EXISTS idx_conversations_last_inbound ON conversations(last_inbound_at);
            CREATE INDEX IF NOT EXISTS idx_conversations_last_outbound ON conversations(last_outbound_at);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                contact_id TEXT NOT NULL REFERENCES contacts(id),
                lead_id TEXT REFERENCES leads(id),
                channel TEXT NOT NULL,
                direction TEXT NOT NULL,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                media TEXT,
                status TEXT NOT NULL,
                provider_message_id TEXT,
                content_hash TEXT,
                origin TEXT NOT NULL,
                reply_key TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_provider_id
                ON messages(channel, provider_message_id);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_outbound
                ON messages(contact_id, channel, direction, created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "automation_rules",
        sql: r#"
            CREATE TABLE IF NOT EXISTS automation_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                trigger_type TEXT NOT NULL,
                trigger_config TEXT NOT NULL,
                conditions TEXT NOT NULL DEFAULT '[]',
                cooldown_minutes INTEGER NOT NULL DEFAULT 0,
                actions TEXT NOT NULL,
                next_run_at TEXT,
                last_run_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rules_due ON automation_rules(enabled, next_run_at);

            CREATE TABLE IF NOT EXISTS rule_runs (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL REFERENCES automation_rules(id),
                lead_id TEXT,
                conversation_id TEXT,
                ran_at TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_rule_runs_rule_lead ON rule_runs(rule_id, lead_id, ran_at);

            CREATE TABLE IF NOT EXISTS lead_tasks (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL REFERENCES leads(id),
                rule_id TEXT,
                title TEXT NOT NULL,
                due_at TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_lead_tasks_lead ON lead_tasks(lead_id);
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

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
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

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
