//! Ledger and queue schema.
//!
//! Every statement is idempotent so each process role can run
//! [`init_schema`] at startup.

use sqlx::PgPool;

const CREATE_CLIENTS: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    id      BIGINT PRIMARY KEY,
    balance NUMERIC NOT NULL DEFAULT 0 CHECK (balance >= 0)
)
"#;

const CREATE_TRANSACTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id              TEXT PRIMARY KEY,
    from_account_id BIGINT NOT NULL,
    to_account_id   BIGINT NOT NULL,
    amount          NUMERIC NOT NULL,
    status          TEXT NOT NULL CHECK (status IN ('pending', 'successful', 'failed')),
    error_message   TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_QUEUE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS queue_messages (
    id         BIGSERIAL PRIMARY KEY,
    queue      TEXT NOT NULL,
    payload    BYTEA NOT NULL,
    attempts   INT NOT NULL DEFAULT 0,
    visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_QUEUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_queue_messages_ready
    ON queue_messages (queue, visible_at, id)
"#;

/// Statements in execution order
pub const SCHEMA: [&str; 4] = [
    CREATE_CLIENTS,
    CREATE_TRANSACTIONS,
    CREATE_QUEUE_MESSAGES,
    CREATE_QUEUE_INDEX,
];

/// Create the ledger and queue tables if they do not exist yet.
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Ledger schema ready");
    Ok(())
}
