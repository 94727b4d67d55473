//! PostgreSQL ledger store.
//!
//! Row locks come from `SELECT ... FOR UPDATE`; the record claim inserts a
//! pending row (`ON CONFLICT DO NOTHING`) before locking it, so two deliveries
//! of one transaction id serialize on the primary key even when intake's
//! pending event has not been logged yet.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashSet;
use tracing::debug;

use super::{LedgerStore, LedgerTx, StoreError, UpsertOutcome};
use crate::settlement::state::TransactionStatus;
use crate::settlement::types::{
    Account, AccountId, TransactionId, TransactionRecord, TransferRequest,
};

/// Insert-or-promote under the monotonic rule. No row comes back when the
/// existing record is kept.
const UPSERT_RECORD: &str = r#"
INSERT INTO transactions
    (id, from_account_id, to_account_id, amount, status, error_message, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, NOW(), NOW())
ON CONFLICT (id) DO UPDATE
    SET status = EXCLUDED.status,
        error_message = EXCLUDED.error_message,
        updated_at = NOW()
    WHERE transactions.status = 'pending'
      AND EXCLUDED.status <> 'pending'
RETURNING (xmax = 0) AS inserted
"#;

const CLAIM_RECORD: &str = r#"
INSERT INTO transactions
    (id, from_account_id, to_account_id, amount, status, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, 'pending', NOW(), NOW())
ON CONFLICT (id) DO NOTHING
"#;

const SELECT_RECORD: &str = r#"
SELECT id, from_account_id, to_account_id, amount, status, error_message, created_at
FROM transactions
WHERE id = $1
"#;

const LOCK_RECORD: &str = r#"
SELECT id, from_account_id, to_account_id, amount, status, error_message, created_at
FROM transactions
WHERE id = $1
FOR UPDATE
"#;

const LOCK_ACCOUNTS: &str = r#"
SELECT id, balance
FROM clients
WHERE id = ANY($1)
ORDER BY id
FOR UPDATE
"#;

const ADJUST_BALANCE: &str = r#"
UPDATE clients
SET balance = balance + $1
WHERE id = $2
RETURNING balance
"#;

/// `check_violation`, raised by `clients.balance >= 0`
const CHECK_VIOLATION: &str = "23514";

/// PostgreSQL-backed [`LedgerStore`]
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create an account or reset its balance
    pub async fn open_account(&self, id: AccountId, balance: Decimal) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO clients (id, balance) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET balance = EXCLUDED.balance
            "#,
        )
        .bind(id)
        .bind(balance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create an account unless it already exists; returns whether it was created
    pub async fn seed_account(&self, id: AccountId, balance: Decimal) -> Result<bool, StoreError> {
        let created = sqlx::query(
            "INSERT INTO clients (id, balance) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(balance)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(created > 0)
    }
}

async fn upsert_record_with<'e, E>(
    executor: E,
    record: &TransactionRecord,
) -> Result<UpsertOutcome, StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(UPSERT_RECORD)
        .bind(record.transaction_id.as_str())
        .bind(record.sender_id)
        .bind(record.receiver_id)
        .bind(record.amount)
        .bind(record.status.as_str())
        .bind(record.status.error_message())
        .fetch_optional(executor)
        .await?;

    match row {
        None => Ok(UpsertOutcome::Unchanged),
        Some(row) if row.try_get::<bool, _>("inserted")? => Ok(UpsertOutcome::Inserted),
        Some(_) => Ok(UpsertOutcome::Promoted),
    }
}

/// Convert database row to TransactionRecord
fn row_to_record(row: &PgRow) -> Result<TransactionRecord, StoreError> {
    let word: String = row.try_get("status")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    let status = TransactionStatus::from_parts(&word, error_message.as_deref())
        .ok_or_else(|| StoreError::Corrupt(format!("Invalid status: {}", word)))?;

    let id: String = row.try_get("id")?;
    Ok(TransactionRecord {
        transaction_id: TransactionId::from(id),
        sender_id: row.try_get("from_account_id")?,
        receiver_id: row.try_get("to_account_id")?,
        amount: row.try_get("amount")?,
        status,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx {
            tx: Some(tx),
            locked: HashSet::new(),
        }))
    }

    async fn upsert_record(&self, record: &TransactionRecord) -> Result<UpsertOutcome, StoreError> {
        upsert_record_with(&self.pool, record).await
    }

    async fn record(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM clients WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.map(|balance| Account { id, balance }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct PgLedgerTx {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    locked: HashSet<AccountId>,
}

impl PgLedgerTx {
    fn conn(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn claim_record(&mut self, req: &TransferRequest) -> Result<TransactionRecord, StoreError> {
        let tx = self.conn()?;

        let inserted = sqlx::query(CLAIM_RECORD)
            .bind(req.transaction_id.as_str())
            .bind(req.from_account_id)
            .bind(req.to_account_id)
            .bind(req.amount)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        if inserted > 0 {
            debug!(transaction_id = %req.transaction_id, "Record created on first worker touch");
        }

        let row = sqlx::query(LOCK_RECORD)
            .bind(req.transaction_id.as_str())
            .fetch_one(&mut **tx)
            .await?;
        row_to_record(&row)
    }

    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        let mut ordered = ids.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let tx = self.conn()?;
        let rows = sqlx::query(LOCK_ACCOUNTS)
            .bind(ordered)
            .fetch_all(&mut **tx)
            .await?;

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            accounts.push(Account {
                id: row.try_get("id")?,
                balance: row.try_get("balance")?,
            });
        }
        self.locked.extend(accounts.iter().map(|a| a.id));
        Ok(accounts)
    }

    async fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Decimal, StoreError> {
        if !self.locked.contains(&id) {
            return Err(StoreError::AccountNotLocked(id));
        }
        let tx = self.conn()?;

        let balance: Option<Decimal> = sqlx::query_scalar(ADJUST_BALANCE)
            .bind(delta)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| {
                let negative = e
                    .as_database_error()
                    .and_then(|db| db.code())
                    .is_some_and(|code| code == CHECK_VIOLATION);
                if negative {
                    StoreError::NegativeBalance(id)
                } else {
                    StoreError::from(e)
                }
            })?;

        balance.ok_or(StoreError::AccountNotFound(id))
    }

    async fn upsert_record(&mut self, record: &TransactionRecord) -> Result<UpsertOutcome, StoreError> {
        let tx = self.conn()?;
        upsert_record_with(&mut **tx, record).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await?;
        self.locked.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.rollback().await?;
        self.locked.clear();
        Ok(())
    }
}
