//! In-memory ledger store.
//!
//! Committed state lives in plain maps. Each account and each transaction id
//! has its own async mutex acting as the row lock; a [`LedgerTx`] holds the
//! owned guards and stages its writes until commit, which publishes balances
//! and records together.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use super::{LedgerStore, LedgerTx, StoreError, UpsertOutcome, resolve_upsert};
use crate::settlement::state::TransactionStatus;
use crate::settlement::types::{
    Account, AccountId, TransactionId, TransactionRecord, TransferRequest,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lazily created row locks keyed by primary key
struct RowLocks<K> {
    locks: Mutex<HashMap<K, Arc<RowLock<()>>>>,
}

impl<K: Eq + Hash + Clone> RowLocks<K> {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = guard(&self.locks)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the locks for `keys` that nobody holds or waits on
    fn prune(&self, keys: impl IntoIterator<Item = K>) {
        let mut locks = guard(&self.locks);
        for key in keys {
            if locks
                .get(&key)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&key);
            }
        }
    }

    fn len(&self) -> usize {
        guard(&self.locks).len()
    }
}

struct LedgerState {
    balances: Mutex<HashMap<AccountId, Decimal>>,
    records: Mutex<HashMap<TransactionId, TransactionRecord>>,
    account_locks: RowLocks<AccountId>,
    record_locks: RowLocks<TransactionId>,
    available: AtomicBool,
    fail_account_locks: AtomicBool,
}

impl LedgerState {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory ledger is offline".to_string()))
        }
    }
}

/// In-memory [`LedgerStore`]
#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<LedgerState>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(LedgerState {
                balances: Mutex::new(HashMap::new()),
                records: Mutex::new(HashMap::new()),
                account_locks: RowLocks::new(),
                record_locks: RowLocks::new(),
                available: AtomicBool::new(true),
                fail_account_locks: AtomicBool::new(false),
            }),
        }
    }

    /// Create a ledger pre-populated with accounts
    pub fn with_accounts(accounts: impl IntoIterator<Item = (AccountId, Decimal)>) -> Self {
        let ledger = Self::new();
        for (id, balance) in accounts {
            ledger.open_account(id, balance);
        }
        ledger
    }

    /// Create or reset an account balance
    pub fn open_account(&self, id: AccountId, balance: Decimal) {
        guard(&self.state.balances).insert(id, balance);
    }

    /// Committed balance of an account
    pub fn balance(&self, id: AccountId) -> Option<Decimal> {
        guard(&self.state.balances).get(&id).copied()
    }

    /// Sum of all committed balances
    pub fn total_balance(&self) -> Decimal {
        guard(&self.state.balances).values().copied().sum()
    }

    pub fn record_count(&self) -> usize {
        guard(&self.state.records).len()
    }

    /// Simulate losing (or regaining) the store connection
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Row locks currently tracked, accounts plus records
    pub fn row_lock_count(&self) -> usize {
        self.state.account_locks.len() + self.state.record_locks.len()
    }

    /// Make every account lock attempt fail with a database error
    pub fn fail_account_locks(&self, fail: bool) {
        self.state.fail_account_locks.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        self.state.check_available()?;
        Ok(Box::new(InMemoryTx::new(self.state.clone())))
    }

    async fn upsert_record(&self, record: &TransactionRecord) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.begin().await?;
        let outcome = tx.upsert_record(record).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn record(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, StoreError> {
        self.state.check_available()?;
        Ok(guard(&self.state.records).get(id).cloned())
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.state.check_available()?;
        Ok(guard(&self.state.balances)
            .get(&id)
            .map(|balance| Account { id, balance: *balance }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state.check_available()
    }
}

struct InMemoryTx {
    state: Arc<LedgerState>,
    record_guards: HashMap<TransactionId, OwnedMutexGuard<()>>,
    account_guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    staged_balances: HashMap<AccountId, Decimal>,
    staged_records: HashMap<TransactionId, TransactionRecord>,
    finished: bool,
}

impl InMemoryTx {
    fn new(state: Arc<LedgerState>) -> Self {
        Self {
            state,
            record_guards: HashMap::new(),
            account_guards: HashMap::new(),
            staged_balances: HashMap::new(),
            staged_records: HashMap::new(),
            finished: false,
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionClosed);
        }
        self.state.check_available()
    }

    async fn lock_record(&mut self, id: &TransactionId) {
        if !self.record_guards.contains_key(id) {
            let row = self.state.record_locks.acquire(id).await;
            self.record_guards.insert(id.clone(), row);
        }
    }

    fn current_record(&self, id: &TransactionId) -> Option<TransactionRecord> {
        self.staged_records
            .get(id)
            .cloned()
            .or_else(|| guard(&self.state.records).get(id).cloned())
    }

    fn current_balance(&self, id: AccountId) -> Option<Decimal> {
        self.staged_balances
            .get(&id)
            .copied()
            .or_else(|| guard(&self.state.balances).get(&id).copied())
    }

    fn release(&mut self) {
        self.staged_balances.clear();
        self.staged_records.clear();
        // Guards drop as the keys are collected, before pruning
        let accounts: Vec<_> = self.account_guards.drain().map(|(id, _)| id).collect();
        let records: Vec<_> = self.record_guards.drain().map(|(id, _)| id).collect();
        self.state.account_locks.prune(accounts);
        self.state.record_locks.prune(records);
        self.finished = true;
    }
}

impl Drop for InMemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.release();
        }
    }
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn claim_record(&mut self, req: &TransferRequest) -> Result<TransactionRecord, StoreError> {
        self.check_open()?;
        self.lock_record(&req.transaction_id).await;

        match self.current_record(&req.transaction_id) {
            Some(existing) => Ok(existing),
            None => {
                let pending = TransactionRecord::from_request(req, TransactionStatus::Pending);
                self.staged_records
                    .insert(req.transaction_id.clone(), pending.clone());
                Ok(pending)
            }
        }
    }

    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        self.check_open()?;
        if self.state.fail_account_locks.load(Ordering::SeqCst) {
            return Err(StoreError::Database(
                "could not obtain lock on row in relation \"clients\"".to_string(),
            ));
        }

        let mut ordered = ids.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut accounts = Vec::with_capacity(ordered.len());
        for id in ordered {
            if self.current_balance(id).is_none() {
                continue;
            }
            if !self.account_guards.contains_key(&id) {
                let row = self.state.account_locks.acquire(&id).await;
                self.account_guards.insert(id, row);
            }
            // Re-read after the lock: another transaction may have committed meanwhile
            if let Some(balance) = self.current_balance(id) {
                accounts.push(Account { id, balance });
            }
        }
        Ok(accounts)
    }

    async fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Decimal, StoreError> {
        self.check_open()?;
        if !self.account_guards.contains_key(&id) {
            return Err(StoreError::AccountNotLocked(id));
        }
        let current = self
            .current_balance(id)
            .ok_or(StoreError::AccountNotFound(id))?;
        let updated = current + delta;
        if updated < Decimal::ZERO {
            return Err(StoreError::NegativeBalance(id));
        }
        self.staged_balances.insert(id, updated);
        Ok(updated)
    }

    async fn upsert_record(&mut self, record: &TransactionRecord) -> Result<UpsertOutcome, StoreError> {
        self.check_open()?;
        self.lock_record(&record.transaction_id).await;

        let existing = self.current_record(&record.transaction_id);
        let outcome = resolve_upsert(existing.as_ref().map(|r| &r.status), &record.status);
        match (outcome, existing) {
            (UpsertOutcome::Inserted, _) => {
                self.staged_records
                    .insert(record.transaction_id.clone(), record.clone());
            }
            (UpsertOutcome::Promoted, Some(mut current)) => {
                current.status = record.status.clone();
                self.staged_records
                    .insert(record.transaction_id.clone(), current);
            }
            _ => {}
        }
        Ok(outcome)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        {
            // balances before records, everywhere both are held
            let mut balances = guard(&self.state.balances);
            let mut records = guard(&self.state.records);
            balances.extend(self.staged_balances.drain());
            records.extend(self.staged_records.drain());
        }
        self.release();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionClosed);
        }
        self.release();
        Ok(())
    }
}
