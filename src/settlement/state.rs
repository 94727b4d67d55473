//! Transaction status and settlement stages.
//!
//! Status words match the `transactions.status` column.

use std::fmt;

/// Persisted lifecycle of a transaction record.
///
/// Terminal states: SUCCESSFUL, FAILED. Both are fixed points: once a record
/// reaches one of them no later event may change it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Accepted by intake, not yet settled
    Pending,

    /// Terminal: balances moved and committed
    Successful,

    /// Terminal: settlement refused or aborted, with the reason
    Failed(String),
}

impl TransactionStatus {
    pub const PENDING: &'static str = "pending";
    pub const SUCCESSFUL: &'static str = "successful";
    pub const FAILED: &'static str = "failed";

    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Monotonic transition rule: `pending ⊏ successful`, `pending ⊏ failed`.
    ///
    /// Only a pending record may move, and only to a terminal state.
    #[inline]
    pub fn can_advance_to(&self, next: &TransactionStatus) -> bool {
        !self.is_terminal() && next.is_terminal()
    }

    /// Status word stored in the `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => Self::PENDING,
            TransactionStatus::Successful => Self::SUCCESSFUL,
            TransactionStatus::Failed(_) => Self::FAILED,
        }
    }

    /// Failure reason, stored separately in `error_message`
    pub fn error_message(&self) -> Option<&str> {
        match self {
            TransactionStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Rebuild a status from its column pair. Status words are matched
    /// case-insensitively; unknown words yield `None`.
    pub fn from_parts(word: &str, error_message: Option<&str>) -> Option<Self> {
        match word.trim().to_ascii_lowercase().as_str() {
            Self::PENDING => Some(TransactionStatus::Pending),
            Self::SUCCESSFUL => Some(TransactionStatus::Successful),
            Self::FAILED => Some(TransactionStatus::Failed(
                error_message.unwrap_or("unspecified").to_string(),
            )),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Settlement stages walked by the worker for one transfer.
///
/// ```text
/// RECEIVED → VALIDATING → DEBITING → CREDITING → COMMITTED
///                 ↓           ↓          ↓
///                         ROLLED_BACK
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStage {
    Received,
    Validating,
    Debiting,
    Crediting,
    Committed,
    RolledBack,
}

impl SettlementStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStage::Received => "RECEIVED",
            SettlementStage::Validating => "VALIDATING",
            SettlementStage::Debiting => "DEBITING",
            SettlementStage::Crediting => "CREDITING",
            SettlementStage::Committed => "COMMITTED",
            SettlementStage::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for SettlementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
