//! ENFORCED CREDIT ACCOUNT - owned by the CreditLedger
//!
//! The single source of truth for one identity's prepaid balance.
//! ALL balance mutations MUST go through these methods.
//!
//! # Enforcement Strategy:
//! 1. Balance field is PRIVATE - no direct access
//! 2. All mutations return Result - errors are explicit
//! 3. Every successful mutation appends exactly one history entry
//! 4. Balance can never go negative (debit fails closed)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::RequestId;
use crate::error::EngineError;

/// Kind of ledger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditKind {
    Credit,
    Debit,
    Refund,
}

impl CreditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditKind::Credit => "credit",
            CreditKind::Debit => "debit",
            CreditKind::Refund => "refund",
        }
    }
}

/// One append-only history entry. `amount` is signed: negative for debits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditEntry {
    pub amount: Decimal,
    pub kind: CreditKind,
    pub reason: String,
    pub related_request: Option<RequestId>,
    pub at: DateTime<Utc>,
}

/// Credit account for a single identity
///
/// # Invariants (ENFORCED by the private field):
/// - balance >= 0 at all times
/// - history is append-only; every mutation appends one entry
/// - a failed debit appends nothing and changes nothing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAccount {
    email: Option<String>,
    phone: Option<String>,
    balance: Decimal,
    history: Vec<CreditEntry>,
    updated_at: DateTime<Utc>,
}

impl CreditAccount {
    /// Create a zero-balance account for the supplied identifiers.
    ///
    /// Accounts are created lazily on first lookup/mutation and never
    /// deleted. At least one identifier must be present (checked by the
    /// ledger before construction).
    pub fn new(email: Option<String>, phone: Option<String>) -> Self {
        Self {
            email,
            phone,
            balance: Decimal::ZERO,
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Current balance (read-only)
    #[inline]
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// Append-only movement history (read-only)
    #[inline]
    pub fn history(&self) -> &[CreditEntry] {
        &self.history
    }

    #[inline]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[inline]
    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    /// Add credits to the account
    ///
    /// # Errors
    /// - `NonPositiveAmount` if `amount <= 0`
    ///
    /// # Effects
    /// - Increases balance by `amount`
    /// - Appends one positive history entry of the given kind
    pub fn credit(
        &mut self,
        amount: Decimal,
        kind: CreditKind,
        reason: &str,
        related_request: Option<RequestId>,
    ) -> Result<Decimal, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::NonPositiveAmount);
        }
        self.balance += amount;
        self.push_entry(amount, kind, reason, related_request);
        Ok(self.balance)
    }

    /// Remove credits from the account
    ///
    /// # Errors
    /// - `NonPositiveAmount` if `amount <= 0`
    /// - `InsufficientFunds` if `balance < amount`; balance and history
    ///   are untouched
    ///
    /// # Effects
    /// - Decreases balance by `amount`
    /// - Appends one negative history entry
    pub fn debit(
        &mut self,
        amount: Decimal,
        reason: &str,
        related_request: Option<RequestId>,
    ) -> Result<Decimal, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::NonPositiveAmount);
        }
        if self.balance < amount {
            return Err(EngineError::InsufficientFunds);
        }
        self.balance -= amount;
        self.push_entry(-amount, CreditKind::Debit, reason, related_request);
        Ok(self.balance)
    }

    fn push_entry(
        &mut self,
        amount: Decimal,
        kind: CreditKind,
        reason: &str,
        related_request: Option<RequestId>,
    ) {
        let now = Utc::now();
        self.history.push(CreditEntry {
            amount,
            kind,
            reason: reason.to_string(),
            related_request,
            at: now,
        });
        self.updated_at = now;
    }
}
