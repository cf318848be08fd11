//! Credit ledger: identity resolution + per-account atomic operations
//!
//! Accounts are keyed by normalized email or phone. At least one identifier
//! is required; neither is unique across both fields by design (two
//! accounts may share a phone if they registered under different emails).
//!
//! Identity resolution is ONE contract used by every path - debit, credit,
//! and refund alike: lowercased email match first, else phone. The original
//! system resolved refunds through differently-named fields and could miss
//! the account that was debited; that divergence is treated as a bug here.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::core_types::RequestId;
use crate::error::EngineError;

use super::account::{CreditAccount, CreditEntry, CreditKind};

/// Client identity as supplied by the caller. Email takes precedence when
/// both are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditIdentity {
    email: Option<String>,
    phone: Option<String>,
}

impl CreditIdentity {
    /// Build a normalized identity: email lowercased, both trimmed, empty
    /// strings dropped.
    ///
    /// # Errors
    /// - `MissingIdentity` when neither identifier survives normalization
    pub fn new(email: Option<&str>, phone: Option<&str>) -> Result<Self, EngineError> {
        let email = email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());
        let phone = phone.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());

        if email.is_none() && phone.is_none() {
            return Err(EngineError::MissingIdentity);
        }
        Ok(Self { email, phone })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }
}

type AccountKey = u64;

/// Thread-safe credit ledger
///
/// Per-identity atomicity: every operation resolves the account, then
/// mutates it under that account's mutex as one read-check-write unit.
/// Different identities never contend.
pub struct CreditLedger {
    accounts: DashMap<AccountKey, Arc<Mutex<CreditAccount>>>,
    email_index: DashMap<String, AccountKey>,
    phone_index: DashMap<String, AccountKey>,
    next_key: AtomicU64,
    /// Serializes account creation so one identity never gets two accounts
    create_lock: Mutex<()>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            email_index: DashMap::new(),
            phone_index: DashMap::new(),
            next_key: AtomicU64::new(1),
            create_lock: Mutex::new(()),
        }
    }

    /// Current balance; lazily creates a zero account for an unknown
    /// identity. The lookup itself appends no history.
    pub fn balance(&self, identity: &CreditIdentity) -> Decimal {
        let account = self.resolve_or_create(identity);
        let guard = account.lock();
        guard.balance()
    }

    /// Movement history snapshot, oldest first
    pub fn history(&self, identity: &CreditIdentity) -> Vec<CreditEntry> {
        let account = self.resolve_or_create(identity);
        let guard = account.lock();
        guard.history().to_vec()
    }

    /// Add credits; returns the new balance.
    pub fn credit(
        &self,
        identity: &CreditIdentity,
        amount: Decimal,
        kind: CreditKind,
        reason: &str,
        related_request: Option<RequestId>,
    ) -> Result<Decimal, EngineError> {
        let account = self.resolve_or_create(identity);
        let mut guard = account.lock();
        let balance = guard.credit(amount, kind, reason, related_request)?;
        tracing::info!(
            email = ?identity.email(),
            kind = kind.as_str(),
            %amount,
            %balance,
            "Credits added"
        );
        Ok(balance)
    }

    /// Remove credits; fails closed on insufficient balance and never
    /// leaves a partial entry.
    pub fn debit(
        &self,
        identity: &CreditIdentity,
        amount: Decimal,
        reason: &str,
        related_request: Option<RequestId>,
    ) -> Result<Decimal, EngineError> {
        let account = self.resolve_or_create(identity);
        let mut guard = account.lock();
        let balance = guard.debit(amount, reason, related_request)?;
        tracing::info!(
            email = ?identity.email(),
            %amount,
            %balance,
            "Credits deducted"
        );
        Ok(balance)
    }

    /// Find the account for an identity: email index first, else phone.
    /// Creates a zero-balance account registered under whichever
    /// identifiers were supplied when none exists.
    fn resolve_or_create(&self, identity: &CreditIdentity) -> Arc<Mutex<CreditAccount>> {
        if let Some(key) = self.lookup(identity)
            && let Some(account) = self.accounts.get(&key)
        {
            return account.clone();
        }

        let _creating = self.create_lock.lock();
        // Re-check under the lock: another caller may have just created it
        if let Some(key) = self.lookup(identity)
            && let Some(account) = self.accounts.get(&key)
        {
            return account.clone();
        }

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let account = Arc::new(Mutex::new(CreditAccount::new(
            identity.email().map(str::to_string),
            identity.phone().map(str::to_string),
        )));
        self.accounts.insert(key, account.clone());
        // First registration wins each index slot; identifiers are
        // non-unique across accounts by design
        if let Some(email) = identity.email() {
            self.email_index.entry(email.to_string()).or_insert(key);
        }
        if let Some(phone) = identity.phone() {
            self.phone_index.entry(phone.to_string()).or_insert(key);
        }
        tracing::debug!(email = ?identity.email(), phone = ?identity.phone(), "Credit account created");
        account
    }

    /// A supplied email is THE matching key; the phone index is consulted
    /// only when no email was supplied.
    fn lookup(&self, identity: &CreditIdentity) -> Option<AccountKey> {
        if let Some(email) = identity.email() {
            return self.email_index.get(email).map(|k| *k);
        }
        identity
            .phone()
            .and_then(|phone| self.phone_index.get(phone).map(|k| *k))
    }
}

impl Default for CreditLedger {
    fn default() -> Self {
        Self::new()
    }
}
