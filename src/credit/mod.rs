//! Prepaid credit ledger
//!
//! One credit entitles a client to select one driver without a new direct
//! payment. The ledger is the single source of truth for balances; all
//! mutations go through [`CreditLedger`] and are atomic per identity.

pub mod account;
pub mod ledger;

pub use account::{CreditAccount, CreditEntry, CreditKind};
pub use ledger::{CreditIdentity, CreditLedger};
