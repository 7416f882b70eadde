//! Consumable AI-call balance per scope.
//!
//! Every check-and-decrement is a single conditional write in the backing
//! repository, so `has_credits` and `consume` never disagree under
//! concurrent callers and the balance can never go negative.

use crate::error::{AutopilotError, Result};
use crate::store::CreditRepository;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditScope {
    Global,
    Actor(String),
}

impl CreditScope {
    pub fn actor(id: impl Into<String>) -> Self {
        Self::Actor(id.into())
    }

    /// Storage and rate-limit key for this scope.
    pub fn key(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Actor(id) => format!("actor:{id}"),
        }
    }
}

impl fmt::Display for CreditScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for CreditScope {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("global") {
            return Ok(Self::Global);
        }
        match s.strip_prefix("actor:").map(str::trim) {
            Some(id) if !id.is_empty() => Ok(Self::Actor(id.to_string())),
            _ => Err(AutopilotError::NotFound(format!(
                "credit scope {s:?}; expected \"global\" or \"actor:<id>\""
            ))),
        }
    }
}

#[derive(Clone)]
pub struct CreditLedger {
    repo: Arc<dyn CreditRepository>,
}

impl CreditLedger {
    pub fn new(repo: Arc<dyn CreditRepository>) -> Self {
        Self { repo }
    }

    pub fn balance(&self, scope: &CreditScope) -> Result<i64> {
        self.repo.balance(&scope.key())
    }

    /// True iff the scope holds at least `amount`. Side-effect free.
    pub fn has_credits(&self, amount: i64, scope: &CreditScope) -> Result<bool> {
        if amount <= 0 {
            return Ok(true);
        }
        Ok(self.balance(scope)? >= amount)
    }

    /// Atomically decrement by `amount`; `false` means insufficient balance
    /// and nothing was changed.
    pub fn consume(&self, amount: i64, scope: &CreditScope) -> Result<bool> {
        if amount <= 0 {
            return Ok(true);
        }
        let consumed = self.repo.try_consume(&scope.key(), amount)?;
        if consumed {
            tracing::debug!(scope = %scope, amount, "credits consumed");
        } else {
            tracing::info!(scope = %scope, amount, "credit admission denied");
        }
        Ok(consumed)
    }

    /// Increment the balance. Used for grants and for refunds after a
    /// provider failure. Non-positive amounts are ignored.
    pub fn add(&self, amount: i64, scope: &CreditScope) -> Result<()> {
        if amount <= 0 {
            return Ok(());
        }
        let balance = self.repo.credit(&scope.key(), amount)?;
        tracing::debug!(scope = %scope, amount, balance, "credits added");
        Ok(())
    }

    /// Grant `amount` the first time a scope is seen; later calls are no-ops.
    pub fn ensure_grant(&self, amount: i64, scope: &CreditScope) -> Result<bool> {
        let seeded = self.repo.seed(&scope.key(), amount.max(0))?;
        if seeded {
            tracing::info!(scope = %scope, amount, "initial credit grant");
        }
        Ok(seeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn ledger() -> CreditLedger {
        let store = SqliteStore::open_in_memory().expect("open store");
        CreditLedger::new(Arc::new(store))
    }

    #[test]
    fn consume_never_goes_negative() {
        let ledger = ledger();
        let scope = CreditScope::Global;
        ledger.add(2, &scope).expect("add");
        assert!(ledger.consume(1, &scope).expect("first"));
        assert!(ledger.consume(1, &scope).expect("second"));
        assert!(!ledger.consume(1, &scope).expect("third is denied"));
        assert_eq!(ledger.balance(&scope).expect("balance"), 0);
        assert!(!ledger.has_credits(1, &scope).expect("has_credits"));
    }

    #[test]
    fn insufficient_consume_leaves_balance_untouched() {
        let ledger = ledger();
        let scope = CreditScope::actor("editor-7");
        ledger.add(3, &scope).expect("add");
        assert!(!ledger.consume(5, &scope).expect("consume"));
        assert_eq!(ledger.balance(&scope).expect("balance"), 3);
    }

    #[test]
    fn non_positive_add_is_a_no_op() {
        let ledger = ledger();
        let scope = CreditScope::Global;
        ledger.add(0, &scope).expect("add zero");
        ledger.add(-5, &scope).expect("add negative");
        assert_eq!(ledger.balance(&scope).expect("balance"), 0);
    }

    #[test]
    fn scopes_are_independent() {
        let ledger = ledger();
        ledger.add(1, &CreditScope::Global).expect("add");
        assert!(!ledger
            .consume(1, &CreditScope::actor("a"))
            .expect("actor has nothing"));
        assert!(ledger.consume(1, &CreditScope::Global).expect("global"));
    }

    #[test]
    fn ensure_grant_only_seeds_once() {
        let ledger = ledger();
        let scope = CreditScope::Global;
        assert!(ledger.ensure_grant(10, &scope).expect("seed"));
        assert!(ledger.consume(4, &scope).expect("consume"));
        assert!(!ledger.ensure_grant(10, &scope).expect("second seed"));
        assert_eq!(ledger.balance(&scope).expect("balance"), 6);
    }

    #[test]
    fn concurrent_consumers_spend_exactly_the_balance() {
        let ledger = ledger();
        let scope = CreditScope::Global;
        ledger.add(50, &scope).expect("add");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let scope = scope.clone();
                std::thread::spawn(move || {
                    let mut won = 0;
                    for _ in 0..20 {
                        if ledger.consume(1, &scope).expect("consume") {
                            won += 1;
                        }
                    }
                    won
                })
            })
            .collect();
        let total: i64 = handles
            .into_iter()
            .map(|h| h.join().expect("join consumer"))
            .sum();

        assert_eq!(total, 50);
        assert_eq!(ledger.balance(&scope).expect("balance"), 0);
    }

    #[test]
    fn scope_keys_round_trip_through_from_str() {
        assert_eq!("global".parse::<CreditScope>().ok(), Some(CreditScope::Global));
        assert_eq!(
            "actor:bob".parse::<CreditScope>().ok(),
            Some(CreditScope::actor("bob"))
        );
        assert!("actor:".parse::<CreditScope>().is_err());
    }
}
