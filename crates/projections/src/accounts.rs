//! Account ledger projection
//!
//! Per-user, per-account, per-coin balance and reserved balance, derived
//! from replayed events. Accounts are created lazily on first wallet touch.
//!
//! Balance writes go through an optimistic compare-and-swap keyed on the
//! previously observed value, retried on conflict up to a bounded attempt
//! count. Reserved balance is earmarked by open orders and pending
//! withdrawals and is unavailable to new orders.

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::trace;

use common::{AccountId, Symbol, UserId};

use crate::error::ReplayError;

/// Default cap on balance CAS retries before escalating
pub const DEFAULT_CAS_ATTEMPTS: u32 = 64;

/// One coin's holdings inside an account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinWallet {
    pub coin_symbol: Symbol,
    /// Deposit address, set by wallet generation
    pub public_key: Option<String>,
    pub balance: Decimal,
    /// Earmarked by open orders and pending withdrawals
    pub reserved_balance: Decimal,
}

impl CoinWallet {
    /// Balance not earmarked by open orders
    pub fn available(&self) -> Decimal {
        self.balance - self.reserved_balance
    }
}

#[derive(Debug, Clone, Default)]
struct AccountEntry {
    wallets: HashMap<Symbol, CoinWallet>,
}

/// The account ledger: all balances this instance has integrated
pub struct AccountLedgerProjection {
    accounts: RwLock<HashMap<(UserId, AccountId), AccountEntry>>,
    cas_attempts: u32,
}

impl Default for AccountLedgerProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountLedgerProjection {
    /// Create an empty ledger with the default CAS retry cap
    pub fn new() -> Self {
        Self::with_cas_attempts(DEFAULT_CAS_ATTEMPTS)
    }

    /// Create an empty ledger with a custom CAS retry cap
    pub fn with_cas_attempts(cas_attempts: u32) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            cas_attempts: cas_attempts.max(1),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshot of one coin wallet; `None` if never touched
    pub fn wallet(&self, user: UserId, account: AccountId, coin: &Symbol) -> Option<CoinWallet> {
        let accounts = self.accounts.read();
        accounts
            .get(&(user, account))
            .and_then(|a| a.wallets.get(coin))
            .cloned()
    }

    /// Current balance, zero if the wallet was never touched
    pub fn balance(&self, user: UserId, account: AccountId, coin: &Symbol) -> Decimal {
        self.wallet(user, account, coin)
            .map(|w| w.balance)
            .unwrap_or_default()
    }

    /// Currently reserved balance
    pub fn reserved(&self, user: UserId, account: AccountId, coin: &Symbol) -> Decimal {
        self.wallet(user, account, coin)
            .map(|w| w.reserved_balance)
            .unwrap_or_default()
    }

    /// Balance minus reservations: what a new order may spend
    pub fn available(&self, user: UserId, account: AccountId, coin: &Symbol) -> Decimal {
        self.wallet(user, account, coin)
            .map(|w| w.available())
            .unwrap_or_default()
    }

    /// Every wallet in the ledger, with its owning user and account
    ///
    /// Used by the deposit watcher to enumerate the keys it polls.
    pub fn all_wallets(&self) -> Vec<(UserId, AccountId, CoinWallet)> {
        let accounts = self.accounts.read();
        let mut out: Vec<(UserId, AccountId, CoinWallet)> = accounts
            .iter()
            .flat_map(|((user, account), entry)| {
                entry
                    .wallets
                    .values()
                    .map(move |w| (*user, *account, w.clone()))
            })
            .collect();
        out.sort_by(|a, b| (a.0, a.1, &a.2.coin_symbol).cmp(&(b.0, b.1, &b.2.coin_symbol)));
        out
    }

    /// All wallets of one account
    pub fn wallets(&self, user: UserId, account: AccountId) -> Vec<CoinWallet> {
        let accounts = self.accounts.read();
        accounts
            .get(&(user, account))
            .map(|a| {
                let mut out: Vec<CoinWallet> = a.wallets.values().cloned().collect();
                out.sort_by(|a, b| a.coin_symbol.cmp(&b.coin_symbol));
                out
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Mutation (replay loop only)
    // ------------------------------------------------------------------

    /// Compare-and-swap the balance: succeeds only when the stored value
    /// still equals `expected`
    pub fn compare_and_set_balance(
        &self,
        user: UserId,
        account: AccountId,
        coin: &Symbol,
        expected: Decimal,
        new: Decimal,
    ) -> bool {
        let mut accounts = self.accounts.write();
        let wallet = Self::wallet_mut(&mut accounts, user, account, coin);
        if wallet.balance != expected {
            return false;
        }
        wallet.balance = new;
        true
    }

    /// Apply `f` to the balance through the CAS retry loop
    pub fn modify_balance(
        &self,
        user: UserId,
        account: AccountId,
        coin: &Symbol,
        f: impl Fn(Decimal) -> Decimal,
    ) -> Result<Decimal, ReplayError> {
        for attempt in 0..self.cas_attempts {
            let observed = self.balance(user, account, coin);
            let new = f(observed);
            if self.compare_and_set_balance(user, account, coin, observed, new) {
                if attempt > 0 {
                    trace!(attempt, %coin, "balance CAS succeeded after retry");
                }
                return Ok(new);
            }
        }
        Err(ReplayError::CasRetriesExhausted(format!(
            "{user}/{account}/{coin}"
        )))
    }

    /// Add to (positive) or release from (negative) the reservation
    pub fn adjust_reserved(&self, user: UserId, account: AccountId, coin: &Symbol, delta: Decimal) {
        let mut accounts = self.accounts.write();
        let wallet = Self::wallet_mut(&mut accounts, user, account, coin);
        wallet.reserved_balance += delta;
        if wallet.reserved_balance < Decimal::ZERO {
            // Releasing more than was held indicates sloppy bookkeeping
            // upstream; clamp rather than go negative.
            wallet.reserved_balance = Decimal::ZERO;
        }
    }

    /// Record the deposit address produced by wallet generation
    pub fn set_public_key(&self, user: UserId, account: AccountId, coin: &Symbol, key: String) {
        let mut accounts = self.accounts.write();
        let wallet = Self::wallet_mut(&mut accounts, user, account, coin);
        wallet.public_key = Some(key);
    }

    fn wallet_mut<'a>(
        accounts: &'a mut HashMap<(UserId, AccountId), AccountEntry>,
        user: UserId,
        account: AccountId,
        coin: &Symbol,
    ) -> &'a mut CoinWallet {
        let entry = accounts.entry((user, account)).or_default();
        entry
            .wallets
            .entry(coin.clone())
            .or_insert_with(|| CoinWallet {
                coin_symbol: coin.clone(),
                ..CoinWallet::default()
            })
    }
}

/// Working copy of balances for one transaction
///
/// Both the command planner and the replay loop route a transaction's
/// balance arithmetic through a sheet so the two sides compute identical
/// new-balance values, including when one account sits on both ends of a
/// match (the deltas collapse onto one key and cancel out).
pub struct BalanceSheet<'a> {
    ledger: &'a AccountLedgerProjection,
    values: HashMap<(UserId, AccountId, Symbol), Decimal>,
}

impl<'a> BalanceSheet<'a> {
    /// Start a sheet seeded lazily from the ledger
    pub fn new(ledger: &'a AccountLedgerProjection) -> Self {
        Self {
            ledger,
            values: HashMap::new(),
        }
    }

    /// Current working balance for a key
    pub fn get(&mut self, user: UserId, account: AccountId, coin: &Symbol) -> Decimal {
        let ledger = self.ledger;
        *self
            .values
            .entry((user, account, coin.clone()))
            .or_insert_with(|| ledger.balance(user, account, coin))
    }

    /// Apply a delta, returning the new working balance
    pub fn add(
        &mut self,
        user: UserId,
        account: AccountId,
        coin: &Symbol,
        delta: Decimal,
    ) -> Decimal {
        let current = self.get(user, account, coin);
        let new = current + delta;
        self.values.insert((user, account, coin.clone()), new);
        new
    }

    /// Write every touched balance back to the ledger through the CAS loop
    pub fn commit(self) -> Result<(), ReplayError> {
        for ((user, account, coin), value) in self.values {
            self.ledger
                .modify_balance(user, account, &coin, |_| value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_lazy_wallet_creation() {
        let ledger = AccountLedgerProjection::new();
        let (user, account) = (UserId::new(), AccountId::new());
        let btc = Symbol::new("BTC");

        assert!(ledger.wallet(user, account, &btc).is_none());
        assert_eq!(ledger.balance(user, account, &btc), dec!(0));

        ledger.modify_balance(user, account, &btc, |b| b + dec!(1.5)).unwrap();
        let wallet = ledger.wallet(user, account, &btc).unwrap();
        assert_eq!(wallet.balance, dec!(1.5));
        assert_eq!(wallet.available(), dec!(1.5));
    }

    #[test]
    fn test_cas_rejects_stale_expected() {
        let ledger = AccountLedgerProjection::new();
        let (user, account) = (UserId::new(), AccountId::new());
        let btc = Symbol::new("BTC");

        ledger.modify_balance(user, account, &btc, |_| dec!(10)).unwrap();
        assert!(!ledger.compare_and_set_balance(user, account, &btc, dec!(9), dec!(5)));
        assert!(ledger.compare_and_set_balance(user, account, &btc, dec!(10), dec!(5)));
        assert_eq!(ledger.balance(user, account, &btc), dec!(5));
    }

    #[test]
    fn test_reservation_reduces_available() {
        let ledger = AccountLedgerProjection::new();
        let (user, account) = (UserId::new(), AccountId::new());
        let btc = Symbol::new("BTC");

        ledger.modify_balance(user, account, &btc, |_| dec!(10)).unwrap();
        ledger.adjust_reserved(user, account, &btc, dec!(4));
        assert_eq!(ledger.available(user, account, &btc), dec!(6));

        ledger.adjust_reserved(user, account, &btc, dec!(-4));
        assert_eq!(ledger.available(user, account, &btc), dec!(10));
    }
}
