//! Provider-side wallet saga coordination
//!
//! Withdrawal is a two-phase handshake over the shared log: the provider
//! service appends the withdrawal fact with `validated: None`, then polls
//! the entry's saga flags until the trading ledger rules. On `true` it
//! waits for full integration of that version (so any forced cancellations
//! are visible), performs the on-chain transfer, and reports `executed`.
//! On `false` or timeout it appends a revoke that restores the reserved
//! funds.
//!
//! Consolidation follows the same two-phase shape, gated on its paired
//! withdrawal's outcome, and re-enters idempotently: when the on-chain
//! balances already sit at the expected post-transfer values the transfer
//! already happened and is not repeated.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use common::{AccountId, Symbol, UserId};
use event_log::{
    EventEntry, EventLog, EventPayload, SagaFlags, WalletConsolidation, WalletGenerate,
    WalletRevoke, WalletWithdrawal,
};
use projections::Projections;

use crate::error::WalletError;
use crate::provider::ProviderRegistry;

/// Default cap on persist retries before escalating
pub const DEFAULT_PERSIST_ATTEMPTS: u32 = 16;
/// Default interval between saga-flag polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default number of polls before a validation wait times out (~60s)
pub const DEFAULT_VALIDATION_POLLS: u32 = 60;

/// Coordinates generate/withdraw/consolidate sagas against the shared log
pub struct WalletSagaCoordinator {
    log: Arc<EventLog>,
    projections: Projections,
    registry: Arc<ProviderRegistry>,
    max_attempts: u32,
    poll_interval: Duration,
    validation_polls: u32,
}

impl WalletSagaCoordinator {
    /// Create a coordinator
    pub fn new(
        log: Arc<EventLog>,
        projections: Projections,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            log,
            projections,
            registry,
            max_attempts: DEFAULT_PERSIST_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            validation_polls: DEFAULT_VALIDATION_POLLS,
        }
    }

    /// Override the poll cadence (tests mostly)
    pub fn with_polling(mut self, interval: Duration, polls: u32) -> Self {
        self.poll_interval = interval;
        self.validation_polls = polls.max(1);
        self
    }

    /// Generate a deposit wallet for a coin and record it in the log
    ///
    /// Returns the derived public key once the generation event has been
    /// integrated locally.
    pub async fn generate_wallet(
        &self,
        user: UserId,
        account_id: AccountId,
        coin: Symbol,
    ) -> Result<String, WalletError> {
        let provider = self.registry.get(&coin)?;
        let seed = provider.generate_hd_wallet().await?;
        let public_key = provider.get_public_key_from_hd_wallet(&seed).await?;

        let key = public_key.clone();
        let coin_for_event = coin.clone();
        let (version, _) = self
            .persist_one(&|_| {
                EventPayload::WalletGenerate(WalletGenerate {
                    user,
                    account_id,
                    coin_symbol: coin_for_event.clone(),
                    public_key: key.clone(),
                    new_balance: self.projections.accounts.balance(user, account_id, &coin_for_event),
                    saga: SagaFlags::default(),
                })
            })
            .await?;
        self.log.version_control().wait_for_integration(version).await;
        info!(version, %coin, "wallet generated");
        Ok(public_key)
    }

    /// Run a withdrawal saga to completion
    ///
    /// Returns the version the withdrawal committed at. Validation failure
    /// and timeout surface as [`WalletError::Rejected`] after the revoke
    /// has restored the funds.
    pub async fn withdraw(
        &self,
        user: UserId,
        account_id: AccountId,
        coin: Symbol,
        target_public_key: String,
        qty: Decimal,
    ) -> Result<i64, WalletError> {
        if qty <= Decimal::ZERO {
            return Err(WalletError::rejected("withdrawal quantity must be positive"));
        }
        let provider = self.registry.get(&coin)?;
        let fee = provider.fee().await?;
        let source_public_key = self
            .projections
            .accounts
            .wallet(user, account_id, &coin)
            .and_then(|w| w.public_key)
            .ok_or_else(|| WalletError::rejected("no wallet generated for this coin"))?;

        let amount = qty + fee;
        let coin_for_event = coin.clone();
        let source = source_public_key.clone();
        let target = target_public_key.clone();
        let (version, event_id) = self
            .persist_one(&|_| {
                EventPayload::WalletWithdrawal(WalletWithdrawal {
                    user,
                    account_id,
                    coin_symbol: coin_for_event.clone(),
                    withdrawal_source_public_key: source.clone(),
                    withdrawal_target_public_key: target.clone(),
                    qty,
                    fee,
                    new_balance: self
                        .projections
                        .accounts
                        .balance(user, account_id, &coin_for_event)
                        - amount,
                    saga: SagaFlags::default(),
                })
            })
            .await?;
        info!(version, %coin, %qty, "withdrawal appended, awaiting ledger validation");

        match self.poll_validated(event_id).await? {
            Some(true) => {
                // Forced cancellations, if any, were appended before the
                // flag flipped; integrating this version makes them visible.
                self.log.version_control().wait_for_integration(version).await;
                match provider
                    .withdraw(&source_public_key, &target_public_key, qty)
                    .await
                {
                    Ok(()) => {
                        self.set_flags(event_id, |mut f| {
                            f.executed = true;
                            f.valid = Some(true);
                            f
                        })
                        .await?;
                        info!(version, %coin, "withdrawal executed on chain");
                        Ok(version)
                    }
                    Err(e) => {
                        warn!(version, error = %e, "on-chain transfer failed, revoking");
                        self.revoke(user, account_id, &coin, version, amount, event_id)
                            .await?;
                        Err(e.into())
                    }
                }
            }
            Some(false) => {
                self.revoke(user, account_id, &coin, version, amount, event_id)
                    .await?;
                Err(WalletError::rejected("withdrawal rejected by ledger"))
            }
            None => {
                self.revoke(user, account_id, &coin, version, amount, event_id)
                    .await?;
                Err(WalletError::rejected("withdrawal validation timed out"))
            }
        }
    }

    /// Run a consolidation transfer between exchange-owned keys
    pub async fn consolidate(
        &self,
        user: UserId,
        account_id: AccountId,
        coin: Symbol,
        source_public_key: String,
        target_public_key: String,
        qty: Decimal,
        withdrawal_on_version: Option<i64>,
    ) -> Result<i64, WalletError> {
        if qty <= Decimal::ZERO {
            return Err(WalletError::rejected("transfer quantity must be positive"));
        }
        let provider = self.registry.get(&coin)?;
        let source_balance = provider.get_balance(&source_public_key).await?;
        let target_balance = provider.get_balance(&target_public_key).await?;

        let coin_for_event = coin.clone();
        let source = source_public_key.clone();
        let target = target_public_key.clone();
        let (version, event_id) = self
            .persist_one(&|_| {
                EventPayload::WalletConsolidation(WalletConsolidation {
                    user,
                    account_id,
                    coin_symbol: coin_for_event.clone(),
                    source_public_key: source.clone(),
                    target_public_key: target.clone(),
                    transfer_qty: qty,
                    expected_source_balance: source_balance - qty,
                    expected_target_balance: target_balance + qty,
                    withdrawal_on_version,
                    saga: SagaFlags::default(),
                })
            })
            .await?;

        self.execute_consolidation(version).await?;
        Ok(version)
    }

    /// Execute (or re-enter) a consolidation already in the log
    ///
    /// Safe to call again after a crash: an already-performed transfer is
    /// detected from the on-chain balances and not repeated.
    pub async fn execute_consolidation(&self, version: i64) -> Result<(), WalletError> {
        let entries = self.log.store().entries_at(version).await?;
        let (entry_id, ev) = entries
            .iter()
            .find_map(|e| match &e.payload {
                EventPayload::WalletConsolidation(ev) => Some((e.id, ev.clone())),
                _ => None,
            })
            .ok_or_else(|| {
                WalletError::rejected(format!("no consolidation at version {version}"))
            })?;
        let provider = self.registry.get(&ev.coin_symbol)?;

        // Gate on the paired withdrawal's own outcome.
        if let Some(withdrawal_version) = ev.withdrawal_on_version {
            match self.poll_withdrawal_valid(withdrawal_version).await? {
                Some(true) => {}
                outcome => {
                    self.set_flags(entry_id, |mut f| {
                        f.validated = Some(false);
                        f.valid = Some(false);
                        f
                    })
                    .await?;
                    let reason = match outcome {
                        Some(false) => "paired withdrawal is invalid",
                        _ => "paired withdrawal never validated",
                    };
                    return Err(WalletError::rejected(reason));
                }
            }
        }

        // Idempotent re-entry: balances already at the expected values mean
        // the transfer happened before a crash or retry.
        let source_now = provider.get_balance(&ev.source_public_key).await?;
        let target_now = provider.get_balance(&ev.target_public_key).await?;
        if source_now == ev.expected_source_balance && target_now == ev.expected_target_balance {
            info!(version, "consolidation already executed, marking only");
        } else {
            provider
                .withdraw(&ev.source_public_key, &ev.target_public_key, ev.transfer_qty)
                .await?;
        }
        self.set_flags(entry_id, |mut f| {
            f.validated = Some(true);
            f.executed = true;
            f.valid = Some(true);
            f
        })
        .await?;
        info!(version, coin = %ev.coin_symbol, "consolidation executed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn revoke(
        &self,
        user: UserId,
        account_id: AccountId,
        coin: &Symbol,
        withdrawal_version: i64,
        amount: Decimal,
        withdrawal_event_id: Uuid,
    ) -> Result<(), WalletError> {
        let coin_for_event = coin.clone();
        let (version, _) = self
            .persist_one(&|_| {
                EventPayload::WalletRevoke(WalletRevoke {
                    user,
                    account_id,
                    coin_symbol: coin_for_event.clone(),
                    revoked_version: withdrawal_version,
                    new_balance: self
                        .projections
                        .accounts
                        .balance(user, account_id, &coin_for_event)
                        + amount,
                    saga: SagaFlags::default(),
                })
            })
            .await?;
        self.set_flags(withdrawal_event_id, |mut f| {
            f.valid = Some(false);
            f
        })
        .await?;
        info!(version, revoked = withdrawal_version, "withdrawal revoked");
        Ok(())
    }

    /// Persist a single-event transaction through the bounded retry loop
    async fn persist_one(
        &self,
        build: &(dyn Fn(i64) -> EventPayload + Sync),
    ) -> Result<(i64, Uuid), WalletError> {
        persist_single(&self.log, self.max_attempts, build).await
    }

    /// Poll a withdrawal's `validated` flag; `None` on timeout
    async fn poll_validated(&self, event_id: Uuid) -> Result<Option<bool>, WalletError> {
        for _ in 0..self.validation_polls {
            if let Some(entry) = self.log.store().find(event_id).await? {
                if let Some(flags) = entry.saga_flags() {
                    if let Some(verdict) = flags.validated {
                        return Ok(Some(verdict));
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(None)
    }

    /// Poll a withdrawal's `valid` outcome by version; `None` on timeout
    async fn poll_withdrawal_valid(&self, version: i64) -> Result<Option<bool>, WalletError> {
        for _ in 0..self.validation_polls {
            let entries = self.log.store().entries_at(version).await?;
            let withdrawal = entries
                .iter()
                .find(|e| matches!(e.payload, EventPayload::WalletWithdrawal(_)));
            if let Some(entry) = withdrawal {
                if let Some(flags) = entry.saga_flags() {
                    if let Some(outcome) = flags.valid {
                        return Ok(Some(outcome));
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(None)
    }

    /// Read-modify-write an entry's saga flags
    async fn set_flags(
        &self,
        event_id: Uuid,
        f: impl FnOnce(SagaFlags) -> SagaFlags,
    ) -> Result<(), WalletError> {
        update_flags(&self.log, event_id, f).await
    }
}

/// Persist one wallet event as its own transaction, bounded retries
pub(crate) async fn persist_single(
    log: &Arc<EventLog>,
    max_attempts: u32,
    build: &(dyn Fn(i64) -> EventPayload + Sync),
) -> Result<(i64, Uuid), WalletError> {
    for _attempt in 1..=max_attempts {
        let outcome = log
            .version_control()
            .execute_using_fixed_version(|current| async move {
                let version = current + 1;
                let entry = EventEntry::new(version, build(version));
                let id = entry.id;
                let committed = log.persist(vec![entry], Some(current)).await?;
                Ok::<_, WalletError>(committed.map(|_| (version, id)))
            })
            .await?;
        if let Some(result) = outcome {
            return Ok(result);
        }
    }
    Err(WalletError::RetriesExhausted(max_attempts))
}

/// Read-modify-write the saga flags of a stored wallet event
pub(crate) async fn update_flags(
    log: &Arc<EventLog>,
    event_id: Uuid,
    f: impl FnOnce(SagaFlags) -> SagaFlags,
) -> Result<(), WalletError> {
    let entry = log
        .store()
        .find(event_id)
        .await?
        .ok_or(event_log::StoreError::EntryNotFound(event_id))?;
    let current = entry.saga_flags().copied().unwrap_or_default();
    log.store().update_saga_flags(event_id, f(current)).await?;
    Ok(())
}
