//! Per-coin deposit detection
//!
//! The watcher polls the chain balance of every generated deposit key and
//! credits the delta whenever a balance grows. The first observation of a
//! key only records a baseline: crediting happens for growth seen after
//! that, so a restart never double-credits deposits that were already
//! integrated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use event_log::{EventLog, EventPayload, SagaFlags, WalletDeposit};
use projections::Projections;

use crate::error::WalletError;
use crate::provider::ProviderRegistry;
use crate::saga::persist_single;

/// Default poll interval for chain balances
pub const DEFAULT_WATCH_TICK: Duration = Duration::from_secs(5);

/// Background loop crediting on-chain deposits into the ledger
pub struct DepositWatcher {
    log: Arc<EventLog>,
    projections: Projections,
    registry: Arc<ProviderRegistry>,
    tick: Duration,
    shutdown: CancellationToken,
    max_attempts: u32,
    /// Last observed chain balance per public key
    last_seen: Mutex<HashMap<String, Decimal>>,
}

impl DepositWatcher {
    /// Create a watcher over this instance's registry and projections
    pub fn new(
        log: Arc<EventLog>,
        projections: Projections,
        registry: Arc<ProviderRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            log,
            projections,
            registry,
            tick: DEFAULT_WATCH_TICK,
            shutdown,
            max_attempts: crate::saga::DEFAULT_PERSIST_ATTEMPTS,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Override the poll interval
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run until shutdown
    pub async fn run(&self) {
        info!(tick = ?self.tick, "deposit watcher started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("deposit watcher stopping on shutdown");
                    return;
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
            self.scan().await;
        }
    }

    /// One scan over all known deposit keys; returns deposits credited
    pub async fn scan(&self) -> usize {
        let mut credited = 0;
        for (user, account_id, wallet) in self.projections.accounts.all_wallets() {
            let Some(public_key) = wallet.public_key else {
                continue;
            };
            let Ok(provider) = self.registry.get(&wallet.coin_symbol) else {
                continue;
            };

            let chain_balance = match provider.get_balance(&public_key).await {
                Ok(b) => b,
                Err(e) => {
                    // Node trouble is transient; next tick is the backoff.
                    warn!(key = %public_key, error = %e, "balance query failed");
                    continue;
                }
            };

            let baseline = {
                let mut last_seen = self.last_seen.lock();
                match last_seen.get(&public_key).copied() {
                    Some(prev) => prev,
                    None => {
                        last_seen.insert(public_key.clone(), chain_balance);
                        continue;
                    }
                }
            };
            if chain_balance <= baseline {
                continue;
            }
            let delta = chain_balance - baseline;

            let coin = wallet.coin_symbol.clone();
            let key = public_key.clone();
            let result: Result<_, WalletError> = persist_single(
                &self.log,
                self.max_attempts,
                &|_| {
                    EventPayload::WalletDeposit(WalletDeposit {
                        user,
                        account_id,
                        coin_symbol: coin.clone(),
                        deposit_public_key: key.clone(),
                        deposit_qty: delta,
                        new_balance: self.projections.accounts.balance(user, account_id, &coin)
                            + delta,
                        saga: SagaFlags::default(),
                    })
                },
            )
            .await;

            match result {
                Ok((version, _)) => {
                    self.last_seen.lock().insert(public_key, chain_balance);
                    credited += 1;
                    info!(version, %delta, coin = %wallet.coin_symbol, "deposit credited");
                }
                Err(e) => warn!(error = %e, "deposit credit failed, will retry"),
            }
        }
        credited
    }
}
