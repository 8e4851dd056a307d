//! Blockchain wallet provider contract
//!
//! The core depends only on these five operations; Bitcoin-fork and
//! Ethereum-token specifics live outside this workspace. Providers are
//! looked up through an explicit registry built once at startup and passed
//! by reference to everything coin-specific; there is no ambient global
//! lookup table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use common::Symbol;

use crate::error::{ProviderError, WalletError};

/// One coin's blockchain operations
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// On-chain balance of a public key
    async fn get_balance(&self, public_key: &str) -> Result<Decimal, ProviderError>;

    /// Transfer `amount_excl_fee` from one key to another
    async fn withdraw(
        &self,
        from_public_key: &str,
        to_public_key: &str,
        amount_excl_fee: Decimal,
    ) -> Result<(), ProviderError>;

    /// Generate a fresh HD wallet seed
    async fn generate_hd_wallet(&self) -> Result<String, ProviderError>;

    /// Derive the public key for a seed
    async fn get_public_key_from_hd_wallet(&self, seed: &str) -> Result<String, ProviderError>;

    /// Current flat transfer fee
    async fn fee(&self) -> Result<Decimal, ProviderError>;
}

/// Providers by coin symbol, constructed once at startup
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<Symbol, Arc<dyn WalletProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for a coin (builder style)
    pub fn with_provider(
        mut self,
        coin: impl Into<Symbol>,
        provider: Arc<dyn WalletProvider>,
    ) -> Self {
        self.providers.insert(coin.into(), provider);
        self
    }

    /// Look up the provider for a coin
    pub fn get(&self, coin: &Symbol) -> Result<&Arc<dyn WalletProvider>, WalletError> {
        self.providers
            .get(coin)
            .ok_or_else(|| WalletError::UnknownCoin(coin.clone()))
    }

    /// Registered coin symbols
    pub fn coins(&self) -> Vec<Symbol> {
        let mut coins: Vec<Symbol> = self.providers.keys().cloned().collect();
        coins.sort();
        coins
    }
}
