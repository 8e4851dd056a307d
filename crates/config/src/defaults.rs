//! Default values applied when configuration fields are omitted

use crate::{CoinSection, ExchangeSection, LedgerConfig, WalletSection};

pub fn default_replay_tick_secs() -> u64 {
    2
}

pub fn default_persist_attempts() -> u32 {
    16
}

pub fn default_cas_attempts() -> u32 {
    64
}

pub fn default_poll_interval_secs() -> u64 {
    1
}

pub fn default_validation_polls() -> u32 {
    60
}

pub fn default_watch_tick_secs() -> u64 {
    5
}

pub fn default_enabled() -> bool {
    true
}

pub fn default_coins() -> Vec<CoinSection> {
    vec![
        CoinSection {
            symbol: "BTC".to_string(),
            name: "Bitcoin".to_string(),
            enabled: true,
        },
        CoinSection {
            symbol: "ETH".to_string(),
            name: "Ethereum".to_string(),
            enabled: true,
        },
    ]
}

/// A complete starter configuration for `init`
pub fn generate_default_config() -> LedgerConfig {
    LedgerConfig {
        exchange: ExchangeSection {
            name: "OpenLedger".to_string(),
            description: "Event-sourced exchange backend".to_string(),
            version: "0.1.0".to_string(),
        },
        engine: Default::default(),
        wallet: WalletSection::default(),
    }
}
