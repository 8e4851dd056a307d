//! Configuration for OpenLedger services
//!
//! One YAML file configures every deployable role. Loading applies
//! defaults for anything omitted; validation produces a report of errors
//! and warnings rather than failing on the first problem.

use serde::{Deserialize, Serialize};

pub mod defaults;
pub mod parser;
pub mod validator;

pub use defaults::*;
pub use parser::*;
pub use validator::*;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    pub exchange: ExchangeSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub wallet: WalletSection,
}

/// Exchange identity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
}

/// Event engine tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSection {
    /// Replay loop tick in seconds
    #[serde(default = "default_replay_tick_secs")]
    pub replay_tick_secs: u64,
    /// Cap on optimistic persist retries
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,
    /// Cap on balance compare-and-swap retries
    #[serde(default = "default_cas_attempts")]
    pub cas_attempts: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            replay_tick_secs: default_replay_tick_secs(),
            persist_attempts: default_persist_attempts(),
            cas_attempts: default_cas_attempts(),
        }
    }
}

/// Wallet saga tuning and supported coins
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WalletSection {
    /// Coins the wallet service handles
    #[serde(default = "default_coins")]
    pub coins: Vec<CoinSection>,
    /// Seconds between saga-flag polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Polls before a validation wait times out
    #[serde(default = "default_validation_polls")]
    pub validation_polls: u32,
    /// Seconds between deposit-watcher chain scans
    #[serde(default = "default_watch_tick_secs")]
    pub watch_tick_secs: u64,
}

impl Default for WalletSection {
    fn default() -> Self {
        Self {
            coins: default_coins(),
            poll_interval_secs: default_poll_interval_secs(),
            validation_polls: default_validation_polls(),
            watch_tick_secs: default_watch_tick_secs(),
        }
    }
}

/// One supported coin
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoinSection {
    pub symbol: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_omitted_sections() {
        let yaml = r#"
exchange:
  name: OpenLedger
  version: "0.1.0"
"#;
        let config: LedgerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.engine.replay_tick_secs, 2);
        assert_eq!(config.engine.persist_attempts, 16);
        assert_eq!(config.wallet.validation_polls, 60);
        assert!(!config.wallet.coins.is_empty());
    }
}
