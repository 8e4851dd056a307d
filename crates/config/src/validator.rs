//! Configuration validation
//!
//! Validation collects everything wrong or suspicious in one pass so the
//! operator sees the full picture instead of fixing errors one restart at
//! a time.

use crate::LedgerConfig;

/// One validation problem
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.field, self.message)
    }
}

/// The outcome of validating a configuration
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// True when the configuration can be used
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.to_string(),
            message: message.into(),
        });
    }

    fn warn(&mut self, field: &str, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

/// Validate a configuration
pub fn validate_config(config: &LedgerConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.exchange.name.trim().is_empty() {
        report.error("exchange.name", "must not be empty");
    }
    if config.exchange.version.trim().is_empty() {
        report.error("exchange.version", "must not be empty");
    }

    if config.engine.replay_tick_secs == 0 {
        report.error("engine.replay_tick_secs", "must be at least 1 second");
    }
    if config.engine.persist_attempts == 0 {
        report.error("engine.persist_attempts", "must be at least 1");
    }
    if config.engine.cas_attempts == 0 {
        report.error("engine.cas_attempts", "must be at least 1");
    }
    if config.engine.replay_tick_secs > 30 {
        report.warn(
            "engine.replay_tick_secs",
            "over 30s; commands will take that long to reflect in projections",
        );
    }

    if config.wallet.coins.iter().all(|c| !c.enabled) {
        report.warn("wallet.coins", "no coin is enabled");
    }
    for coin in &config.wallet.coins {
        if coin.symbol.trim().is_empty() {
            report.error("wallet.coins.symbol", "coin symbol must not be empty");
        }
    }
    if config.wallet.validation_polls == 0 {
        report.error("wallet.validation_polls", "must be at least 1");
    }

    report
}
