//! Common types used across OpenLedger
//!
//! This module provides the fundamental domain types used throughout
//! the exchange system.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Create a new random UserId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for trading accounts (a user may hold several)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub Uuid);

impl AccountId {
    /// Create a new random AccountId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl Side {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Returns true if this is a buy order
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    /// Returns true if this is a sell order
    pub fn is_sell(&self) -> bool {
        matches!(self, Side::Sell)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Limit order - rests in the book at the limit price
    Limit,
    /// Stop order - hidden until the stop price is crossed
    Stop,
    /// Market order - consumes resting liquidity, never rests
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Limit => write!(f, "limit"),
            OrderType::Stop => write!(f, "stop"),
            OrderType::Market => write!(f, "market"),
        }
    }
}

/// How long an order stays active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DurationType {
    /// Remains active until filled or cancelled
    #[default]
    GoodTillCancel,
    /// Expires after `duration` seconds
    GoodTillTime,
}

/// Asset symbol (e.g., "BTC", "ETH")
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    /// Create a new Symbol
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    /// Get the symbol as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Traded instrument (e.g., "ETH-BTC": base ETH priced in quote BTC)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instrument {
    /// Base asset (the quantity being traded)
    pub base: Symbol,
    /// Quote asset (the price denomination)
    pub quote: Symbol,
}

impl Instrument {
    /// Create a new instrument
    pub fn new(base: impl Into<Symbol>, quote: impl Into<Symbol>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// True if either leg of the instrument is the given coin
    pub fn touches(&self, coin: &Symbol) -> bool {
        &self.base == coin || &self.quote == coin
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

/// Worst-case cost an order reserves against the account
///
/// A buy reserves `qty * price` in the quote currency; a sell reserves
/// `qty` in the base currency.
pub fn order_reservation(side: Side, qty: Decimal, price: Decimal) -> Decimal {
    match side {
        Side::Buy => qty * price,
        Side::Sell => qty,
    }
}

/// The coin an order's reservation is held in
pub fn reservation_coin(side: Side, instrument: &Instrument) -> Symbol {
    match side {
        Side::Buy => instrument.quote.clone(),
        Side::Sell => instrument.base.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_user_id() {
        let id1 = UserId::new();
        let id2 = UserId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_side() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert!(Side::Buy.is_buy());
        assert!(Side::Sell.is_sell());
    }

    #[test]
    fn test_symbol() {
        let sym = Symbol::new("btc");
        assert_eq!(sym.as_str(), "BTC");
    }

    #[test]
    fn test_instrument() {
        let inst = Instrument::new("ETH", "BTC");
        assert_eq!(inst.to_string(), "ETH-BTC");
        assert!(inst.touches(&Symbol::new("ETH")));
        assert!(inst.touches(&Symbol::new("BTC")));
        assert!(!inst.touches(&Symbol::new("LTC")));
    }

    #[test]
    fn test_order_reservation() {
        assert_eq!(order_reservation(Side::Buy, dec!(2), dec!(0.5)), dec!(1.0));
        assert_eq!(order_reservation(Side::Sell, dec!(2), dec!(0.5)), dec!(2));
    }
}
