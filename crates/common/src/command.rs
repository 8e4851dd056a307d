//! Command ingress and answer message types
//!
//! Commands arrive from an at-least-once delivery queue. The transport
//! itself lives outside this workspace; these types define the payloads it
//! carries and the sinks the core writes answers and dead letters to.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AccountId, DurationType, Instrument, OrderType, Side, Symbol, UserId};

/// Envelope around every inbound command message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// User issuing the command
    pub user: UserId,
    /// Account the command acts on
    pub account_id: AccountId,
    /// Correlation id echoed in the answer
    pub request_id: Uuid,
    /// Reply-channel suffix; answers are only emitted when present
    pub answer_queue_postfix: Option<String>,
    /// Delivery attempt counter from the queue; > 1 means redelivery
    pub dequeue_count: u32,
    /// The command itself
    pub body: CommandBody,
}

impl CommandEnvelope {
    /// True when the queue has delivered this message before
    pub fn is_redelivery(&self) -> bool {
        self.dequeue_count > 1
    }
}

/// The command variants carried by the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandBody {
    /// Create a limit, stop, or market order
    CreateOrder {
        instrument: Instrument,
        qty: Decimal,
        side: Side,
        order_type: OrderType,
        limit_price: Option<Decimal>,
        stop_price: Option<Decimal>,
        duration_type: DurationType,
        duration: Option<i64>,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    },
    /// Cancel an open order identified by its creation version number
    CancelOrder {
        instrument: Instrument,
        created_on_version: i64,
    },
    /// Generate a deposit wallet for a coin
    GenerateWallet { coin_symbol: Symbol },
    /// Withdraw coin to an external address
    Withdraw {
        coin_symbol: Symbol,
        withdrawal_target_public_key: String,
        qty: Decimal,
    },
}

/// Correlated answer sent back to the requester's reply channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAnswer {
    pub user: UserId,
    pub request_id: Uuid,
    /// Business rejection text, `None` on success
    pub error: Option<String>,
}

impl CommandAnswer {
    /// Successful answer
    pub fn ok(user: UserId, request_id: Uuid) -> Self {
        Self {
            user,
            request_id,
            error: None,
        }
    }

    /// Rejected answer carrying the rejection text
    pub fn rejected(user: UserId, request_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            user,
            request_id,
            error: Some(error.into()),
        }
    }
}

/// Sink for answer messages, keyed by the requester's reply-channel suffix
#[async_trait]
pub trait AnswerSink: Send + Sync {
    async fn send_answer(&self, postfix: &str, answer: CommandAnswer);
}

/// Sink for messages that cannot be processed at all
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, payload: String, error: String);
}
