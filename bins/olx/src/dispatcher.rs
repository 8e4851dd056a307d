//! Command dispatch
//!
//! The queue transport is an external collaborator; it hands envelopes to
//! [`CommandDispatcher::dispatch`] and owns acknowledgement. Business
//! rejections become correlated answers on the requester's reply channel;
//! payloads that cannot be processed at all go to the dead-letter sink.
//! Redeliveries (dequeue count above one) are answered as already handled
//! rather than applied twice.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::{
    AnswerSink, CommandAnswer, CommandBody, CommandEnvelope, DeadLetterSink,
};
use trading::{NewOrder, OrderCommandPlanner, TradingError};
use wallet::{WalletError, WalletSagaCoordinator};

/// Routes inbound command envelopes to the planner and the wallet saga
pub struct CommandDispatcher {
    planner: Arc<OrderCommandPlanner>,
    saga: Arc<WalletSagaCoordinator>,
    answers: Arc<dyn AnswerSink>,
    dead_letters: Arc<dyn DeadLetterSink>,
    shutdown: Option<CancellationToken>,
}

impl CommandDispatcher {
    pub fn new(
        planner: Arc<OrderCommandPlanner>,
        saga: Arc<WalletSagaCoordinator>,
        answers: Arc<dyn AnswerSink>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            planner,
            saga,
            answers,
            dead_letters,
            shutdown: None,
        }
    }

    /// Tie integrity violations to the process shutdown token
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Short description for startup logging
    pub fn describe(&self) -> &'static str {
        "order and wallet commands"
    }

    /// Process one envelope end to end
    pub async fn dispatch(&self, envelope: CommandEnvelope) {
        if envelope.is_redelivery() {
            warn!(
                request_id = %envelope.request_id,
                dequeue_count = envelope.dequeue_count,
                "redelivered command treated as already handled"
            );
            self.answer(&envelope, Some("duplicate delivery".to_string()))
                .await;
            return;
        }

        let outcome = self.execute(&envelope).await;
        match outcome {
            Ok(()) => self.answer(&envelope, None).await,
            Err(DispatchError::Rejected(msg)) => self.answer(&envelope, Some(msg)).await,
            Err(DispatchError::Unrecoverable(msg)) => {
                error!(request_id = %envelope.request_id, error = %msg, "dead-lettering command");
                self.dead_letters
                    .dead_letter(format!("{envelope:?}"), msg.clone())
                    .await;
                self.answer(&envelope, Some(msg)).await;
                // Continuing would propagate corrupted derived state.
                if let Some(shutdown) = &self.shutdown {
                    shutdown.cancel();
                }
            }
        }
    }

    async fn execute(&self, envelope: &CommandEnvelope) -> Result<(), DispatchError> {
        match envelope.body.clone() {
            CommandBody::CreateOrder {
                instrument,
                qty,
                side,
                order_type,
                limit_price,
                stop_price,
                duration_type,
                duration,
                stop_loss,
                take_profit,
            } => {
                self.planner
                    .create_order(NewOrder {
                        user: envelope.user,
                        account_id: envelope.account_id,
                        instrument,
                        qty,
                        side,
                        order_type,
                        limit_price,
                        stop_price,
                        duration_type,
                        duration,
                        stop_loss,
                        take_profit,
                    })
                    .await
                    .map(|_| ())
                    .map_err(trading_error)
            }
            CommandBody::CancelOrder {
                instrument,
                created_on_version,
            } => self
                .planner
                .cancel_order(
                    envelope.user,
                    envelope.account_id,
                    instrument,
                    created_on_version,
                )
                .await
                .map(|_| ())
                .map_err(trading_error),
            CommandBody::GenerateWallet { coin_symbol } => self
                .saga
                .generate_wallet(envelope.user, envelope.account_id, coin_symbol)
                .await
                .map(|_| ())
                .map_err(wallet_error),
            CommandBody::Withdraw {
                coin_symbol,
                withdrawal_target_public_key,
                qty,
            } => self
                .saga
                .withdraw(
                    envelope.user,
                    envelope.account_id,
                    coin_symbol,
                    withdrawal_target_public_key,
                    qty,
                )
                .await
                .map(|_| ())
                .map_err(wallet_error),
        }
    }

    async fn answer(&self, envelope: &CommandEnvelope, error: Option<String>) {
        let Some(postfix) = &envelope.answer_queue_postfix else {
            return;
        };
        let answer = match error {
            None => CommandAnswer::ok(envelope.user, envelope.request_id),
            Some(msg) => CommandAnswer::rejected(envelope.user, envelope.request_id, msg),
        };
        self.answers.send_answer(postfix, answer).await;
    }
}

enum DispatchError {
    /// Business rejection or transient failure: answer the requester
    Rejected(String),
    /// Integrity violation: dead-letter and halt the process
    Unrecoverable(String),
}

fn trading_error(e: TradingError) -> DispatchError {
    if e.is_integrity_violation() {
        return DispatchError::Unrecoverable(e.to_string());
    }
    match e {
        TradingError::Rejected(msg) => DispatchError::Rejected(msg),
        other => DispatchError::Rejected(other.to_string()),
    }
}

fn wallet_error(e: WalletError) -> DispatchError {
    if e.is_integrity_violation() {
        return DispatchError::Unrecoverable(e.to_string());
    }
    match e {
        WalletError::Rejected(msg) => DispatchError::Rejected(msg),
        other => DispatchError::Rejected(other.to_string()),
    }
}

/// Answer sink that only logs; the queue transport replaces it
pub struct LogAnswerSink;

#[async_trait]
impl AnswerSink for LogAnswerSink {
    async fn send_answer(&self, postfix: &str, answer: CommandAnswer) {
        info!(
            postfix,
            request_id = %answer.request_id,
            error = ?answer.error,
            "answer emitted"
        );
    }
}

/// Dead-letter sink that only logs; the queue transport replaces it
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn dead_letter(&self, payload: String, error: String) {
        error!(%error, payload, "command dead-lettered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DurationType, Instrument, OrderType, Side, Symbol, UserId};
    use event_log::{EventLog, InMemoryEventStore, VersionControl};
    use parking_lot::Mutex;
    use projections::Projections;
    use rust_decimal_macros::dec;
    use uuid::Uuid;
    use wallet::ProviderRegistry;

    #[derive(Default)]
    struct CapturingSink {
        answers: Mutex<Vec<(String, CommandAnswer)>>,
    }

    #[async_trait]
    impl AnswerSink for CapturingSink {
        async fn send_answer(&self, postfix: &str, answer: CommandAnswer) {
            self.answers.lock().push((postfix.to_string(), answer));
        }
    }

    fn dispatcher() -> (CommandDispatcher, Arc<CapturingSink>) {
        let store = Arc::new(InMemoryEventStore::new());
        let version = Arc::new(VersionControl::new(0));
        let log = Arc::new(EventLog::new(store, version));
        let projections = Projections::new();
        let planner = Arc::new(OrderCommandPlanner::new(log.clone(), projections.clone()));
        let saga = Arc::new(WalletSagaCoordinator::new(
            log,
            projections,
            Arc::new(ProviderRegistry::new()),
        ));
        let sink = Arc::new(CapturingSink::default());
        let dispatcher = CommandDispatcher::new(
            planner,
            saga,
            sink.clone(),
            Arc::new(LogDeadLetterSink),
        );
        (dispatcher, sink)
    }

    fn create_order_envelope(dequeue_count: u32) -> CommandEnvelope {
        CommandEnvelope {
            user: UserId::new(),
            account_id: common::AccountId::new(),
            request_id: Uuid::new_v4(),
            answer_queue_postfix: Some("replies-1".into()),
            dequeue_count,
            body: CommandBody::CreateOrder {
                instrument: Instrument::new("ETH", "BTC"),
                qty: dec!(1),
                side: Side::Buy,
                order_type: OrderType::Limit,
                limit_price: Some(dec!(0.5)),
                stop_price: None,
                duration_type: DurationType::GoodTillCancel,
                duration: None,
                stop_loss: None,
                take_profit: None,
            },
        }
    }

    #[tokio::test]
    async fn test_rejection_produces_correlated_answer() {
        let (dispatcher, sink) = dispatcher();
        let envelope = create_order_envelope(1);
        let request_id = envelope.request_id;

        // No balance: the planner rejects, the requester hears why.
        dispatcher.dispatch(envelope).await;

        let answers = sink.answers.lock();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].0, "replies-1");
        assert_eq!(answers[0].1.request_id, request_id);
        assert!(answers[0].1.error.as_deref().unwrap().contains("insufficient"));
    }

    #[tokio::test]
    async fn test_redelivery_is_not_applied() {
        let (dispatcher, sink) = dispatcher();
        dispatcher.dispatch(create_order_envelope(2)).await;

        let answers = sink.answers.lock();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].1.error.as_deref(), Some("duplicate delivery"));
    }

    #[tokio::test]
    async fn test_unknown_coin_rejected() {
        let (dispatcher, sink) = dispatcher();
        let envelope = CommandEnvelope {
            user: UserId::new(),
            account_id: common::AccountId::new(),
            request_id: Uuid::new_v4(),
            answer_queue_postfix: Some("replies-2".into()),
            dequeue_count: 1,
            body: CommandBody::GenerateWallet {
                coin_symbol: Symbol::new("DOGE"),
            },
        };
        dispatcher.dispatch(envelope).await;

        let answers = sink.answers.lock();
        assert!(answers[0].1.error.as_deref().unwrap().contains("DOGE"));
    }
}
