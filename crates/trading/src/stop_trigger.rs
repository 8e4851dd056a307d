//! Stop-order trigger scan
//!
//! Stops are trade-price triggered: after every integrated transaction, the
//! hidden orders of each instrument a trade printed on are checked against
//! the trade prices. A buy stop arms at or above its stop price, a sell
//! stop at or below. Conversion goes through the planner's normal path, so
//! it inherits the balance check and the optimistic persist protocol.
//!
//! A quiet market cannot trigger stops; only printed trades move them.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use event_log::{EventEntry, EventPayload};
use projections::{EventListener, Projections};

use crate::planner::OrderCommandPlanner;

/// Replay listener that converts triggered stop orders
pub struct StopOrderTrigger {
    planner: Arc<OrderCommandPlanner>,
    projections: Projections,
    /// Stops already sent for conversion; their cancel event has not
    /// necessarily integrated yet, so the projection may still show them.
    in_flight: Mutex<HashSet<i64>>,
}

impl StopOrderTrigger {
    /// Create a trigger scanner over this instance's planner
    pub fn new(planner: Arc<OrderCommandPlanner>, projections: Projections) -> Self {
        Self {
            planner,
            projections,
            in_flight: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl EventListener for StopOrderTrigger {
    async fn on_transaction(&self, _version: i64, events: &[EventEntry]) {
        for event in events {
            let EventPayload::MatchOrder(ev) = &event.payload else {
                continue;
            };
            for stop in self.projections.books.hidden_orders(&ev.instrument) {
                if !stop.triggers_at(ev.price) {
                    continue;
                }
                if self.in_flight.lock().contains(&stop.created_on_version) {
                    continue;
                }
                match self.planner.trigger_stop_order(&stop, ev.price).await {
                    Ok(Some(version)) => {
                        self.in_flight.lock().insert(stop.created_on_version);
                        info!(
                            stop_version = stop.created_on_version,
                            converted_at = version,
                            price = %ev.price,
                            "stop order triggered"
                        );
                    }
                    Ok(None) => {
                        // Already gone; safe to forget.
                        self.in_flight.lock().remove(&stop.created_on_version);
                    }
                    Err(e) => {
                        warn!(
                            stop_version = stop.created_on_version,
                            error = %e,
                            "stop conversion failed, will retry on next trade"
                        );
                    }
                }
            }
        }
    }
}
