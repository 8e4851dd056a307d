//! End-to-end matching scenarios over a real log and replay loop
//!
//! Each command is planned against the projections, persisted to the shared
//! log, and integrated by the replay loop before the next command runs,
//! mirroring how a single service instance actually operates.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use common::{AccountId, DurationType, Instrument, OrderType, Side, Symbol, UserId};
use event_log::{
    EventEntry, EventLog, EventPayload, InMemoryEventStore, SagaFlags, VersionControl,
    WalletDeposit,
};
use projections::{OrderHistoryStatus, Projections, ReplayLoop};
use trading::{NewOrder, OrderCommandPlanner, TradingError};

struct Exchange {
    store: Arc<InMemoryEventStore>,
    log: Arc<EventLog>,
    replay: ReplayLoop,
    planner: OrderCommandPlanner,
    projections: Projections,
}

fn exchange() -> Exchange {
    let store = Arc::new(InMemoryEventStore::new());
    let version = Arc::new(VersionControl::new(0));
    let log = Arc::new(EventLog::new(store.clone(), version));
    let projections = Projections::new();
    let replay = ReplayLoop::new(log.clone(), projections.clone(), CancellationToken::new());
    let planner = OrderCommandPlanner::new(log.clone(), projections.clone());
    Exchange {
        store,
        log,
        replay,
        planner,
        projections,
    }
}

struct Trader {
    user: UserId,
    account: AccountId,
}

fn trader() -> Trader {
    Trader {
        user: UserId::new(),
        account: AccountId::new(),
    }
}

impl Exchange {
    async fn deposit(&self, who: &Trader, coin: &str, qty: Decimal) {
        let coin = Symbol::new(coin);
        let current = self
            .projections
            .accounts
            .balance(who.user, who.account, &coin);
        let version = self.log.version_control().current_version() + 1;
        self.log
            .persist(
                vec![EventEntry::new(
                    version,
                    EventPayload::WalletDeposit(WalletDeposit {
                        user: who.user,
                        account_id: who.account,
                        coin_symbol: coin,
                        deposit_public_key: "pk".into(),
                        deposit_qty: qty,
                        new_balance: current + qty,
                        saga: SagaFlags::default(),
                    }),
                )],
                None,
            )
            .await
            .unwrap()
            .expect("deposit must commit");
        self.replay.integrate_once().await.unwrap();
    }

    async fn place(
        &self,
        who: &Trader,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> Result<i64, TradingError> {
        let version = self
            .planner
            .create_order(NewOrder {
                user: who.user,
                account_id: who.account,
                instrument: Instrument::new("ETH", "BTC"),
                qty,
                side,
                order_type: OrderType::Limit,
                limit_price: Some(price),
                stop_price: None,
                duration_type: DurationType::GoodTillCancel,
                duration: None,
                stop_loss: None,
                take_profit: None,
            })
            .await?;
        self.replay.integrate_once().await.unwrap();
        Ok(version)
    }

    fn total_holdings(&self, traders: &[&Trader], coin: &str) -> Decimal {
        let coin = Symbol::new(coin);
        traders
            .iter()
            .map(|t| self.projections.accounts.balance(t.user, t.account, &coin))
            .sum()
    }
}

#[tokio::test]
async fn test_price_time_matching_scenario() {
    let ex = exchange();
    let inst = Instrument::new("ETH", "BTC");

    // Trader A both buys early and sells the big lot; B, C, D take turns.
    let a = trader();
    let b = trader();
    let c = trader();
    let d = trader();

    ex.deposit(&b, "BTC", dec!(1)).await;
    ex.deposit(&a, "BTC", dec!(1)).await;
    ex.deposit(&a, "ETH", dec!(4.5)).await;
    ex.deposit(&c, "BTC", dec!(2)).await;
    ex.deposit(&d, "ETH", dec!(1)).await;

    let eth_supply = ex.total_holdings(&[&a, &b, &c, &d], "ETH");
    let btc_supply = ex.total_holdings(&[&a, &b, &c, &d], "BTC");

    // Two resting bids at 0.2, then a sell that sweeps both.
    ex.place(&b, Side::Buy, dec!(2.5), dec!(0.2)).await.unwrap();
    ex.place(&a, Side::Buy, dec!(1), dec!(0.2)).await.unwrap();
    ex.place(&a, Side::Sell, dec!(4.5), dec!(0.1)).await.unwrap();

    let depth = ex.projections.books.depth(&inst);
    assert!(depth.bids.is_empty(), "both bids must be consumed");
    assert_eq!(depth.asks, vec![(dec!(0.1), dec!(1.0))]);

    // A's early buy is closed and fully filled.
    let a_history = ex.projections.history.orders_for_user(a.user);
    assert_eq!(a_history.len(), 1);
    assert_eq!(a_history[0].qty, dec!(1));
    assert_eq!(a_history[0].filled_qty, dec!(1));
    assert_eq!(a_history[0].limit_price, Some(dec!(0.2)));
    assert_eq!(a_history[0].status, OrderHistoryStatus::Filled);

    // A buy at 0.8 sweeps the resting 1.0 ask and rests its remainder.
    let c_version = ex.place(&c, Side::Buy, dec!(2), dec!(0.8)).await.unwrap();

    let depth = ex.projections.books.depth(&inst);
    assert!(depth.asks.is_empty());
    assert_eq!(depth.bids, vec![(dec!(0.8), dec!(1))]);
    let c_order = ex.projections.books.find_order(&inst, c_version).unwrap();
    assert_eq!(c_order.qty, dec!(2));
    assert_eq!(c_order.filled_qty, dec!(1));
    assert_eq!(c_order.limit_price, dec!(0.8));

    // The big sell is now fully filled; A's history lists it first.
    let a_history = ex.projections.history.orders_for_user(a.user);
    assert_eq!(a_history.len(), 2);
    assert_eq!(a_history[0].qty, dec!(4.5));
    assert_eq!(a_history[0].filled_qty, dec!(4.5));
    assert_eq!(a_history[0].limit_price, Some(dec!(0.1)));
    assert_eq!(a_history[1].limit_price, Some(dec!(0.2)));

    // A final sell at 0.8 closes the resting buy; book empties out.
    ex.place(&d, Side::Sell, dec!(1), dec!(0.8)).await.unwrap();
    let depth = ex.projections.books.depth(&inst);
    assert!(depth.bids.is_empty());
    assert!(depth.asks.is_empty());

    // Matching moves coin around but never mints or burns it.
    assert_eq!(ex.total_holdings(&[&a, &b, &c, &d], "ETH"), eth_supply);
    assert_eq!(ex.total_holdings(&[&a, &b, &c, &d], "BTC"), btc_supply);

    // Nothing stays reserved once every order is closed.
    for t in [&a, &b, &c, &d] {
        for coin in ["ETH", "BTC"] {
            assert_eq!(
                ex.projections
                    .accounts
                    .reserved(t.user, t.account, &Symbol::new(coin)),
                dec!(0),
                "leftover reservation for {coin}"
            );
        }
    }
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let ex = exchange();
    let a = trader();
    let b = trader();
    let inst = Instrument::new("ETH", "BTC");

    ex.deposit(&a, "ETH", dec!(3)).await;
    ex.deposit(&b, "BTC", dec!(1)).await;
    ex.place(&a, Side::Sell, dec!(3), dec!(0.2)).await.unwrap();
    ex.place(&b, Side::Buy, dec!(2), dec!(0.25)).await.unwrap();

    // A second, fresh instance replays the same log from version 0.
    let other = Projections::new();
    let other_version = Arc::new(VersionControl::new(0));
    let other_log = Arc::new(EventLog::new(ex.log.store().clone(), other_version));
    let other_replay = ReplayLoop::new(other_log, other.clone(), CancellationToken::new());
    other_replay.integrate_once().await.unwrap();

    assert_eq!(other.books.depth(&inst), ex.projections.books.depth(&inst));
    for t in [&a, &b] {
        for coin in ["ETH", "BTC"] {
            let coin = Symbol::new(coin);
            assert_eq!(
                other.accounts.wallet(t.user, t.account, &coin),
                ex.projections.accounts.wallet(t.user, t.account, &coin)
            );
        }
        assert_eq!(
            other.history.orders_for_user(t.user),
            ex.projections.history.orders_for_user(t.user)
        );
    }
    assert_eq!(
        other.history.trades_for_instrument(&inst, 100),
        ex.projections.history.trades_for_instrument(&inst, 100)
    );
}

#[tokio::test]
async fn test_match_event_balances_are_zero_sum() {
    let ex = exchange();
    let a = trader();
    let b = trader();

    ex.deposit(&a, "ETH", dec!(2)).await;
    ex.deposit(&b, "BTC", dec!(1)).await;
    ex.place(&a, Side::Sell, dec!(2), dec!(0.4)).await.unwrap();
    ex.place(&b, Side::Buy, dec!(1), dec!(0.4)).await.unwrap();

    let events = ex.log.load_missing_events(0, None).await.unwrap();
    let match_ev = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::MatchOrder(ev) => Some(ev.clone()),
            _ => None,
        })
        .expect("one match event");

    assert_eq!(match_ev.qty, dec!(1));
    assert_eq!(match_ev.price, dec!(0.4));
    // The asserted new balances move coin between the parties without
    // minting or burning: totals stay at the deposited 2 ETH and 1 BTC.
    assert_eq!(
        match_ev.action_base_new_balance + match_ev.target_base_new_balance,
        dec!(2)
    );
    assert_eq!(
        match_ev.action_quote_new_balance + match_ev.target_quote_new_balance,
        dec!(1)
    );
}

#[tokio::test]
async fn test_insufficient_balance_rejected_without_events() {
    let ex = exchange();
    let broke = trader();

    let before = ex.store.len().await;
    let err = ex
        .place(&broke, Side::Buy, dec!(1), dec!(0.5))
        .await
        .unwrap_err();
    assert!(matches!(err, TradingError::Rejected(_)));
    assert_eq!(ex.store.len().await, before, "rejection must not append");
}

#[tokio::test]
async fn test_cancel_rejects_cross_user_access() {
    let ex = exchange();
    let owner = trader();
    let intruder = trader();
    let inst = Instrument::new("ETH", "BTC");

    ex.deposit(&owner, "BTC", dec!(1)).await;
    let version = ex.place(&owner, Side::Buy, dec!(1), dec!(0.5)).await.unwrap();

    let err = ex
        .planner
        .cancel_order(intruder.user, intruder.account, inst.clone(), version)
        .await
        .unwrap_err();
    assert!(matches!(err, TradingError::Rejected(_)));

    // The order is untouched and still cancellable by its owner.
    assert!(ex.projections.books.find_order(&inst, version).is_some());
    ex.planner
        .cancel_order(owner.user, owner.account, inst.clone(), version)
        .await
        .unwrap();
    ex.replay.integrate_once().await.unwrap();
    assert!(ex.projections.books.find_order(&inst, version).is_none());
}

#[tokio::test]
async fn test_market_order_requires_liquidity() {
    let ex = exchange();
    let a = trader();
    let b = trader();
    ex.deposit(&a, "BTC", dec!(1)).await;

    let market = |who: &Trader| NewOrder {
        user: who.user,
        account_id: who.account,
        instrument: Instrument::new("ETH", "BTC"),
        qty: dec!(1),
        side: Side::Buy,
        order_type: OrderType::Market,
        limit_price: None,
        stop_price: None,
        duration_type: DurationType::GoodTillCancel,
        duration: None,
        stop_loss: None,
        take_profit: None,
    };

    // Empty book: market orders never rest, so this is a rejection.
    let err = ex.planner.create_order(market(&a)).await.unwrap_err();
    assert!(matches!(err, TradingError::Rejected(_)));

    // With liquidity the same order fills and settles balances.
    ex.deposit(&b, "ETH", dec!(2)).await;
    ex.place(&b, Side::Sell, dec!(2), dec!(0.3)).await.unwrap();
    ex.planner.create_order(market(&a)).await.unwrap();
    ex.replay.integrate_once().await.unwrap();

    let eth = Symbol::new("ETH");
    let btc = Symbol::new("BTC");
    assert_eq!(
        ex.projections.accounts.balance(a.user, a.account, &eth),
        dec!(1)
    );
    assert_eq!(
        ex.projections.accounts.balance(a.user, a.account, &btc),
        dec!(0.7)
    );

    // The market order closes immediately with a Filled history row.
    let history = ex.projections.history.orders_for_user(a.user);
    assert_eq!(history[0].status, OrderHistoryStatus::Filled);
    assert_eq!(history[0].filled_qty, dec!(1));
}

#[tokio::test]
async fn test_stop_order_rests_hidden_until_triggered() {
    let ex = exchange();
    let a = trader();
    let b = trader();
    let c = trader();
    let inst = Instrument::new("ETH", "BTC");

    ex.deposit(&a, "ETH", dec!(2)).await;
    ex.deposit(&b, "ETH", dec!(1)).await;
    ex.deposit(&c, "BTC", dec!(1)).await;

    // A sell stop at 0.4: hidden, invisible to depth and matching.
    let stop_version = ex
        .planner
        .create_order(NewOrder {
            user: a.user,
            account_id: a.account,
            instrument: inst.clone(),
            qty: dec!(2),
            side: Side::Sell,
            order_type: OrderType::Stop,
            limit_price: Some(dec!(0.35)),
            stop_price: Some(dec!(0.4)),
            duration_type: DurationType::GoodTillCancel,
            duration: None,
            stop_loss: None,
            take_profit: None,
        })
        .await
        .unwrap();
    ex.replay.integrate_once().await.unwrap();

    assert!(ex.projections.books.depth(&inst).asks.is_empty());
    assert!(ex
        .projections
        .books
        .find_hidden(&inst, stop_version)
        .is_some());

    // A trade prints at 0.3, below the stop level.
    ex.place(&b, Side::Sell, dec!(1), dec!(0.3)).await.unwrap();
    ex.place(&c, Side::Buy, dec!(1), dec!(0.3)).await.unwrap();

    // The trigger scan runs as a replay listener in the service binary; here
    // the conversion is driven directly.
    let hidden = ex
        .projections
        .books
        .find_hidden(&inst, stop_version)
        .unwrap();
    assert!(hidden.triggers_at(dec!(0.3)));
    let converted = ex
        .planner
        .trigger_stop_order(&hidden, dec!(0.3))
        .await
        .unwrap();
    assert!(converted.is_some());
    ex.replay.integrate_once().await.unwrap();

    // Hidden entry is gone; a live limit order rests at the stop's limit.
    assert!(ex.projections.books.find_hidden(&inst, stop_version).is_none());
    assert_eq!(
        ex.projections.books.depth(&inst).asks,
        vec![(dec!(0.35), dec!(2))]
    );
}
