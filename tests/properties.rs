use proptest::prelude::*;

use sim_trader::domain::Action;
use sim_trader::executor::TradeExecutor;
use sim_trader::feed::{parse_line, RandomWalk, PRICE_CEIL, PRICE_FLOOR};
use sim_trader::queue::SafeQueue;
use sim_trader::recorder::EventSink;
use sim_trader::strategy::StrategyMode;

#[derive(Debug, Clone)]
enum Op {
    Buy(f64, f64),
    Sell(f64, f64),
}

fn op() -> impl Strategy<Value = Op> {
    let leg = (1.0f64..5_000.0, 0.001f64..10.0);
    prop_oneof![
        leg.clone().prop_map(|(p, a)| Op::Buy(p, a)),
        leg.prop_map(|(p, a)| Op::Sell(p, a)),
    ]
}

fn mode() -> impl Strategy<Value = StrategyMode> {
    prop_oneof![Just(StrategyMode::Sma), Just(StrategyMode::Rsi), Just(StrategyMode::Bollinger)]
}

proptest! {
    #[test]
    fn queue_preserves_fifo_order(items in prop::collection::vec(any::<i64>(), 0..200)) {
        let q = SafeQueue::new();
        for &i in &items {
            q.push(i);
        }
        let mut out = Vec::new();
        while let Some(i) = q.try_pop() {
            out.push(i);
        }
        prop_assert_eq!(out, items);
    }

    #[test]
    fn portfolio_never_goes_negative(ops in prop::collection::vec(op(), 1..60)) {
        let ex = TradeExecutor::new(10_000.0, EventSink::disabled());
        for op in ops {
            let before = ex.snapshot();
            let ok = match op {
                Op::Buy(p, a) => ex.handle_signal(Action::Buy, p, a),
                Op::Sell(p, a) => ex.handle_signal(Action::Sell, p, a),
            };
            let after = ex.snapshot();
            prop_assert!(after.cash >= 0.0);
            prop_assert!(after.asset_units >= 0.0);
            if ok {
                prop_assert_eq!(after.total_trades, before.total_trades + 1);
            } else {
                prop_assert_eq!(after, before);
            }
        }
    }

    #[test]
    fn strategies_hold_on_short_history(
        mode in mode(),
        prices in prop::collection::vec(1.0f64..100_000.0, 0..40),
    ) {
        let s = mode.build();
        let short = &prices[..prices.len().min(s.required_history().saturating_sub(1))];
        prop_assert_eq!(s.decide(short), Action::Hold);
    }

    #[test]
    fn strategy_decisions_are_deterministic(
        mode in mode(),
        prices in prop::collection::vec(1.0f64..100_000.0, 0..80),
    ) {
        prop_assert_eq!(mode.build().decide(&prices), mode.build().decide(&prices));
    }

    #[test]
    fn seeded_walk_is_reproducible_and_bounded(seed in any::<u64>()) {
        let mut a = RandomWalk::new(Some(seed));
        let mut b = RandomWalk::new(Some(seed));
        for _ in 0..200 {
            let p = a.next_price();
            prop_assert_eq!(p, b.next_price());
            prop_assert!((PRICE_FLOOR..=PRICE_CEIL).contains(&p));
        }
    }

    #[test]
    fn parse_line_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(Some(tick)) = parse_line(&bytes, "BTC") {
            prop_assert!(tick.price.is_finite() && tick.price > 0.0);
        }
    }
}
