use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use daytrader_rust::autorequests::SellCancelPolicy;
use daytrader_rust::currency::Money;
use daytrader_rust::domain::{Quote, Side};
use daytrader_rust::error::TradeError;
use daytrader_rust::executor::{Executor, ExecutorCfg, ExpiredOrderPolicy};
use daytrader_rust::parser::parse_line;
use daytrader_rust::quotes::QuoteSource;

const USERS: [&str; 2] = ["alice", "bob"];
const STOCKS: [&str; 2] = ["ABC", "XYZ"];

/// Prices and quote time steered by the test between commands.
#[derive(Clone, Default)]
struct Tape(Arc<Mutex<(HashMap<String, Money>, Option<DateTime<Utc>>)>>);

impl Tape {
    fn set(&self, stock: &str, cents: i64, at: DateTime<Utc>) {
        let mut st = self.0.lock().unwrap();
        st.0.insert(stock.to_string(), Money::from_cents(cents));
        st.1 = Some(at);
    }

    fn stamp(&self, at: DateTime<Utc>) {
        self.0.lock().unwrap().1 = Some(at);
    }
}

impl QuoteSource for Tape {
    async fn fetch(&mut self, user: &str, stock: &str) -> Result<Quote, TradeError> {
        let st = self.0.lock().unwrap();
        let price = st.0.get(stock).copied().unwrap_or(Money::from_cents(10_00));
        Ok(Quote {
            stock: stock.to_string(),
            user_id: user.to_string(),
            price,
            timestamp: st.1.unwrap_or_else(Utc::now),
            cryptokey: "k".into(),
            txn: None,
        })
    }
}

#[derive(Debug, Clone)]
enum Op {
    Add(usize, i64),
    Quote(usize, usize, i64),
    Buy(usize, usize, i64),
    Sell(usize, usize, i64),
    Commit(usize, Side),
    Cancel(usize, Side),
    SetAmount(usize, usize, Side, i64),
    SetTrigger(usize, usize, Side, i64),
    CancelSet(usize, usize, Side),
    Wait(i64),
}

fn side() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

fn op() -> impl Strategy<Value = Op> {
    let user = 0..USERS.len();
    let stock = 0..STOCKS.len();
    let price = 1_00i64..60_00;
    let amount = 1_00i64..300_00;
    prop_oneof![
        (user.clone(), 1_00i64..500_00).prop_map(|(u, c)| Op::Add(u, c)),
        (user.clone(), stock.clone(), price.clone()).prop_map(|(u, s, p)| Op::Quote(u, s, p)),
        (user.clone(), stock.clone(), amount.clone()).prop_map(|(u, s, a)| Op::Buy(u, s, a)),
        (user.clone(), stock.clone(), amount.clone()).prop_map(|(u, s, a)| Op::Sell(u, s, a)),
        (user.clone(), side()).prop_map(|(u, d)| Op::Commit(u, d)),
        (user.clone(), side()).prop_map(|(u, d)| Op::Cancel(u, d)),
        (user.clone(), stock.clone(), side(), amount).prop_map(|(u, s, d, a)| Op::SetAmount(u, s, d, a)),
        (user.clone(), stock.clone(), side(), price).prop_map(|(u, s, d, p)| Op::SetTrigger(u, s, d, p)),
        (user, stock, side()).prop_map(|(u, s, d)| Op::CancelSet(u, s, d)),
        (0i64..=90).prop_map(Op::Wait),
    ]
}

fn side_name(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn line(id: usize, op: &Op) -> Option<String> {
    let m = |c: i64| Money::from_cents(c);
    let body = match op {
        Op::Add(u, c) => format!("ADD,{},{}", USERS[*u], m(*c)),
        Op::Quote(u, s, _) => format!("QUOTE,{},{}", USERS[*u], STOCKS[*s]),
        Op::Buy(u, s, a) => format!("BUY,{},{},{}", USERS[*u], STOCKS[*s], m(*a)),
        Op::Sell(u, s, a) => format!("SELL,{},{},{}", USERS[*u], STOCKS[*s], m(*a)),
        Op::Commit(u, d) => format!("COMMIT_{},{}", side_name(*d), USERS[*u]),
        Op::Cancel(u, d) => format!("CANCEL_{},{}", side_name(*d), USERS[*u]),
        Op::SetAmount(u, s, d, a) => format!("SET_{}_AMOUNT,{},{},{}", side_name(*d), USERS[*u], STOCKS[*s], m(*a)),
        Op::SetTrigger(u, s, d, p) => format!("SET_{}_TRIGGER,{},{},{}", side_name(*d), USERS[*u], STOCKS[*s], m(*p)),
        Op::CancelSet(u, s, d) => format!("CANCEL_SET_{},{},{}", side_name(*d), USERS[*u], STOCKS[*s]),
        Op::Wait(_) => return None,
    };
    Some(format!("[{id}] {body}"))
}

fn check_books(exec: &Executor<Tape>, step: &str) -> Result<(), TestCaseError> {
    let books = exec.accounts();

    // cash in == cash on books + cash that left as stock or was forfeited
    prop_assert_eq!(
        exec.cash_on_books() + books.forfeited_cash() + books.spent(),
        books.deposited() + books.sale_proceeds(),
        "cash after {}",
        step
    );

    for stock in STOCKS {
        let held: u64 = books.iter().map(|(_, a)| a.shares(stock)).sum();
        let queued: u64 = books
            .iter()
            .flat_map(|(_, a)| a.orders(Side::Sell).iter())
            .filter(|o| o.stock == stock)
            .map(|o| o.units)
            .sum();
        let reserved = exec.auto_requests(Side::Sell).reserved_shares(stock);
        prop_assert_eq!(
            held + queued + reserved + books.forfeited_shares(stock) + books.shares_sold(stock),
            books.shares_bought(stock),
            "{} shares after {}",
            stock,
            step
        );
    }
    Ok(())
}

async fn replay_ops(ops: Vec<Op>, cfg: ExecutorCfg) -> Result<(), TestCaseError> {
    let tape = Tape::default();
    let mut exec = Executor::new(tape.clone(), cfg, None);
    let mut now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

    for (i, op) in ops.iter().enumerate() {
        if let Op::Wait(secs) = op {
            now += Duration::seconds(*secs);
            continue;
        }
        if let Op::Quote(_, s, p) = op {
            tape.set(STOCKS[*s], *p, now);
        }
        tape.stamp(now);

        let Some(text) = line(i + 1, op) else { continue };
        let cmd = parse_line(&text).unwrap();
        // failures are fine; they just must not leak anything
        let _ = exec.execute(&cmd, now).await;
        check_books(&exec, &text)?;
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_sessions_conserve_cash_and_shares(
        ops in prop::collection::vec(op(), 1..80),
        refund in any::<bool>(),
        return_shares in any::<bool>(),
    ) {
        let cfg = ExecutorCfg {
            expired_orders: if refund { ExpiredOrderPolicy::Refund } else { ExpiredOrderPolicy::Discard },
            sell_cancel: if return_shares { SellCancelPolicy::ReturnShares } else { SellCancelPolicy::Forfeit },
            ..ExecutorCfg::default()
        };
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(replay_ops(ops, cfg))?;
    }
}

#[tokio::test]
async fn auto_requests_and_expiry_keep_books_balanced() {
    let ops = vec![
        Op::Add(0, 200_00),
        Op::Add(1, 100_00),
        Op::Quote(0, 0, 10_00),
        Op::Buy(0, 0, 100_00),
        Op::Commit(0, Side::Buy),
        Op::SetAmount(0, 0, Side::Sell, 40_00),
        Op::SetTrigger(0, 0, Side::Sell, 20_00),
        Op::SetAmount(1, 1, Side::Buy, 50_00),
        Op::SetAmount(1, 1, Side::Buy, 30_00),
        Op::SetTrigger(1, 1, Side::Buy, 10_00),
        Op::Quote(1, 0, 25_00),
        Op::Quote(0, 1, 9_00),
        Op::Sell(0, 0, 20_00),
        Op::Wait(61),
        Op::Commit(0, Side::Sell),
        Op::Buy(1, 0, 50_00),
        Op::Wait(61),
        Op::Commit(1, Side::Buy),
        Op::SetAmount(0, 1, Side::Buy, 10_00),
        Op::CancelSet(0, 1, Side::Buy),
        Op::SetAmount(0, 0, Side::Sell, 30_00),
        Op::SetTrigger(0, 0, Side::Sell, 50_00),
        Op::CancelSet(0, 0, Side::Sell),
    ];
    for sell_cancel in [SellCancelPolicy::Forfeit, SellCancelPolicy::ReturnShares] {
        let cfg = ExecutorCfg { sell_cancel, ..ExecutorCfg::default() };
        replay_ops(ops.clone(), cfg).await.unwrap();
    }
}
