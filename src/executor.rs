// ===============================
// src/executor.rs (command executor)
// ===============================
//
// One command at a time, fully applied (quote fetch and any auto-request
// cascade included) before the next one starts. The executor owns every
// store, so the replay loop is the single writer.
//
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::accounts::AccountStore;
use crate::autorequests::{AutoFill, AutoRequestStore, SellCancelPolicy};
use crate::currency::Money;
use crate::domain::{Action, AuditEvent, AutoRequest, Command, CommandKind, Quote, Side};
use crate::error::TradeError;
use crate::metrics::COMMANDS;
use crate::parser::parse_line;
use crate::quotes::{QuoteCache, QuoteSource};
use crate::recorder::RecorderMsg;

/// What COMMIT does with an order found past its validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExpiredOrderPolicy {
    /// Drop it; reserved cash/shares are booked as forfeited.
    #[default]
    Discard,
    /// Drop it and give the reservation back.
    Refund,
}

#[derive(Debug, Clone)]
pub struct ExecutorCfg {
    pub server: String,
    pub order_validity: Duration,
    pub quote_validity: Duration,
    pub expired_orders: ExpiredOrderPolicy,
    pub sell_cancel: SellCancelPolicy,
}

impl Default for ExecutorCfg {
    fn default() -> Self {
        Self {
            server: "UNKNOWN".into(),
            order_validity: Duration::seconds(60),
            quote_validity: Duration::seconds(60),
            expired_orders: ExpiredOrderPolicy::default(),
            sell_cancel: SellCancelPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub user: String,
    pub balance: Money,
    pub portfolio: Vec<(String, u64)>,
    pub buy_orders: Vec<Action>,
    pub sell_orders: Vec<Action>,
    pub auto_buys: Vec<AutoRequest>,
    pub auto_sells: Vec<AutoRequest>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Done,
    Quoted(Quote),
    Summary(Box<AccountSummary>),
    /// Unrecognized command kind; nothing was done.
    Ignored,
}

pub struct Executor<S> {
    cfg: ExecutorCfg,
    accounts: AccountStore,
    quotes: QuoteCache<S>,
    auto_buys: AutoRequestStore,
    auto_sells: AutoRequestStore,
    audit: Option<mpsc::Sender<RecorderMsg>>,
}

fn arg(cmd: &Command, i: usize) -> Result<&str, TradeError> {
    match cmd.args.get(i).map(|s| s.as_str()) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(TradeError::InvalidFormat(format!(
            "{} #{} is missing argument {}",
            cmd.kind,
            cmd.id,
            i + 1
        ))),
    }
}

fn money_arg(cmd: &Command, i: usize) -> Result<Money, TradeError> {
    Money::parse(arg(cmd, i)?)
}

impl<S: QuoteSource> Executor<S> {
    pub fn new(source: S, cfg: ExecutorCfg, audit: Option<mpsc::Sender<RecorderMsg>>) -> Self {
        Self {
            quotes: QuoteCache::new(source, cfg.quote_validity),
            accounts: AccountStore::new(),
            auto_buys: AutoRequestStore::new(Side::Buy),
            auto_sells: AutoRequestStore::new(Side::Sell).with_sell_cancel(cfg.sell_cancel),
            audit,
            cfg,
        }
    }

    pub fn accounts(&self) -> &AccountStore { &self.accounts }

    pub fn auto_requests(&self, side: Side) -> &AutoRequestStore {
        match side { Side::Buy => &self.auto_buys, Side::Sell => &self.auto_sells }
    }

    pub fn quotes(&self) -> &QuoteCache<S> { &self.quotes }

    /// Cash still inside the system: balances, buy reservations and buy
    /// auto-request reservations.
    pub fn cash_on_books(&self) -> Money {
        self.accounts.cash_on_books() + self.auto_buys.reserved_cash()
    }

    /// Apply one command. Failures are audited and returned; the caller logs
    /// them and moves on.
    pub async fn execute(&mut self, cmd: &Command, now: DateTime<Utc>) -> Result<Outcome, TradeError> {
        self.audit_command(cmd, now).await;

        let result = self.dispatch(cmd, now).await;
        let label = match &result {
            Ok(Outcome::Ignored) => "ignored",
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        COMMANDS.with_label_values(&[cmd.kind.name(), label]).inc();

        if let Err(e) = &result {
            self.record(AuditEvent::ErrorEvent {
                timestamp_ms: now.timestamp_millis(),
                server: self.cfg.server.clone(),
                transaction_num: cmd.id,
                command: cmd.kind.to_string(),
                username: (!cmd.user_id.is_empty()).then(|| cmd.user_id.clone()),
                error_message: e.to_string(),
            })
            .await;
        }
        result
    }

    async fn dispatch(&mut self, cmd: &Command, now: DateTime<Utc>) -> Result<Outcome, TradeError> {
        let user = cmd.user_id.as_str();
        match &cmd.kind {
            CommandKind::Add => {
                let amount = money_arg(cmd, 0)?;
                self.accounts.deposit(user, amount)?;
                debug!(%user, %amount, "funds added");
                Ok(Outcome::Done)
            }
            CommandKind::Quote => {
                self.accounts.get(user)?;
                let stock = arg(cmd, 0)?;
                let quote = self.quote(cmd.id, user, stock, now).await?;
                info!(%user, %stock, price = %quote.price, "quote");
                Ok(Outcome::Quoted(quote))
            }
            CommandKind::Buy => self.buy(cmd, now).await,
            CommandKind::Sell => self.sell(cmd, now).await,
            CommandKind::CommitBuy => self.commit(user, Side::Buy, now),
            CommandKind::CommitSell => self.commit(user, Side::Sell, now),
            CommandKind::CancelBuy => self.cancel(user, Side::Buy),
            CommandKind::CancelSell => self.cancel(user, Side::Sell),
            CommandKind::SetBuyAmount => {
                let (stock, amount) = (arg(cmd, 0)?, money_arg(cmd, 1)?);
                self.auto_buys.set_amount(&mut self.accounts, stock, user, amount)?;
                Ok(Outcome::Done)
            }
            CommandKind::SetSellAmount => {
                let (stock, amount) = (arg(cmd, 0)?, money_arg(cmd, 1)?);
                self.auto_sells.set_amount(&mut self.accounts, stock, user, amount)?;
                Ok(Outcome::Done)
            }
            CommandKind::SetBuyTrigger => {
                let (stock, price) = (arg(cmd, 0)?, money_arg(cmd, 1)?);
                self.auto_buys.set_trigger(&mut self.accounts, stock, user, price)?;
                Ok(Outcome::Done)
            }
            CommandKind::SetSellTrigger => {
                let (stock, price) = (arg(cmd, 0)?, money_arg(cmd, 1)?);
                self.auto_sells.set_trigger(&mut self.accounts, stock, user, price)?;
                Ok(Outcome::Done)
            }
            CommandKind::CancelSetBuy => {
                let stock = arg(cmd, 0)?;
                let refund = self.auto_buys.cancel(&mut self.accounts, stock, user)?;
                debug!(%user, %stock, %refund, "buy auto-request cancelled");
                Ok(Outcome::Done)
            }
            CommandKind::CancelSetSell => {
                let stock = arg(cmd, 0)?;
                self.auto_sells.cancel(&mut self.accounts, stock, user)?;
                Ok(Outcome::Done)
            }
            CommandKind::DisplaySummary => Ok(Outcome::Summary(Box::new(self.summary(user)?))),
            CommandKind::DumpLog => {
                let path = arg(cmd, 0)?.to_string();
                let user = if user.is_empty() {
                    None
                } else {
                    self.accounts.get(user)?;
                    Some(user.to_string())
                };
                if self.audit.is_none() {
                    warn!(file = %path, "dumplog requested but audit recording is off");
                }
                self.send(RecorderMsg::Dump { user, path }).await;
                Ok(Outcome::Done)
            }
            CommandKind::Unknown(name) => {
                warn!(id = cmd.id, command = %name, "unrecognized command, skipped");
                Ok(Outcome::Ignored)
            }
        }
    }

    async fn buy(&mut self, cmd: &Command, now: DateTime<Utc>) -> Result<Outcome, TradeError> {
        let user = cmd.user_id.as_str();
        self.accounts.get(user)?;
        let (stock, amount) = (arg(cmd, 0)?, money_arg(cmd, 1)?);
        if !amount.is_positive() {
            return Err(TradeError::InvalidAmount(amount));
        }

        let quote = self.quote(cmd.id, user, stock, now).await?;
        let (units, _) = amount.fits_into(quote.price)?;
        if units == 0 {
            info!(%user, %stock, %amount, price = %quote.price, "amount buys no whole share");
            return Ok(Outcome::Done);
        }

        self.accounts.withdraw(user, quote.price * units)?;
        self.accounts.push_order(user, Side::Buy, stock, units, quote.price, now)?;
        debug!(%user, %stock, units, price = %quote.price, "buy reserved");
        Ok(Outcome::Done)
    }

    async fn sell(&mut self, cmd: &Command, now: DateTime<Utc>) -> Result<Outcome, TradeError> {
        let user = cmd.user_id.as_str();
        let (stock, amount) = (arg(cmd, 0)?, money_arg(cmd, 1)?);
        let held = self.accounts.get(user)?.shares(stock);
        if held == 0 {
            return Err(TradeError::InsufficientShares { stock: stock.to_string(), required: 1, held });
        }
        if !amount.is_positive() {
            return Err(TradeError::InvalidAmount(amount));
        }

        let quote = self.quote(cmd.id, user, stock, now).await?;
        let (units, _) = amount.fits_into(quote.price)?;
        if units == 0 {
            info!(%user, %stock, %amount, price = %quote.price, "amount sells no whole share");
            return Ok(Outcome::Done);
        }

        self.accounts.remove_shares(user, stock, units)?;
        self.accounts.push_order(user, Side::Sell, stock, units, quote.price, now)?;
        debug!(%user, %stock, units, price = %quote.price, "sell reserved");
        Ok(Outcome::Done)
    }

    fn commit(&mut self, user: &str, side: Side, now: DateTime<Utc>) -> Result<Outcome, TradeError> {
        let action = self
            .accounts
            .pop_newest_order(user, side)?
            .ok_or(TradeError::NoActiveOrder { side })?;

        if action.is_expired(now, self.cfg.order_validity) {
            self.expire(user, side, &action)?;
            return Err(TradeError::NoActiveOrder { side });
        }

        match side {
            Side::Buy => self.accounts.settle_buy(user, &action.stock, action.units, action.value())?,
            Side::Sell => self.accounts.settle_sell(user, &action.stock, action.units, action.value())?,
        }
        info!(%user, %side, stock = %action.stock, units = action.units, price = %action.unit_price, "order committed");
        Ok(Outcome::Done)
    }

    fn cancel(&mut self, user: &str, side: Side) -> Result<Outcome, TradeError> {
        let action = self
            .accounts
            .pop_newest_order(user, side)?
            .ok_or(TradeError::NoActiveOrder { side })?;
        self.release(user, side, &action)?;
        debug!(%user, %side, stock = %action.stock, units = action.units, "order cancelled");
        Ok(Outcome::Done)
    }

    /// Give a reservation back to the account.
    fn release(&mut self, user: &str, side: Side, action: &Action) -> Result<(), TradeError> {
        match side {
            Side::Buy => self.accounts.get_mut(user)?.deposit(action.value()),
            Side::Sell => self.accounts.add_shares(user, &action.stock, action.units),
        }
    }

    fn expire(&mut self, user: &str, side: Side, action: &Action) -> Result<(), TradeError> {
        match self.cfg.expired_orders {
            ExpiredOrderPolicy::Discard => {
                warn!(%user, %side, stock = %action.stock, units = action.units, "expired order discarded");
                self.accounts.forfeit(side, action);
                Ok(())
            }
            ExpiredOrderPolicy::Refund => {
                info!(%user, %side, stock = %action.stock, units = action.units, "expired order refunded");
                self.release(user, side, action)
            }
        }
    }

    /// Cached-or-fetched quote. A fetch is audited and, when the quote is
    /// fresh, runs the auto-requests on that stock before returning.
    async fn quote(&mut self, txn: u64, user: &str, stock: &str, now: DateTime<Utc>) -> Result<Quote, TradeError> {
        let lookup = self.quotes.get_quote(user, stock, Some(txn), now).await?;
        if !lookup.fetched {
            return Ok(lookup.quote);
        }

        let q = lookup.quote;
        self.record(AuditEvent::QuoteServer {
            timestamp_ms: now.timestamp_millis(),
            server: self.cfg.server.clone(),
            transaction_num: txn,
            price: q.price,
            stock_symbol: q.stock.clone(),
            username: q.user_id.clone(),
            quote_server_time: q.timestamp.timestamp_millis(),
            cryptokey: q.cryptokey.clone(),
        })
        .await;

        if q.is_fresh(now, self.quotes.validity()) {
            let fills = self.match_auto(stock, q.price);
            if !fills.is_empty() {
                debug!(%stock, price = %q.price, fills = fills.len(), "auto-requests filled");
            }
        } else {
            warn!(%stock, quoted_at = %q.timestamp, "quote server returned a stale quote");
        }
        Ok(q)
    }

    fn match_auto(&mut self, stock: &str, price: Money) -> Vec<AutoFill> {
        let mut fills = self.auto_buys.on_fresh_quote(&mut self.accounts, stock, price);
        fills.extend(self.auto_sells.on_fresh_quote(&mut self.accounts, stock, price));
        fills
    }

    pub fn summary(&self, user: &str) -> Result<AccountSummary, TradeError> {
        let account = self.accounts.get(user)?;
        let mut portfolio: Vec<(String, u64)> =
            account.portfolio().map(|(s, n)| (s.to_string(), n)).collect();
        portfolio.sort();
        let sorted = |store: &AutoRequestStore| {
            let mut v: Vec<AutoRequest> = store.for_user(user).cloned().collect();
            v.sort_by(|a, b| a.stock.cmp(&b.stock));
            v
        };
        Ok(AccountSummary {
            user: user.to_string(),
            balance: account.balance(),
            portfolio,
            buy_orders: account.orders(Side::Buy).iter().cloned().collect(),
            sell_orders: account.orders(Side::Sell).iter().cloned().collect(),
            auto_buys: sorted(&self.auto_buys),
            auto_sells: sorted(&self.auto_sells),
        })
    }

    async fn audit_command(&self, cmd: &Command, now: DateTime<Utc>) {
        let opt = |i: usize| cmd.args.get(i).cloned();
        let (stock_symbol, funds, filename) = match cmd.kind {
            CommandKind::Add => (None, opt(0), None),
            CommandKind::Quote | CommandKind::CancelSetBuy | CommandKind::CancelSetSell => (opt(0), None, None),
            CommandKind::Buy
            | CommandKind::Sell
            | CommandKind::SetBuyAmount
            | CommandKind::SetBuyTrigger
            | CommandKind::SetSellAmount
            | CommandKind::SetSellTrigger => (opt(0), opt(1), None),
            CommandKind::DumpLog => (None, None, opt(0)),
            _ => (None, None, None),
        };
        self.record(AuditEvent::UserCommand {
            timestamp_ms: now.timestamp_millis(),
            server: self.cfg.server.clone(),
            transaction_num: cmd.id,
            command: cmd.kind.to_string(),
            username: (!cmd.user_id.is_empty()).then(|| cmd.user_id.clone()),
            stock_symbol,
            filename,
            funds,
        })
        .await;
    }

    async fn record(&self, ev: AuditEvent) {
        self.send(RecorderMsg::Event(ev)).await;
    }

    async fn send(&self, msg: RecorderMsg) {
        if let Some(tx) = &self.audit {
            if tx.send(msg).await.is_err() {
                warn!("audit recorder is gone, event dropped");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub processed: u64,
    pub failed: u64,
    pub ignored: u64,
}

/// Run every line of a workload through `exec`, in order. Bad lines and
/// failed commands are logged and skipped; only a read error stops the
/// replay.
pub async fn replay<S, R>(exec: &mut Executor<S>, reader: R) -> std::io::Result<ReplayStats>
where
    S: QuoteSource,
    R: AsyncBufRead + Unpin,
{
    let mut stats = ReplayStats::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        stats.processed += 1;

        let cmd = match parse_line(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(?e, "skipping unparseable line");
                stats.failed += 1;
                continue;
            }
        };
        debug!(?cmd, "parsed");

        match exec.execute(&cmd, Utc::now()).await {
            Ok(Outcome::Ignored) => stats.ignored += 1,
            Ok(Outcome::Summary(s)) => info!(id = cmd.id, summary = ?s, "display summary"),
            Ok(_) => debug!(id = cmd.id, command = %cmd.kind, "finished command"),
            Err(e) => {
                stats.failed += 1;
                warn!(id = cmd.id, command = %cmd.kind, user = %cmd.user_id, error = %e, "command failed");
            }
        }
    }
    Ok(stats)
}
