// ===============================
// src/accounts.rs (ledger + order queues)
// ===============================
//
// Balance, portfolio and the two reservation queues per user. All guards run
// before the mutation so a failed call leaves the account untouched.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::debug;

use crate::currency::Money;
use crate::domain::{Action, Side};
use crate::error::TradeError;
use crate::metrics::ACCOUNTS;

/// Reservations of one side. Commit/cancel always take the newest entry.
#[derive(Debug, Clone, Default)]
pub struct OrderQueue {
    actions: VecDeque<Action>,
}

impl OrderQueue {
    pub fn push(&mut self, action: Action) { self.actions.push_back(action); }

    pub fn pop_newest(&mut self) -> Option<Action> { self.actions.pop_back() }

    pub fn len(&self) -> usize { self.actions.len() }

    pub fn is_empty(&self) -> bool { self.actions.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &Action> { self.actions.iter() }
}

#[derive(Debug, Clone, Default)]
pub struct Account {
    balance: Money,
    portfolio: HashMap<String, u64>,
    buys: OrderQueue,
    sells: OrderQueue,
}

impl Account {
    pub fn balance(&self) -> Money { self.balance }

    pub fn shares(&self, stock: &str) -> u64 {
        self.portfolio.get(stock).copied().unwrap_or(0)
    }

    pub fn portfolio(&self) -> impl Iterator<Item = (&str, u64)> {
        self.portfolio.iter().map(|(s, n)| (s.as_str(), *n))
    }

    pub fn orders(&self, side: Side) -> &OrderQueue {
        match side { Side::Buy => &self.buys, Side::Sell => &self.sells }
    }

    fn orders_mut(&mut self, side: Side) -> &mut OrderQueue {
        match side { Side::Buy => &mut self.buys, Side::Sell => &mut self.sells }
    }

    pub fn deposit(&mut self, amount: Money) -> Result<(), TradeError> {
        if !amount.is_positive() {
            return Err(TradeError::InvalidAmount(amount));
        }
        self.balance = self.balance.checked_add(amount)?;
        Ok(())
    }

    pub fn withdraw(&mut self, amount: Money) -> Result<(), TradeError> {
        if amount.cents() < 0 {
            return Err(TradeError::InvalidAmount(amount));
        }
        self.balance = self.balance.checked_sub(amount)?;
        Ok(())
    }

    pub fn add_shares(&mut self, stock: &str, units: u64) {
        if units == 0 {
            return;
        }
        *self.portfolio.entry(stock.to_string()).or_insert(0) += units;
    }

    /// All or nothing: no partial removal when `units > held`.
    pub fn remove_shares(&mut self, stock: &str, units: u64) -> Result<(), TradeError> {
        let held = self.shares(stock);
        if units > held {
            return Err(TradeError::InsufficientShares { stock: stock.to_string(), required: units, held });
        }
        if units == held {
            self.portfolio.remove(stock);
        } else if let Some(n) = self.portfolio.get_mut(stock) {
            *n -= units;
        }
        Ok(())
    }
}

/// All accounts, keyed by user id. Also keeps running totals of cash and
/// shares entering or leaving the books (deposits, settled trades, forfeits)
/// so conservation can be audited.
#[derive(Debug, Default)]
pub struct AccountStore {
    accounts: HashMap<String, Account>,
    deposited: Money,
    spent: Money,
    sale_proceeds: Money,
    forfeited_cash: Money,
    shares_bought: HashMap<String, u64>,
    shares_sold: HashMap<String, u64>,
    forfeited_shares: HashMap<String, u64>,
}

impl AccountStore {
    pub fn new() -> Self { Self::default() }

    pub fn has_account(&self, user: &str) -> bool { self.accounts.contains_key(user) }

    pub fn len(&self) -> usize { self.accounts.len() }

    pub fn is_empty(&self) -> bool { self.accounts.is_empty() }

    pub fn create_account(&mut self, user: &str) -> Result<(), TradeError> {
        if user.is_empty() {
            return Err(TradeError::InvalidFormat("empty user id".into()));
        }
        if self.has_account(user) {
            return Err(TradeError::AlreadyExists { user: user.to_string() });
        }
        self.accounts.insert(user.to_string(), Account::default());
        ACCOUNTS.set(self.accounts.len() as i64);
        debug!(%user, "account created");
        Ok(())
    }

    pub fn get(&self, user: &str) -> Result<&Account, TradeError> {
        self.accounts.get(user).ok_or_else(|| TradeError::NoSuchAccount { user: user.to_string() })
    }

    pub fn get_mut(&mut self, user: &str) -> Result<&mut Account, TradeError> {
        self.accounts.get_mut(user).ok_or_else(|| TradeError::NoSuchAccount { user: user.to_string() })
    }

    /// Credits `amount`, creating the account on first deposit.
    pub fn deposit(&mut self, user: &str, amount: Money) -> Result<(), TradeError> {
        if !amount.is_positive() {
            return Err(TradeError::InvalidAmount(amount));
        }
        let deposited = self.deposited.checked_add(amount)?;
        if let Some(account) = self.accounts.get(user) {
            account.balance.checked_add(amount)?;
        }
        if !self.has_account(user) {
            self.create_account(user)?;
        }
        self.get_mut(user)?.deposit(amount)?;
        self.deposited = deposited;
        Ok(())
    }

    pub fn withdraw(&mut self, user: &str, amount: Money) -> Result<(), TradeError> {
        self.get_mut(user)?.withdraw(amount)
    }

    pub fn add_shares(&mut self, user: &str, stock: &str, units: u64) -> Result<(), TradeError> {
        self.get_mut(user)?.add_shares(stock, units);
        Ok(())
    }

    pub fn remove_shares(&mut self, user: &str, stock: &str, units: u64) -> Result<(), TradeError> {
        self.get_mut(user)?.remove_shares(stock, units)
    }

    pub fn push_order(
        &mut self,
        user: &str,
        side: Side,
        stock: &str,
        units: u64,
        unit_price: Money,
        now: DateTime<Utc>,
    ) -> Result<(), TradeError> {
        let action = Action { stock: stock.to_string(), units, unit_price, created: now };
        self.get_mut(user)?.orders_mut(side).push(action);
        Ok(())
    }

    /// Removes the most recently pushed order of `side`, if any.
    pub fn pop_newest_order(&mut self, user: &str, side: Side) -> Result<Option<Action>, TradeError> {
        Ok(self.get_mut(user)?.orders_mut(side).pop_newest())
    }

    /// Delivers bought shares. `cost` is cash already taken from the
    /// balance or a reservation.
    pub fn settle_buy(&mut self, user: &str, stock: &str, units: u64, cost: Money) -> Result<(), TradeError> {
        self.get_mut(user)?.add_shares(stock, units);
        self.spent += cost;
        *self.shares_bought.entry(stock.to_string()).or_insert(0) += units;
        Ok(())
    }

    /// Credits the proceeds of shares already taken out of the portfolio.
    pub fn settle_sell(&mut self, user: &str, stock: &str, units: u64, proceeds: Money) -> Result<(), TradeError> {
        self.get_mut(user)?.deposit(proceeds)?;
        self.sale_proceeds += proceeds;
        *self.shares_sold.entry(stock.to_string()).or_insert(0) += units;
        Ok(())
    }

    /// Books a reservation that left the system without being returned.
    pub fn forfeit(&mut self, side: Side, action: &Action) {
        match side {
            Side::Buy => self.forfeited_cash += action.value(),
            Side::Sell => self.forfeit_shares(&action.stock, action.units),
        }
    }

    pub fn forfeit_shares(&mut self, stock: &str, units: u64) {
        *self.forfeited_shares.entry(stock.to_string()).or_insert(0) += units;
    }

    pub fn deposited(&self) -> Money { self.deposited }

    pub fn forfeited_cash(&self) -> Money { self.forfeited_cash }

    pub fn spent(&self) -> Money { self.spent }

    pub fn sale_proceeds(&self) -> Money { self.sale_proceeds }

    pub fn shares_bought(&self, stock: &str) -> u64 {
        self.shares_bought.get(stock).copied().unwrap_or(0)
    }

    pub fn shares_sold(&self, stock: &str) -> u64 {
        self.shares_sold.get(stock).copied().unwrap_or(0)
    }

    pub fn forfeited_shares(&self, stock: &str) -> u64 {
        self.forfeited_shares.get(stock).copied().unwrap_or(0)
    }

    /// Balances plus cash still parked in buy reservations.
    pub fn cash_on_books(&self) -> Money {
        self.accounts
            .values()
            .map(|a| a.balance + a.buys.iter().map(Action::value).sum::<Money>())
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Account)> {
        self.accounts.iter().map(|(u, a)| (u.as_str(), a))
    }
}
