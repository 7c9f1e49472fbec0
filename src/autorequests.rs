// ===============================
// src/autorequests.rs
// ===============================
//
// Standing conditional orders, one store per side, keyed stock -> user.
//
// Buy : SET_BUY_AMOUNT reserves cash immediately. SET_BUY_TRIGGER arms it.
//       Fires when a fresh price <= trigger: whole shares go to the
//       portfolio, the leftover cash goes back to the balance.
// Sell: SET_SELL_AMOUNT only records the dollar amount. SET_SELL_TRIGGER
//       pulls floor(amount / trigger) shares out of the portfolio. Fires when
//       a fresh price >= trigger: floor(amount / price) of the reserved
//       shares are sold at that price, the rest go back to the portfolio.
//
use ahash::AHashMap as HashMap;
use tracing::{info, warn};

use crate::accounts::AccountStore;
use crate::currency::Money;
use crate::domain::{AutoRequest, Side};
use crate::error::TradeError;
use crate::metrics::AUTO_FIRED;

/// What happens to reserved shares when a sell auto-request is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SellCancelPolicy {
    /// Shares go back to the portfolio.
    ReturnShares,
    /// Reserved shares are written off and booked as forfeited.
    #[default]
    Forfeit,
}

/// One executed auto-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoFill {
    pub side: Side,
    pub user_id: String,
    pub stock: String,
    pub units: u64,
    pub price: Money,
    /// Buy: leftover cash refunded. Sell: proceeds credited.
    pub cash: Money,
}

#[derive(Debug)]
pub struct AutoRequestStore {
    side: Side,
    sell_cancel: SellCancelPolicy,
    requests: HashMap<String, HashMap<String, AutoRequest>>,
}

impl AutoRequestStore {
    pub fn new(side: Side) -> Self {
        Self { side, sell_cancel: SellCancelPolicy::default(), requests: HashMap::new() }
    }

    pub fn with_sell_cancel(mut self, policy: SellCancelPolicy) -> Self {
        self.sell_cancel = policy;
        self
    }

    pub fn side(&self) -> Side { self.side }

    pub fn get(&self, stock: &str, user: &str) -> Option<&AutoRequest> {
        self.requests.get(stock).and_then(|m| m.get(user))
    }

    pub fn for_user<'a>(&'a self, user: &'a str) -> impl Iterator<Item = &'a AutoRequest> + 'a {
        self.requests.values().filter_map(move |m| m.get(user))
    }

    /// Cash parked in buy requests (zero for the sell store).
    pub fn reserved_cash(&self) -> Money {
        match self.side {
            Side::Buy => self.requests.values().flat_map(|m| m.values()).map(|r| r.amount).sum(),
            Side::Sell => Money::ZERO,
        }
    }

    pub fn reserved_shares(&self, stock: &str) -> u64 {
        self.requests.get(stock).map(|m| m.values().map(|r| r.reserved_shares).sum()).unwrap_or(0)
    }

    fn remove(&mut self, stock: &str, user: &str) -> Option<AutoRequest> {
        let users = self.requests.get_mut(stock)?;
        let req = users.remove(user);
        if users.is_empty() {
            self.requests.remove(stock);
        }
        req
    }

    /// Create or overwrite the pending request's amount. Overwriting
    /// releases whatever the previous request had reserved.
    pub fn set_amount(
        &mut self,
        accounts: &mut AccountStore,
        stock: &str,
        user: &str,
        amount: Money,
    ) -> Result<(), TradeError> {
        if !amount.is_positive() {
            return Err(TradeError::InvalidAmount(amount));
        }
        let account = accounts.get_mut(user)?;
        let previous = self.get(stock, user).cloned();

        match self.side {
            Side::Buy => {
                let prior = previous.as_ref().map(|r| r.amount).unwrap_or(Money::ZERO);
                let available = account.balance() + prior;
                if amount > available {
                    return Err(TradeError::InsufficientFunds { required: amount, available });
                }
                if prior.is_positive() {
                    account.deposit(prior)?;
                }
                account.withdraw(amount)?;
            }
            Side::Sell => {
                if let Some(prev) = &previous {
                    account.add_shares(stock, prev.reserved_shares);
                }
            }
        }

        self.requests.entry(stock.to_string()).or_default().insert(
            user.to_string(),
            AutoRequest {
                stock: stock.to_string(),
                user_id: user.to_string(),
                amount,
                trigger: None,
                reserved_shares: 0,
            },
        );
        Ok(())
    }

    /// Arm a pending request at `price`.
    pub fn set_trigger(
        &mut self,
        accounts: &mut AccountStore,
        stock: &str,
        user: &str,
        price: Money,
    ) -> Result<(), TradeError> {
        if !price.is_positive() {
            return Err(TradeError::InvalidAmount(price));
        }
        let account = accounts.get_mut(user)?;
        let side = self.side;
        let req = self
            .requests
            .get_mut(stock)
            .and_then(|m| m.get_mut(user))
            .ok_or_else(|| TradeError::NoPendingRequest { stock: stock.to_string(), side })?;

        let (units, _) = req.amount.fits_into(price)?;
        if units == 0 {
            return Err(TradeError::InvalidAmount(req.amount));
        }

        if side == Side::Sell {
            let held = account.shares(stock) + req.reserved_shares;
            if units > held {
                return Err(TradeError::InsufficientShares { stock: stock.to_string(), required: units, held });
            }
            account.add_shares(stock, req.reserved_shares);
            account.remove_shares(stock, units)?;
            req.reserved_shares = units;
        }
        req.trigger = Some(price);
        Ok(())
    }

    /// Drop the pending request, returning the cash refunded to the balance
    /// (always zero on the sell side).
    pub fn cancel(
        &mut self,
        accounts: &mut AccountStore,
        stock: &str,
        user: &str,
    ) -> Result<Money, TradeError> {
        accounts.get(user)?;
        let req = self
            .remove(stock, user)
            .ok_or_else(|| TradeError::NoPendingRequest { stock: stock.to_string(), side: self.side })?;

        match self.side {
            Side::Buy => {
                if req.amount.is_positive() {
                    accounts.get_mut(user)?.deposit(req.amount)?;
                }
                Ok(req.amount)
            }
            Side::Sell => {
                match self.sell_cancel {
                    SellCancelPolicy::ReturnShares => {
                        accounts.add_shares(user, stock, req.reserved_shares)?;
                    }
                    SellCancelPolicy::Forfeit => {
                        if req.reserved_shares > 0 {
                            warn!(%user, %stock, shares = req.reserved_shares, "sell auto-request cancelled, reserved shares forfeited");
                            accounts.forfeit_shares(stock, req.reserved_shares);
                        }
                    }
                }
                Ok(Money::ZERO)
            }
        }
    }

    /// Run every armed request on `stock` against a fresh `price`.
    pub fn on_fresh_quote(
        &mut self,
        accounts: &mut AccountStore,
        stock: &str,
        price: Money,
    ) -> Vec<AutoFill> {
        let Some(users) = self.requests.get(stock) else { return Vec::new() };
        let mut candidates: Vec<String> = users
            .values()
            .filter(|r| match (self.side, r.trigger) {
                (_, None) => false,
                (Side::Buy, Some(t)) => price <= t,
                (Side::Sell, Some(t)) => price >= t,
            })
            .map(|r| r.user_id.clone())
            .collect();
        candidates.sort();

        let mut fills = Vec::new();
        for user in candidates {
            match self.fire(accounts, stock, &user, price) {
                Ok(Some(fill)) => {
                    AUTO_FIRED.with_label_values(&[&self.side.to_string()]).inc();
                    info!(side = %fill.side, user = %fill.user_id, stock = %fill.stock, units = fill.units, price = %fill.price, "auto-request fired");
                    fills.push(fill);
                }
                Ok(None) => {}
                Err(e) => warn!(%user, %stock, ?e, "auto-request left pending"),
            }
        }
        fills
    }

    fn fire(
        &mut self,
        accounts: &mut AccountStore,
        stock: &str,
        user: &str,
        price: Money,
    ) -> Result<Option<AutoFill>, TradeError> {
        let Some(req) = self.get(stock, user).cloned() else { return Ok(None) };
        accounts.get(user)?;

        let fill = match self.side {
            Side::Buy => {
                let (units, rem) = req.amount.fits_into(price)?;
                if units == 0 {
                    return Ok(None);
                }
                if rem.is_positive() {
                    accounts.get_mut(user)?.deposit(rem)?;
                }
                accounts.settle_buy(user, stock, units, price * units)?;
                AutoFill { side: Side::Buy, user_id: user.to_string(), stock: stock.to_string(), units, price, cash: rem }
            }
            Side::Sell => {
                // sized against the dollar amount at the fresh price; the
                // reservation was sized at the trigger, so it never falls short
                let (units, _) = req.amount.fits_into(price)?;
                let units = units.min(req.reserved_shares);
                if units == 0 {
                    return Ok(None);
                }
                let proceeds = price * units;
                accounts.settle_sell(user, stock, units, proceeds)?;
                accounts.add_shares(user, stock, req.reserved_shares - units)?;
                AutoFill { side: Side::Sell, user_id: user.to_string(), stock: stock.to_string(), units, price, cash: proceeds }
            }
        };
        self.remove(stock, user);
        Ok(Some(fill))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cents(c: i64) -> Money { Money::from_cents(c) }

    fn funded(user: &str, amount: i64) -> AccountStore {
        let mut accounts = AccountStore::new();
        accounts.deposit(user, cents(amount)).unwrap();
        accounts
    }

    #[test]
    fn buy_fires_and_refunds_remainder() {
        let mut accounts = funded("alice", 100_00);
        let mut buys = AutoRequestStore::new(Side::Buy);

        buys.set_amount(&mut accounts, "XYZ", "alice", cents(50_00)).unwrap();
        assert_eq!(accounts.get("alice").unwrap().balance(), cents(50_00));
        buys.set_trigger(&mut accounts, "XYZ", "alice", cents(10_00)).unwrap();

        let fills = buys.on_fresh_quote(&mut accounts, "XYZ", cents(9_00));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].units, 5);
        assert_eq!(fills[0].cash, cents(5_00));

        let alice = accounts.get("alice").unwrap();
        assert_eq!(alice.shares("XYZ"), 5);
        assert_eq!(alice.balance(), cents(55_00));
        assert!(buys.get("XYZ", "alice").is_none());
    }

    #[test]
    fn buy_waits_for_price_at_or_below_trigger() {
        let mut accounts = funded("alice", 100_00);
        let mut buys = AutoRequestStore::new(Side::Buy);
        buys.set_amount(&mut accounts, "XYZ", "alice", cents(50_00)).unwrap();

        // unarmed never fires
        assert!(buys.on_fresh_quote(&mut accounts, "XYZ", cents(1_00)).is_empty());

        buys.set_trigger(&mut accounts, "XYZ", "alice", cents(10_00)).unwrap();
        assert!(buys.on_fresh_quote(&mut accounts, "XYZ", cents(10_01)).is_empty());
        assert!(buys.get("XYZ", "alice").is_some());
        assert_eq!(buys.on_fresh_quote(&mut accounts, "XYZ", cents(10_00)).len(), 1);
    }

    #[test]
    fn buy_amount_needs_funds_and_overwrite_releases() {
        let mut accounts = funded("alice", 60_00);
        let mut buys = AutoRequestStore::new(Side::Buy);

        assert!(matches!(
            buys.set_amount(&mut accounts, "XYZ", "alice", cents(70_00)),
            Err(TradeError::InsufficientFunds { .. })
        ));
        buys.set_amount(&mut accounts, "XYZ", "alice", cents(50_00)).unwrap();
        // 10 left + 50 released covers 60
        buys.set_amount(&mut accounts, "XYZ", "alice", cents(60_00)).unwrap();
        assert_eq!(accounts.get("alice").unwrap().balance(), Money::ZERO);
        assert_eq!(buys.reserved_cash(), cents(60_00));
    }

    #[test]
    fn trigger_without_amount_fails() {
        let mut accounts = funded("alice", 10_00);
        let mut buys = AutoRequestStore::new(Side::Buy);
        assert!(matches!(
            buys.set_trigger(&mut accounts, "XYZ", "alice", cents(1_00)),
            Err(TradeError::NoPendingRequest { .. })
        ));
    }

    #[test]
    fn buy_cancel_refunds_reservation() {
        let mut accounts = funded("alice", 100_00);
        let mut buys = AutoRequestStore::new(Side::Buy);
        buys.set_amount(&mut accounts, "XYZ", "alice", cents(40_00)).unwrap();

        let refund = buys.cancel(&mut accounts, "XYZ", "alice").unwrap();
        assert_eq!(refund, cents(40_00));
        assert_eq!(accounts.get("alice").unwrap().balance(), cents(100_00));
        assert!(buys.cancel(&mut accounts, "XYZ", "alice").is_err());
    }

    #[test]
    fn sell_reserves_on_trigger_and_credits_on_fire() {
        let mut accounts = funded("bob", 1_00);
        accounts.add_shares("bob", "ABC", 10).unwrap();
        let mut sells = AutoRequestStore::new(Side::Sell);

        sells.set_amount(&mut accounts, "ABC", "bob", cents(100_00)).unwrap();
        assert_eq!(accounts.get("bob").unwrap().shares("ABC"), 10);

        sells.set_trigger(&mut accounts, "ABC", "bob", cents(30_00)).unwrap();
        assert_eq!(accounts.get("bob").unwrap().shares("ABC"), 7);
        assert_eq!(sells.reserved_shares("ABC"), 3);

        assert!(sells.on_fresh_quote(&mut accounts, "ABC", cents(29_99)).is_empty());
        let fills = sells.on_fresh_quote(&mut accounts, "ABC", cents(31_00));
        assert_eq!(fills[0].units, 3);
        assert_eq!(fills[0].cash, cents(93_00));

        let bob = accounts.get("bob").unwrap();
        assert_eq!(bob.shares("ABC"), 7);
        assert_eq!(bob.balance(), cents(94_00));
    }

    #[test]
    fn sell_fill_never_exceeds_amount() {
        let mut accounts = funded("bob", 1_00);
        accounts.add_shares("bob", "ABC", 10).unwrap();
        let mut sells = AutoRequestStore::new(Side::Sell);
        sells.set_amount(&mut accounts, "ABC", "bob", cents(40_00)).unwrap();
        sells.set_trigger(&mut accounts, "ABC", "bob", cents(20_00)).unwrap();
        assert_eq!(sells.reserved_shares("ABC"), 2);

        // 40.00 at 25.00 covers one share; the other reserved share comes back
        let fills = sells.on_fresh_quote(&mut accounts, "ABC", cents(25_00));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].units, 1);
        assert_eq!(fills[0].cash, cents(25_00));
        assert!(fills[0].cash <= cents(40_00));

        let bob = accounts.get("bob").unwrap();
        assert_eq!(bob.shares("ABC"), 9);
        assert_eq!(bob.balance(), cents(26_00));
        assert_eq!(accounts.shares_sold("ABC"), 1);
        assert_eq!(sells.reserved_shares("ABC"), 0);
    }

    #[test]
    fn sell_above_amount_stays_pending() {
        let mut accounts = funded("bob", 1_00);
        accounts.add_shares("bob", "ABC", 5).unwrap();
        let mut sells = AutoRequestStore::new(Side::Sell);
        sells.set_amount(&mut accounts, "ABC", "bob", cents(30_00)).unwrap();
        sells.set_trigger(&mut accounts, "ABC", "bob", cents(15_00)).unwrap();

        // one share at 31.00 is worth more than the 30.00 asked for
        assert!(sells.on_fresh_quote(&mut accounts, "ABC", cents(31_00)).is_empty());
        assert_eq!(sells.reserved_shares("ABC"), 2);
        assert_eq!(accounts.get("bob").unwrap().shares("ABC"), 3);
    }

    #[test]
    fn sell_trigger_needs_shares() {
        let mut accounts = funded("bob", 1_00);
        accounts.add_shares("bob", "ABC", 2).unwrap();
        let mut sells = AutoRequestStore::new(Side::Sell);
        sells.set_amount(&mut accounts, "ABC", "bob", cents(100_00)).unwrap();
        assert!(matches!(
            sells.set_trigger(&mut accounts, "ABC", "bob", cents(10_00)),
            Err(TradeError::InsufficientShares { .. })
        ));
        assert_eq!(accounts.get("bob").unwrap().shares("ABC"), 2);
    }

    #[test]
    fn sell_cancel_follows_policy() {
        for (policy, expected, lost) in
            [(SellCancelPolicy::ReturnShares, 10, 0), (SellCancelPolicy::Forfeit, 7, 3)]
        {
            let mut accounts = funded("bob", 1_00);
            accounts.add_shares("bob", "ABC", 10).unwrap();
            let mut sells = AutoRequestStore::new(Side::Sell).with_sell_cancel(policy);
            sells.set_amount(&mut accounts, "ABC", "bob", cents(90_00)).unwrap();
            sells.set_trigger(&mut accounts, "ABC", "bob", cents(30_00)).unwrap();

            assert_eq!(sells.cancel(&mut accounts, "ABC", "bob").unwrap(), Money::ZERO);
            assert_eq!(accounts.get("bob").unwrap().shares("ABC"), expected);
            assert_eq!(accounts.forfeited_shares("ABC"), lost);
        }
    }

    #[test]
    fn matching_is_per_user() {
        let mut accounts = funded("alice", 100_00);
        accounts.deposit("bob", cents(100_00)).unwrap();
        let mut buys = AutoRequestStore::new(Side::Buy);
        buys.set_amount(&mut accounts, "XYZ", "alice", cents(20_00)).unwrap();
        buys.set_trigger(&mut accounts, "XYZ", "alice", cents(10_00)).unwrap();
        buys.set_amount(&mut accounts, "XYZ", "bob", cents(20_00)).unwrap();
        buys.set_trigger(&mut accounts, "XYZ", "bob", cents(5_00)).unwrap();

        let fills = buys.on_fresh_quote(&mut accounts, "XYZ", cents(8_00));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].user_id, "alice");
        assert!(buys.get("XYZ", "bob").is_some());
    }
}
