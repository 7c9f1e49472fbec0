// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

use crate::currency::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Side::Buy => "buy", Side::Sell => "sell" })
    }
}

/// A reserved buy or sell waiting for commit/cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub stock: String,
    pub units: u64,
    pub unit_price: Money,
    pub created: DateTime<Utc>,
}

impl Action {
    /// Cash value of the reservation (`units * unit_price`).
    pub fn value(&self) -> Money { self.unit_price * self.units }

    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.created >= window
    }
}

/// A signed quote as returned by the quote server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub stock: String,
    pub user_id: String,
    pub price: Money,
    pub timestamp: DateTime<Utc>,
    pub cryptokey: String,
    /// Transaction that caused the cache miss, when known.
    pub txn: Option<u64>,
}

impl Quote {
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.timestamp < window
    }
}

/// Standing conditional order for one (stock, user) on one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoRequest {
    pub stock: String,
    pub user_id: String,
    pub amount: Money,
    /// `None` until a trigger has been set.
    pub trigger: Option<Money>,
    /// Shares pulled out of the portfolio when a sell trigger is armed.
    pub reserved_shares: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Add,
    Quote,
    Buy,
    CommitBuy,
    CancelBuy,
    Sell,
    CommitSell,
    CancelSell,
    SetBuyAmount,
    CancelSetBuy,
    SetBuyTrigger,
    SetSellAmount,
    SetSellTrigger,
    CancelSetSell,
    DisplaySummary,
    DumpLog,
    Unknown(String),
}

impl CommandKind {
    const NAMES: [(&'static str, CommandKind); 16] = [
        ("ADD", CommandKind::Add),
        ("QUOTE", CommandKind::Quote),
        ("BUY", CommandKind::Buy),
        ("COMMIT_BUY", CommandKind::CommitBuy),
        ("CANCEL_BUY", CommandKind::CancelBuy),
        ("SELL", CommandKind::Sell),
        ("COMMIT_SELL", CommandKind::CommitSell),
        ("CANCEL_SELL", CommandKind::CancelSell),
        ("SET_BUY_AMOUNT", CommandKind::SetBuyAmount),
        ("CANCEL_SET_BUY", CommandKind::CancelSetBuy),
        ("SET_BUY_TRIGGER", CommandKind::SetBuyTrigger),
        ("SET_SELL_AMOUNT", CommandKind::SetSellAmount),
        ("SET_SELL_TRIGGER", CommandKind::SetSellTrigger),
        ("CANCEL_SET_SELL", CommandKind::CancelSetSell),
        ("DISPLAY_SUMMARY", CommandKind::DisplaySummary),
        ("DUMPLOG", CommandKind::DumpLog),
    ];

    /// Case-insensitive lookup; anything else becomes `Unknown`.
    pub fn from_name(name: &str) -> CommandKind {
        Self::NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, k)| k.clone())
            .unwrap_or_else(|| CommandKind::Unknown(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            CommandKind::Unknown(n) => n,
            known => Self::NAMES
                .iter()
                .find(|(_, k)| k == known)
                .map(|(n, _)| *n)
                .unwrap_or("UNKNOWN"),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: u64,
    pub kind: CommandKind,
    pub user_id: String,
    pub args: Vec<String>,
}

// ----- audit events -----

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    UserCommand {
        timestamp_ms: i64,
        server: String,
        transaction_num: u64,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stock_symbol: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        funds: Option<String>,
    },
    QuoteServer {
        timestamp_ms: i64,
        server: String,
        transaction_num: u64,
        price: Money,
        stock_symbol: String,
        username: String,
        quote_server_time: i64,
        cryptokey: String,
    },
    ErrorEvent {
        timestamp_ms: i64,
        server: String,
        transaction_num: u64,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        error_message: String,
    },
}

impl AuditEvent {
    pub fn username(&self) -> Option<&str> {
        match self {
            AuditEvent::UserCommand { username, .. } | AuditEvent::ErrorEvent { username, .. } => {
                username.as_deref()
            }
            AuditEvent::QuoteServer { username, .. } => Some(username),
        }
    }
}
