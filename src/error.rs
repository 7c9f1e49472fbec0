// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

use crate::currency::Money;
use crate::domain::Side;

/// Every way a command can fail. Guards are checked before mutation, so a
/// returned error always means the ledger was left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradeError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(Money),

    #[error("account already exists: {user}")]
    AlreadyExists { user: String },

    #[error("no such account: {user}")]
    NoSuchAccount { user: String },

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Money, available: Money },

    #[error("insufficient shares of {stock}: required {required}, held {held}")]
    InsufficientShares { stock: String, required: u64, held: u64 },

    #[error("no active {side} order")]
    NoActiveOrder { side: Side },

    #[error("no pending {side} auto-request for {stock}")]
    NoPendingRequest { stock: String, side: Side },

    #[error("quote unavailable: {0}")]
    QuoteUnavailable(String),
}

impl TradeError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TradeError::InvalidFormat(_) => "invalid_format",
            TradeError::InvalidAmount(_) => "invalid_amount",
            TradeError::AlreadyExists { .. } => "already_exists",
            TradeError::NoSuchAccount { .. } => "no_such_account",
            TradeError::InsufficientFunds { .. } => "insufficient_funds",
            TradeError::InsufficientShares { .. } => "insufficient_shares",
            TradeError::NoActiveOrder { .. } => "no_active_order",
            TradeError::NoPendingRequest { .. } => "no_pending_request",
            TradeError::QuoteUnavailable(_) => "quote_unavailable",
        }
    }
}
