// ===============================
// src/feed.rs
// ===============================
//
// Quote sources:
// - TcpQuoteSource  : the legacy quote server. One connection per request,
//                     sends "<stock>,<user>" (no terminator), reads one
//                     line back.
// - MockQuoteSource : seeded random walk per stock, signed locally, for
//                     offline replays.
//
// Response shape (both): "price,stock,user,unix_seconds,cryptokey".
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::Sha256;
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use crate::currency::Money;
use crate::domain::Quote;
use crate::error::TradeError;
use crate::quotes::QuoteSource;

/// Parse one quote server response line.
pub fn parse_quote_line(line: &str) -> Result<Quote, TradeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != 5 {
        return Err(TradeError::QuoteUnavailable(format!(
            "expected 5 fields from quote server, got {}: {line:?}",
            parts.len()
        )));
    }

    let price = Money::parse(parts[0].trim())
        .map_err(|e| TradeError::QuoteUnavailable(format!("bad price: {e}")))?;
    let secs: i64 = parts[3]
        .trim()
        .parse()
        .map_err(|_| TradeError::QuoteUnavailable(format!("bad timestamp {:?}", parts[3])))?;
    let timestamp = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| TradeError::QuoteUnavailable(format!("timestamp out of range: {secs}")))?;

    Ok(Quote {
        price,
        stock: parts[1].trim().to_string(),
        user_id: parts[2].trim().to_string(),
        timestamp,
        cryptokey: parts[4].trim().to_string(),
        txn: None,
    })
}

pub struct TcpQuoteSource {
    addr: String,
    timeout: Duration,
}

impl TcpQuoteSource {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self { addr: addr.into(), timeout }
    }

    async fn round_trip(&self, request: &str) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        // EOF without a newline still leaves whatever arrived in `line`
        reader.read_line(&mut line).await?;
        Ok(line)
    }
}

impl QuoteSource for TcpQuoteSource {
    async fn fetch(&mut self, user: &str, stock: &str) -> Result<Quote, TradeError> {
        let request = format!("{stock},{user}");
        debug!(addr = %self.addr, %request, "quote server request");

        let line = match timeout(self.timeout, self.round_trip(&request)).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => return Err(TradeError::QuoteUnavailable(format!("{}: {e}", self.addr))),
            Err(_) => {
                return Err(TradeError::QuoteUnavailable(format!(
                    "{}: timed out after {:?}",
                    self.addr, self.timeout
                )))
            }
        };
        parse_quote_line(&line)
    }
}

/// Offline stand-in for the quote server.
pub struct MockQuoteSource {
    rng: StdRng,
    key: Vec<u8>,
    last_px: HashMap<String, i64>,
    clock: fn() -> DateTime<Utc>,
}

impl MockQuoteSource {
    pub fn new(seed: u64) -> Self {
        Self::with_clock(seed, Utc::now)
    }

    /// Same as `new`, stamping quotes with `clock()` instead of wall time.
    pub fn with_clock(seed: u64, clock: fn() -> DateTime<Utc>) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            key: seed.to_be_bytes().to_vec(),
            last_px: HashMap::new(),
            clock,
        }
    }

    fn next_price(&mut self, stock: &str) -> Money {
        let start = self.rng.gen_range(5_00..=500_00);
        let px = self.last_px.entry(stock.to_string()).or_insert(start);
        // random walk, never below $1.00
        let step = self.rng.gen_range(-50..=50);
        *px = (*px + step).max(1_00);
        Money::from_cents(*px)
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = match Hmac::<Sha256>::new_from_slice(&self.key) {
            Ok(m) => m,
            // HMAC accepts keys of any length
            Err(_) => return String::new(),
        };
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Render a response line exactly as the quote server would.
    pub fn respond(&mut self, user: &str, stock: &str) -> String {
        let price = self.next_price(stock);
        let ts = (self.clock)().timestamp();
        let payload = format!("{price},{stock},{user},{ts}");
        let key = self.sign(&payload);
        format!("{payload},{key}\n")
    }
}

impl QuoteSource for MockQuoteSource {
    async fn fetch(&mut self, user: &str, stock: &str) -> Result<Quote, TradeError> {
        let line = self.respond(user, stock);
        parse_quote_line(&line)
    }
}
