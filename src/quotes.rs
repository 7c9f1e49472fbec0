// ===============================
// src/quotes.rs (quote cache)
// ===============================
//
// One cached quote per (stock, user). A hit is a map lookup; a miss or an
// expired entry is the only thing that goes out to the quote source. A failed
// fetch leaves the cache as it was.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};

use crate::domain::Quote;
use crate::error::TradeError;
use crate::metrics::{QUOTE_CACHE, QUOTE_FETCH_ERRORS, QUOTE_FETCH_MS};

/// Anything that can produce a signed quote for (user, stock).
pub trait QuoteSource {
    fn fetch(
        &mut self,
        user: &str,
        stock: &str,
    ) -> impl Future<Output = Result<Quote, TradeError>> + Send;
}

/// Result of a cache lookup. `fetched` is set when the quote came from the
/// source on this call (the caller runs auto-request matching on those).
#[derive(Debug, Clone)]
pub struct QuoteLookup {
    pub quote: Quote,
    pub fetched: bool,
}

pub struct QuoteCache<S> {
    source: S,
    validity: Duration,
    by_stock: HashMap<String, HashMap<String, Quote>>,
}

impl<S: QuoteSource> QuoteCache<S> {
    pub fn new(source: S, validity: Duration) -> Self {
        Self { source, validity, by_stock: HashMap::new() }
    }

    pub fn validity(&self) -> Duration { self.validity }

    /// Cached quote for (stock, user) if it is still fresh at `now`.
    pub fn cached(&self, user: &str, stock: &str, now: DateTime<Utc>) -> Option<&Quote> {
        self.by_stock
            .get(stock)
            .and_then(|users| users.get(user))
            .filter(|q| q.is_fresh(now, self.validity))
    }

    pub async fn get_quote(
        &mut self,
        user: &str,
        stock: &str,
        txn: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<QuoteLookup, TradeError> {
        if let Some(q) = self.cached(user, stock, now) {
            QUOTE_CACHE.with_label_values(&["hit"]).inc();
            return Ok(QuoteLookup { quote: q.clone(), fetched: false });
        }
        QUOTE_CACHE.with_label_values(&["miss"]).inc();

        let started = Instant::now();
        let mut quote = match self.source.fetch(user, stock).await {
            Ok(q) => q,
            Err(e) => {
                QUOTE_FETCH_ERRORS.inc();
                warn!(%user, %stock, ?e, "quote fetch failed");
                return Err(e);
            }
        };
        QUOTE_FETCH_MS.observe(started.elapsed().as_secs_f64() * 1000.0);

        if !quote.stock.eq_ignore_ascii_case(stock) || quote.user_id != user {
            debug!(%user, %stock, got_stock = %quote.stock, got_user = %quote.user_id, "quote echoed different key");
        }
        quote.txn = txn;

        self.by_stock
            .entry(stock.to_string())
            .or_default()
            .insert(user.to_string(), quote.clone());

        Ok(QuoteLookup { quote, fetched: true })
    }
}
