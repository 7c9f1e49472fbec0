// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : daytrader_rust — workload-replay stock trading back end in Rust
Module  : <module_name>.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Replays a workload of trading commands (ADD, QUOTE, BUY/SELL,
          COMMIT/CANCEL, auto buy/sell triggers) against in-memory accounts,
          caches signed quotes from the quote server (or a mock), fires
          trigger orders on fresh quotes, and records a JSONL audit log.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use chrono::{Duration, Local};
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use std::path::PathBuf;

use crate::autorequests::SellCancelPolicy;
use crate::executor::{ExecutorCfg, ExpiredOrderPolicy};

/// Where quotes come from
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum QuoteMode {
    Mock,
    Dev,
    Prod,
}

impl QuoteMode {
    // Quote server per mode
    pub fn default_addr(&self) -> &'static str {
        match self {
            QuoteMode::Mock => "mock", // not dialed
            QuoteMode::Dev  => "localhost:4443",
            QuoteMode::Prod => "quoteserve.seng.uvic.ca:4443",
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(name = "daytrader_rust", version, about = "Replay a trading workload file")]
pub struct Args {
    /// Workload file, one `[id] COMMAND,user,args...` per line
    pub workload: PathBuf,

    /// tracing filter (e.g. `info`, `daytrader_rust=debug`)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "QUOTE_MODE", value_enum, default_value = "mock")]
    pub quote_mode: QuoteMode,

    /// Overrides the per-mode quote server address
    #[arg(long, env = "QUOTE_SERVER_ADDR")]
    pub quote_server: Option<String>,

    #[arg(long, env = "QUOTE_TIMEOUT_SECS", default_value_t = 10)]
    pub quote_timeout_secs: u64,

    #[arg(long, env = "QUOTE_VALIDITY_SECS", default_value_t = 60)]
    pub quote_validity_secs: i64,

    #[arg(long, env = "ORDER_VALIDITY_SECS", default_value_t = 60)]
    pub order_validity_secs: i64,

    /// Defaults to logs/<YYYYMMDDTHHMMSS>.jsonl
    #[arg(long, env = "AUDIT_FILE")]
    pub audit_file: Option<String>,

    #[arg(long, env = "SERVERNAME", default_value = "UNKNOWN")]
    pub server_name: String,

    /// Prometheus text endpoint; disabled when unset
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[arg(long, env = "MOCK_SEED", default_value_t = 42)]
    pub mock_seed: u64,

    #[arg(long, env = "EXPIRED_ORDERS", value_enum, default_value = "discard")]
    pub expired_orders: ExpiredOrderPolicy,

    #[arg(long, env = "SELL_AUTO_CANCEL", value_enum, default_value = "forfeit")]
    pub sell_cancel: SellCancelPolicy,
}

impl Args {
    pub fn quote_addr(&self) -> String {
        self.quote_server
            .clone()
            .unwrap_or_else(|| self.quote_mode.default_addr().to_string())
    }

    pub fn audit_path(&self) -> String {
        self.audit_file.clone().unwrap_or_else(|| {
            format!("logs/{}.jsonl", Local::now().format("%Y%m%dT%H%M%S"))
        })
    }

    pub fn quote_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.quote_timeout_secs)
    }

    pub fn executor_cfg(&self) -> ExecutorCfg {
        ExecutorCfg {
            server: self.server_name.clone(),
            order_validity: Duration::seconds(self.order_validity_secs),
            quote_validity: Duration::seconds(self.quote_validity_secs),
            expired_orders: self.expired_orders,
            sell_cancel: self.sell_cancel,
        }
    }
}

pub fn load() -> Args {
    // Read .env first so clap's env fallbacks see it
    let _ = dotenv();
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_mode() {
        let args = Args::try_parse_from(["daytrader_rust", "w.txt", "--quote-mode", "dev"]).unwrap();
        assert_eq!(args.quote_addr(), "localhost:4443");
        assert_eq!(args.quote_timeout(), std::time::Duration::from_secs(10));

        let cfg = args.executor_cfg();
        assert_eq!(cfg.order_validity, Duration::seconds(60));
        assert_eq!(cfg.expired_orders, ExpiredOrderPolicy::Discard);
        assert_eq!(cfg.sell_cancel, SellCancelPolicy::Forfeit);
    }

    #[test]
    fn overrides() {
        let args = Args::try_parse_from([
            "daytrader_rust",
            "w.txt",
            "--quote-mode",
            "prod",
            "--quote-server",
            "10.0.0.1:4444",
            "--expired-orders",
            "refund",
            "--sell-cancel",
            "return-shares",
            "--audit-file",
            "out/audit.jsonl",
        ])
        .unwrap();
        assert_eq!(args.quote_addr(), "10.0.0.1:4444");
        assert_eq!(args.audit_path(), "out/audit.jsonl");
        assert_eq!(args.expired_orders, ExpiredOrderPolicy::Refund);
        assert_eq!(args.sell_cancel, SellCancelPolicy::ReturnShares);
    }
}
