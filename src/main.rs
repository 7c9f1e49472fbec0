// ===============================
// src/main.rs
// ===============================
/*
 # offline replay with the mock quote source
 cargo run --release -- workloads/1userWorkLoad.txt

 # against the quote server, metrics on :9898
 QUOTE_MODE=prod METRICS_PORT=9898 cargo run --release -- workloads/10userWorkLoad.txt
 curl -s localhost:9898/metrics | grep '^commands_total'
*/
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
use std::process;

use tokio::{fs::File, io::BufReader, sync::mpsc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use daytrader_rust::config::{self, QuoteMode};
use daytrader_rust::executor::{self, Executor, ReplayStats};
use daytrader_rust::feed::{MockQuoteSource, TcpQuoteSource};
use daytrader_rust::metrics;
use daytrader_rust::quotes::QuoteSource;
use daytrader_rust::recorder::{self, RecorderMsg};

async fn run_replay<S: QuoteSource>(
    source: S,
    args: &config::Args,
    rec_tx: mpsc::Sender<RecorderMsg>,
    file: File,
) -> std::io::Result<ReplayStats> {
    // executor (and with it the recorder sender) is dropped on return
    let mut exec = Executor::new(source, args.executor_cfg(), Some(rec_tx));
    let stats = executor::replay(&mut exec, BufReader::new(file)).await?;
    info!(
        accounts = exec.accounts().len(),
        cash_on_books = %exec.cash_on_books(),
        "final ledger"
    );
    Ok(stats)
}

#[tokio::main]
async fn main() {
    // ---- Config ----
    let args = config::load();

    // ---- Logging ----
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = args.metrics_port {
        metrics::serve_metrics(port);
    }

    let audit_path = args.audit_path();
    info!(
        workload = %args.workload.display(),
        quote_mode = ?args.quote_mode,
        quote_server = %args.quote_addr(),
        audit = %audit_path,
        server = %args.server_name,
        expired_orders = ?args.expired_orders,
        sell_cancel = ?args.sell_cancel,
        "startup config"
    );

    // ---- Audit recorder ----
    let (rec_tx, rec_rx) = mpsc::channel::<RecorderMsg>(8192);
    let recorder = match recorder::start(rec_rx, audit_path.clone()).await {
        Ok(task) => tokio::spawn(task),
        Err(e) => {
            error!(?e, path = %audit_path, "cannot open audit log");
            process::exit(1);
        }
    };

    // ---- Workload ----
    let file = match File::open(&args.workload).await {
        Ok(f) => f,
        Err(e) => {
            error!(?e, path = %args.workload.display(), "cannot open workload");
            process::exit(1);
        }
    };
    info!(path = %args.workload.display(), "opened workload");

    let result = match args.quote_mode {
        QuoteMode::Mock => {
            run_replay(MockQuoteSource::new(args.mock_seed), &args, rec_tx, file).await
        }
        QuoteMode::Dev | QuoteMode::Prod => {
            let source = TcpQuoteSource::new(args.quote_addr(), args.quote_timeout());
            run_replay(source, &args, rec_tx, file).await
        }
    };

    // recorder drains and flushes once every sender is gone
    if let Err(e) = recorder.await {
        error!(?e, "recorder task failed");
    }

    match result {
        Ok(stats) => info!(
            processed = stats.processed,
            failed = stats.failed,
            ignored = stats.ignored,
            "done"
        ),
        Err(e) => {
            error!(?e, "failed reading workload");
            process::exit(1);
        }
    }
}
