// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Replay --------
pub static COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("commands_total", "commands executed (labels: command, outcome)"),
        &["command", "outcome"],
    )
    .unwrap()
});

pub static ACCOUNTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("accounts", "known accounts").unwrap());

// -------- Quote cache --------
pub static QUOTE_CACHE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("quote_cache_total", "quote lookups (label: result = hit|miss)"),
        &["result"],
    )
    .unwrap()
});

pub static QUOTE_FETCH_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("quote_fetch_errors_total", "failed quote server fetches").unwrap());

pub static QUOTE_FETCH_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "quote_fetch_latency_ms",
        "Quote server round-trip (ms)",
    ))
    .unwrap()
});

// -------- Auto requests --------
pub static AUTO_FIRED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("auto_requests_fired_total", "auto-requests executed (label: side)"),
        &["side"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; repeat calls are no-ops
    let collectors: [Box<dyn prometheus::core::Collector>; 6] = [
        Box::new(COMMANDS.clone()),
        Box::new(ACCOUNTS.clone()),
        Box::new(QUOTE_CACHE.clone()),
        Box::new(QUOTE_FETCH_ERRORS.clone()),
        Box::new(QUOTE_FETCH_MS.clone()),
        Box::new(AUTO_FIRED.clone()),
    ];
    for c in collectors {
        let _ = REGISTRY.register(c);
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Metrics responder on a dedicated OS thread (keeps the replay loop clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}
