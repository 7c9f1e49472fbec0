// ===============================
// src/lib.rs
// ===============================
pub mod domain;
pub mod currency;
pub mod error;
pub mod config;
pub mod metrics;
pub mod recorder;
pub mod feed;           // quote sources (TCP quote server / mock)
pub mod quotes;         // quote cache
pub mod accounts;
pub mod autorequests;
pub mod parser;
pub mod executor;
