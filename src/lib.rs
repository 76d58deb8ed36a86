// ===============================
// src/lib.rs
// ===============================
pub mod domain;
pub mod error;
pub mod config;
pub mod metrics;
pub mod feed;
pub mod bars;
pub mod journal;
pub mod positions;
pub mod store;
pub mod signal;
pub mod policy;
pub mod sizer;
pub mod risk;
pub mod ratelimit;
pub mod broker;       // broker seam + paper venue
pub mod executor;
pub mod pipeline;
pub mod runner;
pub mod reconcile;
