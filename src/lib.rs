// ===============================
// src/lib.rs
// ===============================
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod engine;
pub mod executor;
pub mod feed;
pub mod metrics;
pub mod queue;
pub mod recorder;
pub mod state;
pub mod strategy;
