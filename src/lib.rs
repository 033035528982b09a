pub mod action;
pub mod approval;
#[cfg(feature = "browser")]
pub mod browser;
pub mod clock;
pub mod config;
pub mod filter;
pub mod generator;
/// Append-only JSONL reply history, the dedup source of truth.
pub mod history;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod post;
pub mod rate;
pub mod session;
pub mod source;
