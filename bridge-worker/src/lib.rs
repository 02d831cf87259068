pub mod alerts;
pub mod audit;
pub mod client;
pub mod config;
pub mod datetime;
pub mod decoder;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod stats;
pub mod transformer;
pub mod watcher;
