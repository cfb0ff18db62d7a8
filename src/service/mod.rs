pub mod alerts;
pub mod commands;
pub mod decoder;
pub mod devices;
pub mod evaluator;
pub mod ingest;
pub mod monitor;
pub mod pinger;
pub mod processor;
pub mod worker_pool;
