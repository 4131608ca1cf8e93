//! A small durable job queue: jobs are logged to disk, claimed by a
//! dispatcher, run by a bounded worker pool, and retried with backoff.
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod line_reader;
pub mod parser;
pub mod registry;
pub mod retry;
pub mod server;
pub mod store;
pub mod types;
pub mod util;
pub mod worker;
