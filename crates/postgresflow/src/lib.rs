//! Core of a PostgreSQL-backed background job execution runtime,
//! interoperable with peer runtimes that share the same tables and wire
//! format. See the module docs on each submodule for the component it
//! implements.

pub mod admin;
pub mod cleanup;
pub mod concurrency;
pub mod config;
pub mod cron;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod notifier;
pub mod poller;
pub mod serialization;

pub use error::{PgflowError, Result};
