//! edgetune-core - shared library for the edgetune tools.
//!
//! Provides:
//! - `host` - filesystem, command and clock abstractions (real and mock)
//! - `config` - install and diagnostics defaults
//! - `ledger` - append-only backup ledger
//! - `state` - persisted install state
//! - `install` - idempotent mutation engine and installer
//! - `rollback` - reversal engine
//! - `probe` - system probe runner and report snapshot model
//! - `cache` - single-slot report cache
//! - `ratelimit` - global request rate limiter
//! - `validate` - validation report builder
//!
//! With `api` feature:
//! - OpenAPI schemas (`utoipa::ToSchema`) on the report types

pub mod cache;
pub mod config;
pub mod host;
pub mod install;
pub mod ledger;
pub mod probe;
pub mod ratelimit;
pub mod rollback;
pub mod state;
pub mod util;
pub mod validate;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
