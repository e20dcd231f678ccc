//! Roundtable core library.
//!
//! Shared building blocks for the Roundtable daemon:
//! - Backend stream event grammars and parsers (`stream`)
//! - Hierarchical configuration resolution (`config`)
//! - Error types (`error`)
//! - Tracing initialization (`logging`)

pub mod config;
pub mod error;
pub mod logging;
pub mod stream;

pub use error::{Error, Result};
