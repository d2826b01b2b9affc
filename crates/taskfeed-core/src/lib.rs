//! Core of the taskfeed ingestion pipeline.
//!
//! This crate is framework-agnostic. Discord and the opencode CLI live behind
//! ports (`MessageSource`, `Classifier`) implemented in adapter crates.

pub mod classifier;
pub mod config;
pub mod domain;
pub mod errors;
pub mod ingest;
pub mod logging;
pub mod source;
pub mod store;
pub mod text;

pub use errors::{Error, Result};
