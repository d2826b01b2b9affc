//! Hand-off of fetched messages to an analysis backend (opencode CLI today).

pub mod client;
pub mod forwarder;
pub mod prompt;
pub mod types;
