//! Pull-side abstractions over the chat platform (Discord today).

pub mod pager;
pub mod port;
