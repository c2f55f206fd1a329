//! FTP protocol plumbing
//!
//! Client-side reply parsing, reply-code constants, and data-channel
//! address encoding for the control channel.

pub mod reply;

pub use reply::{Reply, parse_passive_addr, parse_reply_line};
