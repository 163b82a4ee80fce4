//! A55Link client library (a55ctl)
//!
//! Lets host processes reach the co-processor through the a55d gateway:
//! forwarded commands, queued events, and a view of the parameter table.

pub mod client;
pub mod connection;

pub use client::*;
pub use connection::*;
pub use a55lib::*;
