//! A55Link Shared Library (a55lib)
//!
//! This library contains definitions shared between the daemon (a55d) that
//! owns the co-processor link and the host processes (a55ctl) that talk to it.

pub mod types;
pub mod protocol;
pub mod notification;
pub mod error;

pub use types::*;
pub use protocol::*;
pub use notification::*;
pub use error::*;
