//! A55Link daemon (a55d)
//!
//! a55d runs on the host processor and owns the link to the co-processor:
//! the framed command channel, the shared file region and the local sockets
//! other host processes use to reach the co-processor.

pub mod channel;
pub mod collaborator;
pub mod config;
pub mod correlator;
pub mod daemon;
pub mod dispatcher;
pub mod file_receiver;
pub mod gateway;
pub mod handlers;
pub mod param_store;
pub mod retry_queue;
pub mod sender;
pub mod shared_region;
pub mod wait;

pub use config::{load_config, CaptureConfig, DaemonConfig};
pub use correlator::{Correlator, Delivery, Waiter};
pub use daemon::{Daemon, DaemonContext};
pub use param_store::ParamStore;
pub use retry_queue::{EntryOutcome, RetryEntry, RetryQueue, RetryWorker};
pub use sender::{CommandSender, CommandSink, SendOutcome};
pub use shared_region::{DmaInfo, SharedRegion};
