//! Configuration for a55d

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use a55lib::{LinkError, LinkResult, NotificationLayout};
use serde::{Deserialize, Serialize};

/// Capture collaborator invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Program to run
    pub program: String,
    /// Arguments placed before the camera index and mode flag
    pub args: Vec<String>,
    /// Time limit for one capture
    pub timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["/home/root/tools/capture.py".to_string()],
            timeout_ms: 60_000,
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Main configuration for a55d
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Command channel character device
    pub tty_device: PathBuf,
    /// Shared region and file notification device
    pub dma_device: PathBuf,
    /// Directory receiving files copied out of the shared region
    pub output_dir: PathBuf,
    /// Parameter store location
    pub param_store_path: PathBuf,
    /// Command intake socket
    pub command_socket: PathBuf,
    /// Event intake socket
    pub event_socket: PathBuf,
    /// Trusted directory for `a55_exec` scripts
    pub tools_dir: PathBuf,
    /// Capture collaborator
    pub capture: CaptureConfig,
    /// Time limit for `a55_exec` scripts
    pub exec_timeout_ms: u64,
    /// Acknowledgment wait for queued commands
    pub ack_timeout_ms: u64,
    /// Acknowledgment wait for gateway commands
    pub command_ack_timeout_ms: u64,
    /// Retry queue capacity
    pub queue_capacity: usize,
    /// Attempts granted to each event
    pub event_attempts: u32,
    /// Pause between failed attempts
    pub retry_pause_ms: u64,
    /// Pause between device acquisition attempts
    pub device_retry_ms: u64,
    /// Readiness poll timeout for worker loops
    pub poll_interval_ms: u64,
    /// Bounded wait when joining workers at shutdown
    pub shutdown_join_ms: u64,
    /// Notification record layout
    pub notification_layout: NotificationLayout,
    /// Interval for transfer statistics in the log
    pub stats_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tty_device: PathBuf::from("/dev/ttyRPMSG30"),
            dma_device: PathBuf::from("/dev/rpmsg_dma30"),
            output_dir: PathBuf::from("/data/.a55_src/tmp"),
            param_store_path: PathBuf::from("/data/.a55_src/bee_params.json"),
            command_socket: PathBuf::from("/tmp/rpmsg_cmd.sock"),
            event_socket: PathBuf::from("/tmp/bee_to_rpmsg.sock"),
            tools_dir: PathBuf::from("/home/root/tools"),
            capture: CaptureConfig::default(),
            exec_timeout_ms: 30_000,
            ack_timeout_ms: 2_000,
            command_ack_timeout_ms: 5_000,
            queue_capacity: 100,
            event_attempts: 2,
            retry_pause_ms: 200,
            device_retry_ms: 2_000,
            poll_interval_ms: 500,
            shutdown_join_ms: 2_000,
            notification_layout: NotificationLayout::Auto,
            stats_interval_secs: 60,
        }
    }
}

impl DaemonConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn command_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.command_ack_timeout_ms)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn device_retry(&self) -> Duration {
        Duration::from_millis(self.device_retry_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_join(&self) -> Duration {
        Duration::from_millis(self.shutdown_join_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Reject values the workers cannot run with
    pub fn validate(&self) -> LinkResult<()> {
        if self.queue_capacity == 0 {
            return Err(LinkError::config("queue_capacity must be at least 1"));
        }
        if self.event_attempts == 0 {
            return Err(LinkError::config("event_attempts must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(LinkError::config("poll_interval_ms must be non-zero"));
        }
        if self.command_socket == self.event_socket {
            return Err(LinkError::config("command and event sockets must differ"));
        }
        Ok(())
    }
}

/// Load daemon configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> LinkResult<DaemonConfig> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config: DaemonConfig = serde_json::from_reader(reader)?;
    config.validate()?;
    Ok(config)
}

/// Configuration constants
pub mod constants {
    use std::time::Duration;

    /// Largest chunk read from the command channel at once
    pub const RX_CHUNK_SIZE: usize = 4096;

    /// Largest notification record read at once
    pub const NOTIFICATION_READ_SIZE: usize = 1024;

    /// Initial delay for channel write retry
    pub const WRITE_DELAY_INIT: Duration = Duration::from_millis(1);

    /// Maximum delay for channel write retry
    pub const WRITE_DELAY_MAX: Duration = Duration::from_millis(500);

    /// Pause after a read error on the command channel
    pub const RX_ERROR_PAUSE: Duration = Duration::from_millis(200);

    /// Log device acquisition failures on the first and every Nth attempt
    pub const ACQUIRE_LOG_EVERY: u32 = 10;

    /// Polling step while waiting on a child process
    pub const CHILD_POLL_STEP: Duration = Duration::from_millis(50);

    /// Characters of a text file logged as a preview
    pub const PREVIEW_CHARS: usize = 100;
}
