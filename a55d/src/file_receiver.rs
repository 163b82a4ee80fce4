//! Shared-memory file receiver
//!
//! Owns the notification device. Each record read from it names a range of
//! the shared region; the range is checked against the region size before
//! anything is read and then copied into the output directory.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use a55lib::{FileNotification, LinkError, LinkResult, NotificationLayout, TransferStatistics};
use log::{debug, error, info, warn};

use crate::channel::{wait_readable, ChannelEvent};
use crate::config::constants::{NOTIFICATION_READ_SIZE, PREVIEW_CHARS, RX_ERROR_PAUSE};
use crate::shared_region::SharedRegion;

/// Extensions whose contents are previewed in the log
const TEXT_EXTENSIONS: [&str; 4] = ["txt", "log", "json", "xml"];

/// Bytes decoded for a preview
const PREVIEW_BYTES: usize = 200;

/// Reduce a notified filename to a safe final path component
pub fn output_name(filename: &str) -> Option<&str> {
    let name = filename.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}

fn is_text(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| TEXT_EXTENSIONS.iter().any(|t| e.eq_ignore_ascii_case(t)))
        .unwrap_or(false)
}

/// File receiver worker
pub struct FileReceiver {
    device: File,
    region: SharedRegion,
    output_dir: PathBuf,
    layout: NotificationLayout,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    stats_interval: Duration,
    stats: TransferStatistics,
}

impl FileReceiver {
    pub fn new(
        device: File,
        region: SharedRegion,
        output_dir: PathBuf,
        layout: NotificationLayout,
        running: Arc<AtomicBool>,
        poll_interval: Duration,
        stats_interval: Duration,
    ) -> Self {
        Self {
            device,
            region,
            output_dir,
            layout,
            running,
            poll_interval,
            stats_interval,
            stats: TransferStatistics::new(),
        }
    }

    pub fn statistics(&self) -> TransferStatistics {
        self.stats.with_timestamp()
    }

    /// Wait one poll interval for a notification record
    pub fn next_record(&mut self, buf: &mut [u8]) -> LinkResult<Option<usize>> {
        match wait_readable(self.device.as_fd(), self.poll_interval)? {
            ChannelEvent::ReadReady => match self.device.read(buf) {
                Ok(0) => Ok(None),
                Ok(n) => Ok(Some(n)),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(None),
                Err(e) => Err(LinkError::Io(e)),
            },
            ChannelEvent::Timeout => Ok(None),
            ChannelEvent::Error => Err(LinkError::notification("device reported hangup or error")),
        }
    }

    /// Decode, validate and copy out one notification. Returns the written path.
    pub fn handle_record(&mut self, record: &[u8]) -> LinkResult<PathBuf> {
        let result = self.copy_out(record);
        if result.is_err() {
            self.stats.rejected += 1;
        }
        result
    }

    fn copy_out(&mut self, record: &[u8]) -> LinkResult<PathBuf> {
        let notification = FileNotification::decode(record, self.layout)?;
        info!(
            "File notification: {} offset={:#x} size={} type={:#04x} target={:#04x} flags={:#04x}",
            notification.filename,
            notification.offset,
            notification.size,
            notification.msg_type,
            notification.target,
            notification.flags
        );

        notification.validate(self.region.size())?;
        let name = output_name(&notification.filename)
            .ok_or_else(|| LinkError::notification(format!("unusable filename {:?}", notification.filename)))?;

        fs::create_dir_all(&self.output_dir)?;
        let dest = self.output_dir.join(name);
        let written = self
            .region
            .copy_to_file(u64::from(notification.offset), u64::from(notification.size), &dest)?;

        self.stats.files_received += 1;
        self.stats.total_bytes += written;
        info!("Saved {} ({} bytes)", dest.display(), written);

        if is_text(name) {
            let len = (notification.size as usize).min(PREVIEW_BYTES);
            let bytes = self.region.read_range(u64::from(notification.offset), len as u64)?;
            let preview: String = String::from_utf8_lossy(&bytes).chars().take(PREVIEW_CHARS).collect();
            debug!("Preview of {}: {}", name, preview);
        }

        Ok(dest)
    }

    fn log_statistics(&self) {
        if self.stats.files_received > 0 {
            info!(
                "Files received: {}, total bytes: {}, rejected: {}",
                self.stats.files_received, self.stats.total_bytes, self.stats.rejected
            );
        }
    }

    /// Receive files until the running flag clears
    pub fn run(mut self) -> TransferStatistics {
        let mut buf = vec![0u8; NOTIFICATION_READ_SIZE];
        let mut last_stats = Instant::now();
        info!(
            "File receiver started: region {} bytes at {:#x}, output {}",
            self.region.size(),
            self.region.phys_addr(),
            self.output_dir.display()
        );

        while self.running.load(Ordering::SeqCst) {
            match self.next_record(&mut buf) {
                Ok(Some(n)) => {
                    if let Err(e) = self.handle_record(&buf[..n]) {
                        warn!("Notification rejected: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Notification read failed: {}", e);
                    thread::sleep(RX_ERROR_PAUSE);
                }
            }

            if last_stats.elapsed() >= self.stats_interval {
                self.log_statistics();
                last_stats = Instant::now();
            }
        }

        self.log_statistics();
        info!("File receiver stopped");
        self.statistics()
    }

    /// Start the receiver on a named thread
    pub fn spawn(self) -> LinkResult<JoinHandle<TransferStatistics>> {
        Ok(thread::Builder::new()
            .name("a55-files".to_string())
            .spawn(move || self.run())?)
    }
}
