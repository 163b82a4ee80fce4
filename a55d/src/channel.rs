//! Command channel to the co-processor
//!
//! The channel is a character device carrying `\r`-terminated text frames.
//! One thread owns the [`ChannelReader`]; any number of threads share the
//! [`ChannelWriter`], which serializes whole frames so they never interleave.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use a55lib::{LinkError, LinkResult};
use log::{debug, error};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};

use crate::config::constants::{WRITE_DELAY_INIT, WRITE_DELAY_MAX};

/// Events reported by [`ChannelReader::wait_readable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Data is ready to read
    ReadReady,
    /// Timeout occurred
    Timeout,
    /// Hangup or error on the device
    Error,
}

/// Open the channel device read/write, non-blocking, without making it the
/// controlling terminal, and switch it to raw mode if it is a tty.
pub fn open_channel<P: AsRef<Path>>(path: P) -> LinkResult<File> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)?;

    match tcgetattr(&file) {
        Ok(mut termios) => {
            cfmakeraw(&mut termios);
            tcsetattr(&file, SetArg::TCSANOW, &termios)
                .map_err(|e| LinkError::Io(io::Error::from_raw_os_error(e as i32)))?;
        }
        Err(Errno::ENOTTY) | Err(Errno::EINVAL) => {
            debug!("{} is not a tty, leaving line settings alone", path.display());
        }
        Err(e) => return Err(LinkError::Io(io::Error::from_raw_os_error(e as i32))),
    }

    Ok(file)
}

/// Wait for `fd` to become readable
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> LinkResult<ChannelEvent> {
    let mut poll_fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);

    match poll(&mut poll_fds, timeout) {
        Ok(0) => Ok(ChannelEvent::Timeout),
        Ok(_) => {
            if let Some(revents) = poll_fds[0].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    return Ok(ChannelEvent::ReadReady);
                }
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                    return Ok(ChannelEvent::Error);
                }
            }
            Ok(ChannelEvent::Timeout)
        }
        Err(Errno::EINTR) => Ok(ChannelEvent::Timeout),
        Err(e) => Err(LinkError::Io(io::Error::from_raw_os_error(e as i32))),
    }
}

/// Split an open channel into its read and write halves
pub fn split(file: File) -> (ChannelReader, ChannelWriter) {
    let file = Arc::new(file);
    (
        ChannelReader { file: Arc::clone(&file) },
        ChannelWriter::new(file),
    )
}

/// Read half of the channel
pub struct ChannelReader {
    file: Arc<File>,
}

impl ChannelReader {
    /// Wait for the device to become readable
    pub fn wait_readable(&self, timeout: Duration) -> LinkResult<ChannelEvent> {
        wait_readable(self.file.as_fd(), timeout)
    }

    /// Read whatever is available. `Ok(None)` means nothing was ready.
    pub fn read(&mut self, buf: &mut [u8]) -> LinkResult<Option<usize>> {
        match (&*self.file).read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(None),
            Err(e) => Err(LinkError::Io(e)),
        }
    }
}

/// Write half of the channel, shared between threads
#[derive(Clone)]
pub struct ChannelWriter {
    file: Arc<File>,
    lock: Arc<Mutex<()>>,
    failed: Arc<AtomicBool>,
}

impl ChannelWriter {
    fn new(file: Arc<File>) -> Self {
        Self {
            file,
            lock: Arc::new(Mutex::new(())),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Write one complete frame.
    ///
    /// A device that stays full past the backoff limit yields
    /// [`LinkError::Timeout`] if nothing was written. Once part of the frame
    /// is on the wire the channel can no longer be framed, so running out of
    /// backoff then, or any other I/O error, marks the channel failed.
    pub fn write_frame(&self, frame: &[u8]) -> LinkResult<()> {
        if self.has_failed() {
            return Err(LinkError::channel("channel failed"));
        }

        let _guard = self
            .lock
            .lock()
            .map_err(|_| LinkError::channel("writer lock poisoned"))?;

        let mut written = 0;
        let mut delay = WRITE_DELAY_INIT;

        while written < frame.len() {
            match (&*self.file).write(&frame[written..]) {
                Ok(0) => {
                    self.mark_failed();
                    return Err(LinkError::channel("device accepted no bytes"));
                }
                Ok(n) => {
                    written += n;
                    delay = WRITE_DELAY_INIT;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if delay > WRITE_DELAY_MAX {
                        if written == 0 {
                            return Err(LinkError::Timeout);
                        }
                        error!("Channel stalled after {} of {} frame bytes", written, frame.len());
                        self.mark_failed();
                        return Err(LinkError::channel("frame truncated by stalled device"));
                    }
                    thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => {
                    error!("Channel write failed: {}", e);
                    self.mark_failed();
                    return Err(LinkError::Io(e));
                }
            }
        }

        Ok(())
    }

    /// True once a fatal write error has been seen
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Flag the channel as unusable
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}
