//! Datagram connection to the a55d gateway sockets

use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use a55lib::{LinkError, LinkResult};
use log::debug;

/// Distinguishes reply sockets opened by one process
static REPLY_SEQUENCE: AtomicU32 = AtomicU32::new(1);

/// Path for a fresh reply socket in `dir`
pub fn reply_socket_path(dir: &Path) -> PathBuf {
    let seq = REPLY_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("a55ctl-{}-{}.sock", process::id(), seq))
}

/// Connection to the gateway.
///
/// The gateway only answers peers bound to a path, so a connection that
/// expects replies binds its own socket and removes it when dropped.
pub struct GatewayConnection {
    socket: UnixDatagram,
    reply_path: Option<PathBuf>,
    recv_buffer: Vec<u8>,
}

impl GatewayConnection {
    /// Connection that can receive replies on a socket in `dir`
    pub fn bound(dir: &Path) -> LinkResult<Self> {
        let reply_path = reply_socket_path(dir);
        let socket = UnixDatagram::bind(&reply_path)?;
        debug!("Reply socket bound at {}", reply_path.display());
        Ok(Self {
            socket,
            reply_path: Some(reply_path),
            recv_buffer: vec![0u8; 1024],
        })
    }

    /// Send-only connection
    pub fn unbound() -> LinkResult<Self> {
        Ok(Self {
            socket: UnixDatagram::unbound()?,
            reply_path: None,
            recv_buffer: vec![0u8; 1024],
        })
    }

    pub fn reply_path(&self) -> Option<&Path> {
        self.reply_path.as_deref()
    }

    /// Send one datagram to the socket at `remote`
    pub fn send_to<P: AsRef<Path>>(&self, data: &[u8], remote: P) -> LinkResult<()> {
        let remote = remote.as_ref();
        let sent = self.socket.send_to(data, remote).map_err(|e| {
            if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused) {
                LinkError::config(format!("gateway socket {} is not listening", remote.display()))
            } else {
                LinkError::Io(e)
            }
        })?;
        if sent != data.len() {
            return Err(LinkError::protocol(format!("short datagram write: {} of {} bytes", sent, data.len())));
        }
        Ok(())
    }

    /// Receive one reply. `Ok(None)` when nothing arrived in time.
    pub fn receive_timeout(&mut self, timeout: Duration) -> LinkResult<Option<String>> {
        if self.reply_path.is_none() {
            return Err(LinkError::config("connection is not bound for replies"));
        }
        self.socket.set_read_timeout(Some(timeout))?;

        match self.socket.recv(&mut self.recv_buffer) {
            Ok(n) => Ok(Some(String::from_utf8_lossy(&self.recv_buffer[..n]).into_owned())),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(LinkError::Io(e)),
        }
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        if let Some(path) = &self.reply_path {
            let _ = fs::remove_file(path);
        }
    }
}
