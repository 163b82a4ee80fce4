//! Local gateway
//!
//! Datagram sockets through which other host processes reach the
//! co-processor. The command socket forwards each datagram synchronously
//! and, when the peer is bound to a path, replies with the outcome. The
//! event socket turns `EVENT <name> <value>` into a queued command.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use a55lib::{
    EventMessage, FramePrefix, GatewayReply, LinkError, LinkResult, MAX_COMMAND_DATAGRAM, MAX_EVENT_DATAGRAM,
};
use log::{debug, error, info, warn};

use crate::retry_queue::RetryQueue;
use crate::sender::{CommandSink, SendOutcome};

/// Bind a world-writable datagram socket, replacing any stale socket file
pub fn bind_socket<P: AsRef<Path>>(path: P, read_timeout: Duration) -> LinkResult<UnixDatagram> {
    let path = path.as_ref();
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(LinkError::Io(e)),
    }

    let socket = UnixDatagram::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;
    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket)
}

/// Receive one datagram; `Ok(None)` when the read timeout expired
fn receive(socket: &UnixDatagram, buf: &mut [u8]) -> LinkResult<Option<(usize, SocketAddr)>> {
    match socket.recv_from(buf) {
        Ok(received) => Ok(Some(received)),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
            Ok(None)
        }
        Err(e) => Err(LinkError::Io(e)),
    }
}

fn datagram_text(data: &[u8]) -> LinkResult<&str> {
    std::str::from_utf8(data)
        .map(str::trim)
        .map_err(|_| LinkError::protocol("datagram is not valid UTF-8"))
}

/// Command intake: one command per datagram, forwarded with an acknowledgment wait
pub struct CommandIntake {
    socket: UnixDatagram,
    path: PathBuf,
    sink: Arc<dyn CommandSink>,
    ack_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl CommandIntake {
    pub fn bind<P: AsRef<Path>>(
        path: P,
        sink: Arc<dyn CommandSink>,
        ack_timeout: Duration,
        poll_interval: Duration,
        running: Arc<AtomicBool>,
    ) -> LinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        let socket = bind_socket(&path, poll_interval)?;
        info!("Command socket listening on {}", path.display());
        Ok(Self {
            socket,
            path,
            sink,
            ack_timeout,
            running,
        })
    }

    /// Forward one datagram. `None` for an empty datagram.
    pub fn handle_datagram(&self, data: &[u8]) -> Option<GatewayReply> {
        let text = match datagram_text(data) {
            Ok("") => return None,
            Ok(text) => text,
            Err(e) => {
                warn!("Command socket: {}", e);
                return Some(GatewayReply::Error(e.to_string()));
            }
        };

        info!("Command from local process: {}", text);
        let reply = match self.sink.send(text, FramePrefix::Request, self.ack_timeout, true) {
            Ok(SendOutcome::Acked) | Ok(SendOutcome::Sent) => GatewayReply::Ok,
            Ok(SendOutcome::TimedOut) => GatewayReply::Timeout,
            Err(e) => {
                error!("Forwarding {} failed: {}", text, e);
                GatewayReply::Error(e.to_string())
            }
        };
        Some(reply)
    }

    pub fn run(self) {
        let mut buf = vec![0u8; MAX_COMMAND_DATAGRAM];

        while self.running.load(Ordering::SeqCst) {
            match receive(&self.socket, &mut buf) {
                Ok(Some((n, peer))) => {
                    let Some(reply) = self.handle_datagram(&buf[..n]) else {
                        continue;
                    };
                    if let Some(peer_path) = peer.as_pathname() {
                        if let Err(e) = self.socket.send_to(reply.to_text().as_bytes(), peer_path) {
                            debug!("Reply to {} failed: {}", peer_path.display(), e);
                        }
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    error!("Command socket receive failed: {}", e);
                    thread::sleep(Duration::from_millis(500));
                }
            }
        }

        let _ = fs::remove_file(&self.path);
        info!("Command socket closed");
    }

    pub fn spawn(self) -> LinkResult<JoinHandle<()>> {
        Ok(thread::Builder::new()
            .name("a55-cmd-sock".to_string())
            .spawn(move || self.run())?)
    }
}

/// Event intake: `EVENT <name> <value>` datagrams pushed onto the retry queue
pub struct EventIntake {
    socket: UnixDatagram,
    path: PathBuf,
    queue: RetryQueue,
    attempts: u32,
    running: Arc<AtomicBool>,
}

impl EventIntake {
    pub fn bind<P: AsRef<Path>>(
        path: P,
        queue: RetryQueue,
        attempts: u32,
        poll_interval: Duration,
        running: Arc<AtomicBool>,
    ) -> LinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        let socket = bind_socket(&path, poll_interval)?;
        info!("Event socket listening on {}", path.display());
        Ok(Self {
            socket,
            path,
            queue,
            attempts,
            running,
        })
    }

    /// Parse and queue one event datagram
    pub fn handle_datagram(&self, data: &[u8]) -> LinkResult<()> {
        let text = datagram_text(data)?;
        if text.is_empty() {
            return Ok(());
        }

        let event = EventMessage::parse(text)?;
        let command = event.to_command();
        self.queue.enqueue(command.as_str(), self.attempts)?;
        debug!("Queued event command {}", command);
        Ok(())
    }

    pub fn run(self) {
        let mut buf = vec![0u8; MAX_EVENT_DATAGRAM];

        while self.running.load(Ordering::SeqCst) {
            match receive(&self.socket, &mut buf) {
                Ok(Some((n, _))) => match self.handle_datagram(&buf[..n]) {
                    Ok(()) => {}
                    // Already logged by the queue
                    Err(LinkError::QueueFull(_)) => {}
                    Err(e) => warn!("Event dropped: {}", e),
                },
                Ok(None) => continue,
                Err(e) => {
                    error!("Event socket receive failed: {}", e);
                    thread::sleep(Duration::from_millis(500));
                }
            }
        }

        let _ = fs::remove_file(&self.path);
        info!("Event socket closed");
    }

    pub fn spawn(self) -> LinkResult<JoinHandle<()>> {
        Ok(thread::Builder::new()
            .name("a55-evt-sock".to_string())
            .spawn(move || self.run())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::tests::MockSink;
    use tempfile::TempDir;

    fn running() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn test_bind_replaces_stale_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        fs::write(&path, b"leftover").unwrap();

        let _socket = bind_socket(&path, Duration::from_millis(10)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }

    #[test]
    fn test_command_replies() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MockSink::scripted(
            vec![Ok(SendOutcome::Acked), Ok(SendOutcome::TimedOut), Err(LinkError::Shutdown)],
            SendOutcome::Acked,
        ));
        let sink_dyn: Arc<dyn CommandSink> = sink.clone();
        let intake = CommandIntake::bind(
            dir.path().join("cmd.sock"),
            sink_dyn,
            Duration::from_millis(10),
            Duration::from_millis(10),
            running(),
        )
        .unwrap();

        assert_eq!(intake.handle_datagram(b"capture_now 1\n"), Some(GatewayReply::Ok));
        assert_eq!(intake.handle_datagram(b"x"), Some(GatewayReply::Timeout));
        assert!(matches!(intake.handle_datagram(b"y"), Some(GatewayReply::Error(_))));
        assert_eq!(intake.handle_datagram(b"  \n"), None);
        assert!(matches!(intake.handle_datagram(b"\xff\xfe"), Some(GatewayReply::Error(_))));

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0], ("capture_now 1".to_string(), FramePrefix::Request, true));
        assert_eq!(sent.len(), 3);
    }

    #[test]
    fn test_command_socket_round_trip() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MockSink::new(SendOutcome::Acked));
        let sink_dyn: Arc<dyn CommandSink> = sink.clone();
        let flag = running();
        let sock_path = dir.path().join("cmd.sock");
        let handle = CommandIntake::bind(&sock_path, sink_dyn, Duration::from_millis(10), Duration::from_millis(10), Arc::clone(&flag))
            .unwrap()
            .spawn()
            .unwrap();

        let client = UnixDatagram::bind(dir.path().join("client.sock")).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.send_to(b"led_on 1", &sock_path).unwrap();

        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(GatewayReply::parse(std::str::from_utf8(&buf[..n]).unwrap()).unwrap(), GatewayReply::Ok);
        assert_eq!(sink.sent_commands(), vec!["led_on 1".to_string()]);

        flag.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(!sock_path.exists());
    }

    #[test]
    fn test_events_queued() {
        let dir = TempDir::new().unwrap();
        let (queue, rx) = RetryQueue::bounded(1);
        let intake = EventIntake::bind(dir.path().join("evt.sock"), queue, 2, Duration::from_millis(10), running()).unwrap();

        intake.handle_datagram(b"EVENT door open\n").unwrap();
        assert!(matches!(intake.handle_datagram(b"EVENT door"), Err(LinkError::Protocol(_))));
        assert!(matches!(intake.handle_datagram(b"EVENT lid closed"), Err(LinkError::QueueFull(_))));

        let entries: Vec<_> = rx.try_iter().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command, "door open");
        assert_eq!(entries[0].attempts, 2);
    }
}
