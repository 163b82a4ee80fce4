//! Daemon context and supervision
//!
//! All shared state is built once in [`DaemonContext`] and handed to the
//! workers at startup. The supervisor watches the workers and the channel,
//! and on exit performs the ordered shutdown: stop the loops, join each
//! worker with a bounded wait, then drop the devices.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use a55lib::{LinkError, LinkResult, TransferStatistics};
use log::{error, info, warn};

use crate::channel::{open_channel, split, ChannelReader};
use crate::config::DaemonConfig;
use crate::correlator::Correlator;
use crate::dispatcher::RxDispatcher;
use crate::file_receiver::FileReceiver;
use crate::gateway::{CommandIntake, EventIntake};
use crate::handlers::CommandHandlers;
use crate::param_store::ParamStore;
use crate::retry_queue::{RetryEntry, RetryQueue, RetryWorker};
use crate::sender::{CommandSender, CommandSink};
use crate::shared_region::{open_device, query_dma_info, SharedRegion};
use crate::wait::wait_for_resource;

/// Shared daemon state
pub struct DaemonContext {
    pub config: DaemonConfig,
    pub running: Arc<AtomicBool>,
    pub correlator: Arc<Correlator>,
    pub sender: Arc<CommandSender>,
    pub params: Arc<ParamStore>,
    pub queue: RetryQueue,
    reader: Option<ChannelReader>,
    queue_rx: Option<Receiver<RetryEntry>>,
}

impl DaemonContext {
    /// Build the context around an open command channel
    pub fn new(config: DaemonConfig, channel: File, running: Arc<AtomicBool>) -> LinkResult<Self> {
        let (reader, writer) = split(channel);
        let correlator = Arc::new(Correlator::new());
        let sender = Arc::new(CommandSender::new(writer, Arc::clone(&correlator)));
        let params = Arc::new(ParamStore::open(&config.param_store_path)?);
        let (queue, queue_rx) = RetryQueue::bounded(config.queue_capacity);

        Ok(Self {
            config,
            running,
            correlator,
            sender,
            params,
            queue,
            reader: Some(reader),
            queue_rx: Some(queue_rx),
        })
    }

    fn sink(&self) -> Arc<dyn CommandSink> {
        self.sender.clone()
    }

    /// Start every worker. May only be called once.
    pub fn start(&mut self) -> LinkResult<Workers> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| LinkError::channel("workers already started"))?;
        let queue_rx = self
            .queue_rx
            .take()
            .ok_or_else(|| LinkError::channel("workers already started"))?;
        let config = &self.config;
        let mut workers = Workers::default();

        let handlers = Arc::new(CommandHandlers::new(self.sink(), Arc::clone(&self.params), config));
        let rx = RxDispatcher::new(
            reader,
            Arc::clone(&self.correlator),
            handlers,
            Arc::clone(&self.running),
            config.poll_interval(),
        );
        workers.push("RX dispatcher", rx.spawn()?);

        let retry = RetryWorker::new(
            queue_rx,
            self.sink(),
            config.ack_timeout(),
            config.retry_pause(),
            config.poll_interval(),
            Arc::clone(&self.running),
        );
        workers.push("retry worker", retry.spawn()?);

        let commands = CommandIntake::bind(
            &config.command_socket,
            self.sink(),
            config.command_ack_timeout(),
            config.poll_interval(),
            Arc::clone(&self.running),
        )?;
        workers.push("command socket", commands.spawn()?);

        let events = EventIntake::bind(
            &config.event_socket,
            self.queue.clone(),
            config.event_attempts,
            config.poll_interval(),
            Arc::clone(&self.running),
        )?;
        workers.push("event socket", events.spawn()?);

        let file_config = config.clone();
        let running = Arc::clone(&self.running);
        workers.files = Some(
            thread::Builder::new()
                .name("a55-files".to_string())
                .spawn(move || run_file_receiver(file_config, running))?,
        );

        info!("All workers started");
        Ok(workers)
    }
}

/// Acquire the shared region device and receive files until stopped
fn run_file_receiver(config: DaemonConfig, running: Arc<AtomicBool>) -> LinkResult<TransferStatistics> {
    let acquired = wait_for_resource(
        || {
            let device = open_device(&config.dma_device)?;
            let info = query_dma_info(&device)?;
            info!(
                "Shared region at {:#x}, {} bytes ({} MiB)",
                info.phys_addr,
                info.size,
                info.size / (1024 * 1024)
            );
            let region = SharedRegion::map(&device, info)?;
            Ok((device, region))
        },
        config.device_retry(),
        &running,
        "shared region device",
    )?;

    let Some((device, region)) = acquired else {
        return Ok(TransferStatistics::new());
    };

    let receiver = FileReceiver::new(
        device,
        region,
        config.output_dir.clone(),
        config.notification_layout,
        Arc::clone(&running),
        config.poll_interval(),
        config.stats_interval(),
    );
    Ok(receiver.run())
}

/// Handles of running workers
#[derive(Default)]
pub struct Workers {
    command_path: Vec<(&'static str, JoinHandle<()>)>,
    files: Option<JoinHandle<LinkResult<TransferStatistics>>>,
}

impl Workers {
    fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.command_path.push((name, handle));
    }

    /// First worker that ended while it should still be running
    fn check(&mut self) -> LinkResult<()> {
        if let Some((name, _)) = self.command_path.iter().find(|(_, h)| h.is_finished()) {
            return Err(LinkError::channel(format!("{} exited unexpectedly", name)));
        }

        if self.files.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = self.files.take() {
                return match handle.join() {
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(_)) => Err(LinkError::channel("file receiver exited unexpectedly")),
                    Err(_) => Err(LinkError::channel("file receiver panicked")),
                };
            }
        }

        Ok(())
    }

    /// Join every worker, waiting at most `timeout` for each
    fn join_all(self, timeout: Duration) {
        for (name, handle) in self.command_path {
            if join_bounded(name, handle, timeout).is_none() {
                warn!("{} did not stop within {:?}", name, timeout);
            }
        }

        if let Some(handle) = self.files {
            match join_bounded("file receiver", handle, timeout) {
                Some(Ok(stats)) => info!(
                    "File receiver totals: {} file(s), {} bytes, {} rejected",
                    stats.files_received, stats.total_bytes, stats.rejected
                ),
                Some(Err(e)) => warn!("File receiver ended with error: {}", e),
                None => warn!("file receiver did not stop within {:?}", timeout),
            }
        }
    }
}

/// Join a thread if it finishes within `timeout`; otherwise leave it detached
pub fn join_bounded<T>(name: &str, handle: JoinHandle<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }

    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!("{} panicked", name);
            None
        }
    }
}

/// The a55d daemon
pub struct Daemon {
    config: DaemonConfig,
    running: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag cleared to request shutdown
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Acquire the devices, run until stopped, then shut down in order.
    /// Returns an error only for the conditions that must end the daemon.
    pub fn run(&mut self) -> LinkResult<()> {
        let tty = self.config.tty_device.clone();
        let channel = wait_for_resource(
            || open_channel(&tty),
            self.config.device_retry(),
            &self.running,
            "command channel",
        )?;
        let Some(channel) = channel else {
            info!("Stopped before the command channel was ready");
            return Ok(());
        };

        let mut context = DaemonContext::new(self.config.clone(), channel, Arc::clone(&self.running))?;
        let mut workers = match context.start() {
            Ok(workers) => workers,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let result = self.supervise(&context, &mut workers);
        if let Err(e) = &result {
            error!("Fatal: {}", e);
        }
        self.shutdown(context, workers);
        result
    }

    fn supervise(&self, context: &DaemonContext, workers: &mut Workers) -> LinkResult<()> {
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(self.config.poll_interval());

            if !context.sender.is_healthy() {
                return Err(LinkError::channel("unrecoverable write failure on command channel"));
            }
            if self.running.load(Ordering::SeqCst) {
                workers.check()?;
            }
        }
        Ok(())
    }

    fn shutdown(&self, context: DaemonContext, workers: Workers) {
        info!("Shutting down");
        self.running.store(false, Ordering::SeqCst);
        context.sender.close();

        workers.join_all(self.config.shutdown_join());

        let held = context.correlator.pending_early();
        if held > 0 {
            warn!("{} acknowledgment(s) never claimed", held);
        }
        drop(context);
        info!("Devices released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::{UnixDatagram, UnixStream};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> DaemonConfig {
        DaemonConfig {
            tty_device: dir.path().join("tty"),
            dma_device: dir.path().join("dma"),
            output_dir: dir.path().join("out"),
            param_store_path: dir.path().join("params.json"),
            command_socket: dir.path().join("cmd.sock"),
            event_socket: dir.path().join("evt.sock"),
            tools_dir: dir.path().to_path_buf(),
            poll_interval_ms: 20,
            device_retry_ms: 10,
            shutdown_join_ms: 2_000,
            ack_timeout_ms: 100,
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn test_join_bounded() {
        let quick = thread::spawn(|| 7);
        assert_eq!(join_bounded("quick", quick, Duration::from_secs(1)), Some(7));

        let slow = thread::spawn(|| thread::sleep(Duration::from_millis(500)));
        assert_eq!(join_bounded("slow", slow, Duration::from_millis(20)), None);
    }

    #[test]
    fn test_stop_while_waiting_for_channel() {
        let dir = TempDir::new().unwrap();
        let mut daemon = Daemon::new(test_config(&dir));
        let flag = daemon.running_flag();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(false, Ordering::SeqCst);
        });
        assert!(daemon.run().is_ok());
        stopper.join().unwrap();
    }

    #[test]
    fn test_context_workers_end_to_end() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let running = Arc::new(AtomicBool::new(true));

        let (ours, mut peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mut context = DaemonContext::new(config.clone(), File::from(OwnedFd::from(ours)), Arc::clone(&running)).unwrap();
        let mut workers = context.start().unwrap();

        // An event becomes a queued `#` command; the peer acknowledges it
        let producer = UnixDatagram::unbound().unwrap();
        producer.send_to(b"EVENT door open", &config.event_socket).unwrap();

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 64];
        let n = std::io::Read::read(&mut peer, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"#door open\r");
        std::io::Write::write_all(&mut peer, b"OK\r\nupdate_param 0x10=5\r\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while context.params.get(0x10).unwrap().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(context.params.get(0x10).unwrap(), Some(5));
        assert!(workers.check().is_ok());

        running.store(false, Ordering::SeqCst);
        context.sender.close();
        workers.join_all(Duration::from_secs(2));
        assert!(!config.command_socket.exists());
    }
}
