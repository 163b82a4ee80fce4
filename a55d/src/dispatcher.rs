//! RX dispatcher
//!
//! The only reader of the command channel. Raw bytes are framed into lines;
//! acknowledgments go to the correlator and everything else to the named
//! command handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use a55lib::{InboundLine, LineFramer, LinkResult};
use log::{debug, error, info, warn};

use crate::channel::{ChannelEvent, ChannelReader};
use crate::config::constants::{RX_CHUNK_SIZE, RX_ERROR_PAUSE};
use crate::correlator::Correlator;
use crate::handlers::CommandHandlers;

/// RX dispatcher state, moved onto its own thread by [`RxDispatcher::spawn`]
pub struct RxDispatcher {
    reader: ChannelReader,
    framer: LineFramer,
    correlator: Arc<Correlator>,
    handlers: Arc<CommandHandlers>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl RxDispatcher {
    pub fn new(
        reader: ChannelReader,
        correlator: Arc<Correlator>,
        handlers: Arc<CommandHandlers>,
        running: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            reader,
            framer: LineFramer::new(),
            correlator,
            handlers,
            running,
            poll_interval,
        }
    }

    /// Route one complete line
    pub fn dispatch_line(&self, line: &str) {
        debug!("RX {}", line);
        match InboundLine::classify(line) {
            Some(InboundLine::Ack(token)) => {
                self.correlator.resolve(token);
            }
            Some(InboundLine::Command(command)) => {
                // Collaborator threads finish on their own
                let _ = self.handlers.handle(command);
            }
            None => {}
        }
    }

    /// Feed a chunk read from the channel and dispatch every complete line
    pub fn process_chunk(&mut self, chunk: &[u8]) {
        let discarded = self.framer.push(chunk);
        if discarded > 0 {
            warn!("Discarded {} bytes of unterminated input", discarded);
        }
        while let Some(line) = self.framer.next_line() {
            self.dispatch_line(&line);
        }
    }

    /// Read and dispatch until the running flag clears
    pub fn run(mut self) {
        let mut buf = vec![0u8; RX_CHUNK_SIZE];
        info!("RX dispatcher started");

        while self.running.load(Ordering::SeqCst) {
            match self.reader.wait_readable(self.poll_interval) {
                Ok(ChannelEvent::Timeout) => continue,
                Ok(ChannelEvent::ReadReady) => match self.reader.read(&mut buf) {
                    Ok(Some(0)) => {
                        debug!("Channel returned no data");
                        thread::sleep(RX_ERROR_PAUSE);
                    }
                    Ok(Some(n)) => self.process_chunk(&buf[..n]),
                    Ok(None) => continue,
                    Err(e) => {
                        error!("RX read error: {}", e);
                        thread::sleep(RX_ERROR_PAUSE);
                    }
                },
                Ok(ChannelEvent::Error) => {
                    warn!("RX channel reported hangup or error");
                    thread::sleep(RX_ERROR_PAUSE);
                }
                Err(e) => {
                    error!("RX poll error: {}", e);
                    thread::sleep(RX_ERROR_PAUSE);
                }
            }
        }

        info!("RX dispatcher stopped");
    }

    /// Start the dispatcher on a named thread
    pub fn spawn(self) -> LinkResult<JoinHandle<()>> {
        Ok(thread::Builder::new()
            .name("a55-rx".to_string())
            .spawn(move || self.run())?)
    }
}
