//! Running external collaborators with a time limit

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use a55lib::{LinkError, LinkResult};
use log::{debug, warn};

use crate::config::constants::CHILD_POLL_STEP;

/// A collaborator that ran to completion
#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    /// Combined stdout and stderr, lossily decoded
    pub output: String,
}

/// Forward a pipe's contents in chunks until end of file
fn drain<R: Read + Send + 'static>(pipe: Option<R>, tx: &Sender<Vec<u8>>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let tx = tx.clone();
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Gather output until every pipe closes or `deadline` passes.
///
/// Background processes started by the child can keep a pipe open past
/// its exit; their readers are left detached.
fn collect(rx: Receiver<Vec<u8>>, deadline: Instant) -> Vec<u8> {
    let mut output = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(chunk) => output.extend(chunk),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                debug!("Collaborator output still open at the time limit, not waiting");
                break;
            }
        }
    }
    output
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill collaborator {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

/// Spawn `command` and wait for it at most `timeout`.
///
/// Launch failures come back as [`LinkError::Io`]; overrunning the limit
/// kills the child and returns [`LinkError::Timeout`].
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> LinkResult<Finished> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let (tx, rx) = channel();
    drain(child.stdout.take(), &tx);
    drain(child.stderr.take(), &tx);
    drop(tx);
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                // Grandchildren may still hold the pipes, so the readers are left detached
                kill(&mut child);
                return Err(LinkError::Timeout);
            }
            Ok(None) => thread::sleep(CHILD_POLL_STEP),
            Err(e) => {
                kill(&mut child);
                return Err(LinkError::Io(e));
            }
        }
    };

    // Output already written by a child that exited at the limit still counts
    let output = collect(rx, deadline.max(Instant::now() + CHILD_POLL_STEP));

    Ok(Finished {
        status,
        output: String::from_utf8_lossy(&output).into_owned(),
    })
}
