//! Handlers for named commands sent by the co-processor

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use a55lib::{parse_param_updates, CaptureMode, FramePrefix, InboundCommand, LinkError, LinkResult};
use log::{debug, error, info, warn};

use crate::collaborator::run_with_timeout;
use crate::config::{CaptureConfig, DaemonConfig};
use crate::param_store::ParamStore;
use crate::sender::CommandSink;

/// Shell used to run `a55_exec` scripts
const SCRIPT_SHELL: &str = "/bin/sh";

/// Named-command handlers
pub struct CommandHandlers {
    sink: Arc<dyn CommandSink>,
    params: Arc<ParamStore>,
    tools_dir: PathBuf,
    exec_timeout: Duration,
    capture: CaptureConfig,
}

impl CommandHandlers {
    pub fn new(sink: Arc<dyn CommandSink>, params: Arc<ParamStore>, config: &DaemonConfig) -> Self {
        Self {
            sink,
            params,
            tools_dir: config.tools_dir.clone(),
            exec_timeout: config.exec_timeout(),
            capture: config.capture.clone(),
        }
    }

    /// Handle one command. Collaborators run on their own thread so the
    /// caller can keep reading; their handle is returned.
    pub fn handle(self: &Arc<Self>, command: InboundCommand) -> Option<JoinHandle<()>> {
        match command {
            InboundCommand::Ping => {
                self.respond("a55_pong");
                None
            }
            InboundCommand::Exec { script } => {
                let handlers = Arc::clone(self);
                Some(thread::spawn(move || {
                    let reply = handlers.exec(script.as_deref());
                    handlers.respond(&reply);
                }))
            }
            InboundCommand::UpdateParam { pairs } => {
                self.update_params(&pairs);
                None
            }
            InboundCommand::Capture { index: Some(index) } => {
                let handlers = Arc::clone(self);
                Some(thread::spawn(move || {
                    if let Err(e) = handlers.capture(index) {
                        error!("Capture {} failed: {}", index, e);
                    }
                }))
            }
            InboundCommand::Capture { index: None } => {
                warn!("capture without a valid camera index, ignored");
                None
            }
            InboundCommand::Unknown { name } => {
                warn!("Unknown command from co-processor: {}", name);
                None
            }
        }
    }

    fn respond(&self, body: &str) {
        if let Err(e) = self.sink.send(body, FramePrefix::Response, Duration::ZERO, false) {
            error!("Failed to send response -{}: {}", body, e);
        }
    }

    /// Resolve a script name inside the tools directory
    pub fn resolve_script(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return None;
        }

        let root = self.tools_dir.canonicalize().ok()?;
        let path = root.join(name).canonicalize().ok()?;
        (path.starts_with(&root) && path.is_file()).then_some(path)
    }

    /// Run an `a55_exec` script and build the reply body
    pub fn exec(&self, script: Option<&str>) -> String {
        let Some(name) = script else {
            return "Error: missing script name".to_string();
        };
        let Some(path) = self.resolve_script(name) else {
            warn!("a55_exec: no script {} under {}", name, self.tools_dir.display());
            return format!("Error: script not found {}", name);
        };

        info!("Running script {}", path.display());
        match run_with_timeout(Command::new(SCRIPT_SHELL).arg(&path), self.exec_timeout) {
            Ok(finished) if finished.status.success() => {
                debug!("Script {} output:\n{}", name, finished.output);
                format!("exec done: {}", name)
            }
            Ok(finished) => {
                debug!("Script {} output:\n{}", name, finished.output);
                match finished.status.code() {
                    Some(code) => format!("exec failed: {}", code),
                    None => format!("exec failed: {}", finished.status),
                }
            }
            Err(LinkError::Timeout) => {
                format!("exec exception: timed out after {}s", self.exec_timeout.as_secs())
            }
            Err(e) => format!("exec exception: {}", e),
        }
    }

    /// Apply an `update_param` payload. Returns records stored.
    pub fn update_params(&self, pairs: &str) -> usize {
        let batch = parse_param_updates(pairs);
        for bad in &batch.rejected {
            warn!("Invalid parameter pair skipped: {}", bad);
        }

        match self.params.upsert_many(&batch.records) {
            Ok(n) => {
                if n > 0 {
                    info!("Updated {} parameter(s)", n);
                }
                n
            }
            Err(e) => {
                error!("Parameter store update failed: {}", e);
                0
            }
        }
    }

    /// Run the capture collaborator for one camera
    pub fn capture(&self, index: u32) -> LinkResult<()> {
        let mode = CaptureMode::for_index(index);
        let mut command = Command::new(&self.capture.program);
        command.args(&self.capture.args).arg(index.to_string()).arg(mode.as_flag());

        info!("Capture {} ({})", index, mode.as_flag());
        let finished = run_with_timeout(&mut command, self.capture.timeout())?;
        debug!("Capture output:\n{}", finished.output);

        if finished.status.success() {
            Ok(())
        } else {
            Err(LinkError::collaborator(format!("capture exited with {}", finished.status)))
        }
    }
}
