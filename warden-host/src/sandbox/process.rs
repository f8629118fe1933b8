//! Child-process isolation: each plugin runs as its own OS process and
//! talks to the host over its stdin/stdout.

use super::isolate::{Conduit, InstanceLimiter, InstanceSlot, Isolate, IsolateRequest, IsolationBackend};
use crate::config::SandboxConfig;
use crate::error::{HostResult, PluginHostError};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};
use warden_protocol::{PROTOCOL_VERSION, env};

pub struct ProcessBackend {
    config: SandboxConfig,
    limiter: InstanceLimiter,
}

impl ProcessBackend {
    pub fn new(config: SandboxConfig) -> Self {
        let limiter = InstanceLimiter::new(config.max_instances);
        Self { config, limiter }
    }

    /// Isolates currently allocated.
    pub fn live_instances(&self) -> usize {
        self.limiter.live()
    }
}

impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn allocate(&self, request: &IsolateRequest) -> HostResult<Box<dyn Isolate>> {
        let slot = self
            .limiter
            .acquire()
            .ok_or_else(|| PluginHostError::SandboxCreation {
                plugin_id: request.plugin_id.clone(),
                reason: format!("process limit of {} reached", self.limiter.max()),
            })?;
        Ok(Box::new(ProcessIsolate {
            request: request.clone(),
            config: self.config.clone(),
            child: None,
            _slot: slot,
        }))
    }
}

struct ProcessIsolate {
    request: IsolateRequest,
    config: SandboxConfig,
    child: Option<Child>,
    _slot: InstanceSlot,
}

impl ProcessIsolate {
    fn command(&self, entry_point: &str) -> HostResult<Command> {
        let mut command = match &self.config.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.args(&self.config.interpreter_args).arg(entry_point);
                command
            }
            None => Command::new(entry_point),
        };

        // Plugins see only the variables handed to them explicitly
        command.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }
        command
            .env(env::PLUGIN_ID, &self.request.plugin_id)
            .env(env::SANDBOX_KIND, self.request.kind.as_str())
            .env(env::PROTOCOL_VERSION, PROTOCOL_VERSION.to_string());
        if let Some(policy) = &self.request.policy {
            command.env(env::CONTENT_POLICY, serde_json::to_string(policy)?);
        }
        command.envs(&self.config.env);

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if self.config.inherit_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        Ok(command)
    }

    fn creation_error(&self, reason: String) -> PluginHostError {
        PluginHostError::SandboxCreation {
            plugin_id: self.request.plugin_id.clone(),
            reason,
        }
    }
}

impl Isolate for ProcessIsolate {
    fn launch(&mut self, entry_point: &str) -> HostResult<Conduit> {
        if self.child.is_some() {
            return Err(self.creation_error("process already launched".into()));
        }

        let mut child = self
            .command(entry_point)?
            .spawn()
            .map_err(|e| self.creation_error(format!("failed to spawn '{entry_point}': {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.start_kill();
            return Err(self.creation_error("plugin process has no stdio pipes".into()));
        };

        info!(
            plugin_id = %self.request.plugin_id,
            pid = child.id().unwrap_or_default(),
            entry_point = %entry_point,
            "plugin process started"
        );
        self.child = Some(child);
        Ok(Conduit {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        })
    }

    fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(plugin_id = %self.request.plugin_id, error = %e, "plugin process already gone");
            }
        }
    }
}
