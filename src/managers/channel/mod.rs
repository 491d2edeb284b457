//! Authenticated channels to targets.
//!
//! A connector turns a [`Target`] into a boxed [`Channel`] or a
//! [`ChannelError`]; it never returns a half-open channel. The dispatcher
//! holds channels through [`ChannelGuard`] so they close on every path.

pub mod protocol;
pub mod ssh;
pub mod tls;

use crate::errors::{ChannelError, FleetError};
use crate::model::{AgentRequest, AgentResponse, ExecutionOutcome, ExecutionUnit, ResponseState, Target};
use crate::services::config::{FleetConfig, TransportKind};
use crate::services::logger::Logger;
use crate::services::trust_store::{HostKeyPolicy, TrustStore};
use crate::utils::fs_atomic::write_local_file;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use ssh::{SshConnector, SshSettings};
pub use tls::{TlsConnector, TlsSettings};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

impl CommandResult {
    fn from_agent(response: &AgentResponse) -> Self {
        let exit_code = match response.exit_code {
            Some(code) => i64::from(code),
            None if response.state == ResponseState::Failed => 1,
            None => 0,
        };
        let mut stdout = response.content_text();
        if stdout.is_empty() {
            stdout = response.message.clone();
        }
        Self {
            exit_code,
            stdout,
            stderr: String::new(),
            truncated: false,
        }
    }

    /// stdout followed by stderr, as shown in the report.
    pub fn output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        if self.truncated {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("[output truncated]");
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Restart,
    Start,
    Stop,
    Status,
}

impl ServiceAction {
    pub fn request(self, name: &str) -> AgentRequest {
        let name = name.to_string();
        match self {
            ServiceAction::Restart => AgentRequest::ServiceRestart { name },
            ServiceAction::Start => AgentRequest::ServiceStart { name },
            ServiceAction::Stop => AgentRequest::ServiceStop { name },
            ServiceAction::Status => AgentRequest::ServiceStatus { name },
        }
    }
}

/// Uniform capability over an established connection.
///
/// `request` is the only required transport hook; the typed operations
/// are sugar over it. Transports that can run shell commands natively
/// override `run_shell`.
pub trait Channel: Send {
    /// Identity of the remote end, `address:port`.
    fn peer(&self) -> &str;

    fn request(&mut self, request: &AgentRequest) -> Result<AgentResponse, ChannelError>;

    fn run_shell(&mut self, command: &str) -> Result<CommandResult, ChannelError> {
        self.run_command("/bin/sh", &["-c".to_string(), command.to_string()])
    }

    fn run_command(&mut self, name: &str, args: &[String]) -> Result<CommandResult, ChannelError> {
        let response = self.request(&AgentRequest::run_command(name, args.to_vec()))?;
        Ok(CommandResult::from_agent(&response))
    }

    fn invoke_service(
        &mut self,
        action: ServiceAction,
        name: &str,
    ) -> Result<AgentResponse, ChannelError> {
        self.request(&action.request(name))
    }

    fn read_file(&mut self, path: &str) -> Result<AgentResponse, ChannelError> {
        self.request(&AgentRequest::FileRead {
            path: path.to_string(),
        })
    }

    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<AgentResponse, ChannelError> {
        self.request(&AgentRequest::file_copy(path, path, Some(content), false, true))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<AgentResponse, ChannelError> {
        self.request(&AgentRequest::FileChmod {
            path: path.to_string(),
            mode,
        })
    }

    /// Idempotent.
    fn close(&mut self);
}

/// Raised when nobody waits for a target any more. Connectors and the
/// channels they hand out poll it between blocking steps and give up with
/// [`ChannelError::Aborted`].
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, operation: &str) -> Result<(), ChannelError> {
        if self.is_aborted() {
            return Err(ChannelError::aborted(operation));
        }
        Ok(())
    }
}

/// Builds channels. Called from blocking worker threads.
pub trait ChannelConnector: Send + Sync {
    /// Connect and authenticate before `deadline`, or fail. The returned
    /// channel keeps watching `abort` for the rest of its life.
    fn connect(
        &self,
        target: &Target,
        deadline: Instant,
        abort: &AbortSignal,
    ) -> Result<Box<dyn Channel>, ChannelError>;
}

/// Owns a channel for one target and closes it when dropped.
pub struct ChannelGuard {
    channel: Box<dyn Channel>,
}

impl ChannelGuard {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self { channel }
    }

    pub fn channel(&mut self) -> &mut dyn Channel {
        self.channel.as_mut()
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.channel.close();
    }
}

/// Runs `unit` on an open channel and classifies the result.
///
/// A remote-to-local copy lands in `<dst>.<target name>` so that fanning
/// out over many targets never overwrites one file.
pub fn execute_unit(
    channel: &mut dyn Channel,
    target: &Target,
    unit: &ExecutionUnit,
) -> Result<ExecutionOutcome, ChannelError> {
    match unit {
        ExecutionUnit::Shell { command } => {
            let result = channel.run_shell(command)?;
            Ok(ExecutionOutcome::from_exit(result.exit_code, result.output()))
        }
        ExecutionUnit::Agent(
            request @ AgentRequest::FileCopy {
                dst,
                remote_src: true,
                remote_dst: false,
                ..
            },
        ) => {
            let response = channel.request(request)?;
            if matches!(
                response.state,
                ResponseState::Failed | ResponseState::NotFound
            ) {
                return Ok(ExecutionOutcome::from_agent(request, &response));
            }
            let bytes = response.content_bytes();
            let local = format!("{}.{}", dst, target.name);
            match write_local_file(&local, &bytes, 0o644) {
                Ok(()) => Ok(ExecutionOutcome::success(format!(
                    "copied {} bytes to {}",
                    bytes.len(),
                    local
                ))),
                Err(err) => Ok(ExecutionOutcome::error(format!(
                    "failed to write {}: {}",
                    local, err
                ))),
            }
        }
        ExecutionUnit::Agent(request) => {
            let response = channel.request(request)?;
            Ok(ExecutionOutcome::from_agent(request, &response))
        }
    }
}

enum Transport {
    Tunneled(SshConnector),
    DirectTls(TlsConnector),
}

/// Resolves the dial address for a target and hands off to the selected
/// transport.
pub struct SecureChannelBuilder {
    transport: Transport,
    use_private_address: bool,
    logger: Logger,
}

impl SecureChannelBuilder {
    pub fn tunneled(connector: SshConnector, use_private_address: bool, logger: Logger) -> Self {
        Self {
            transport: Transport::Tunneled(connector),
            use_private_address,
            logger: logger.child("channel"),
        }
    }

    pub fn direct_tls(connector: TlsConnector, use_private_address: bool, logger: Logger) -> Self {
        Self {
            transport: Transport::DirectTls(connector),
            use_private_address,
            logger: logger.child("channel"),
        }
    }

    /// Wires the transport named by `config`. Key material and
    /// certificates are read once here, not per target.
    pub fn from_config(
        config: &FleetConfig,
        trust: TrustStore,
        logger: Logger,
    ) -> Result<Self, FleetError> {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let exec_timeout = Duration::from_millis(config.exec_timeout_ms);
        match config.transport {
            TransportKind::Tunneled => {
                let private_key = std::fs::read_to_string(&config.private_key_path).map_err(|err| {
                    FleetError::invalid_params(format!(
                        "Failed to read private key {}: {}",
                        config.private_key_path.display(),
                        err
                    ))
                    .with_hint("Run `fleetrun key new` first or set private_key_path in the config.")
                })?;
                let settings = SshSettings {
                    user: config.ssh_user(),
                    port: config.ssh_port,
                    agent_port: config.agent_port,
                    private_key,
                    passphrase: None,
                    connect_timeout,
                    exec_timeout,
                    host_key_policy: HostKeyPolicy::from_verify_flag(config.verify_host_keys),
                    auth_retry: config.auth_retry.clone(),
                };
                let connector = SshConnector::new(settings, trust, logger.clone());
                Ok(Self::tunneled(connector, config.use_private_address, logger))
            }
            TransportKind::DirectTls => {
                let settings = TlsSettings::from_paths(
                    &config.tls,
                    config.agent_port,
                    connect_timeout,
                    exec_timeout,
                )?;
                let connector = TlsConnector::new(settings)?;
                Ok(Self::direct_tls(connector, config.use_private_address, logger))
            }
        }
    }
}

impl ChannelConnector for SecureChannelBuilder {
    fn connect(
        &self,
        target: &Target,
        deadline: Instant,
        abort: &AbortSignal,
    ) -> Result<Box<dyn Channel>, ChannelError> {
        let Some(address) = target.address(self.use_private_address) else {
            return Err(ChannelError::Connect {
                address: String::new(),
                reason: format!(
                    "target {} has no {} address",
                    target.name,
                    if self.use_private_address {
                        "private"
                    } else {
                        "public"
                    }
                ),
            });
        };
        self.logger.debug(
            "building channel",
            Some(&serde_json::json!({ "target": target.name, "address": address })),
        );
        match &self.transport {
            Transport::Tunneled(connector) => {
                Ok(Box::new(connector.connect(address, deadline, abort)?))
            }
            Transport::DirectTls(connector) => {
                Ok(Box::new(connector.connect(address, deadline, abort)?))
            }
        }
    }
}

/// Time left before `deadline`, capped at `cap`. Errors once it has passed.
pub(crate) fn remaining(deadline: Instant, cap: Duration, operation: &str) -> Result<Duration, ChannelError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(ChannelError::timeout(operation, cap));
    }
    Ok(left.min(cap))
}
