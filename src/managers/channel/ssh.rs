use super::{protocol, remaining, AbortSignal, Channel, CommandResult};
use crate::constants::{limits, network};
use crate::errors::ChannelError;
use crate::model::{AgentRequest, AgentResponse};
use crate::services::logger::Logger;
use crate::services::retry::RetryPolicy;
use crate::services::trust_store::{HostKeyPolicy, TrustStore};
use base64::Engine;
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    pub agent_port: u16,
    /// OpenSSH private key text.
    pub private_key: String,
    pub passphrase: Option<String>,
    pub connect_timeout: Duration,
    pub exec_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
    pub auth_retry: RetryPolicy,
}

/// Opens authenticated SSH sessions, pinning host keys through the trust
/// store before any credential is offered.
#[derive(Clone)]
pub struct SshConnector {
    settings: SshSettings,
    trust: TrustStore,
    logger: Logger,
}

impl SshConnector {
    pub fn new(settings: SshSettings, trust: TrustStore, logger: Logger) -> Self {
        Self {
            settings,
            trust,
            logger: logger.child("ssh"),
        }
    }

    /// Connects to `address`. Authentication failures are retried under
    /// the auth policy because a freshly pushed key can take a while to
    /// reach the target; nothing else is retried.
    pub fn connect(
        &self,
        address: &str,
        deadline: Instant,
        abort: &AbortSignal,
    ) -> Result<SshChannel, ChannelError> {
        let peer = format!("{}:{}", address, self.settings.port);
        let session = self.settings.auth_retry.run_blocking(
            Some(deadline),
            ChannelError::is_auth,
            |attempt| {
                abort.check("ssh connect")?;
                if attempt > 1 {
                    self.logger.debug(
                        "retrying ssh authentication",
                        Some(&serde_json::json!({ "peer": peer, "attempt": attempt })),
                    );
                }
                self.connect_once(&peer, deadline, abort)
            },
        )?;
        Ok(SshChannel {
            session,
            peer,
            agent_port: self.settings.agent_port,
            exec_timeout: self.settings.exec_timeout,
            abort: abort.clone(),
            closed: false,
        })
    }

    fn connect_once(
        &self,
        peer: &str,
        deadline: Instant,
        abort: &AbortSignal,
    ) -> Result<Session, ChannelError> {
        let budget = remaining(deadline, self.settings.connect_timeout, "ssh connect")?;
        let addr = peer
            .to_socket_addrs()
            .map_err(|err| ChannelError::Connect {
                address: peer.to_string(),
                reason: err.to_string(),
            })?
            .next()
            .ok_or_else(|| ChannelError::Connect {
                address: peer.to_string(),
                reason: "address did not resolve".to_string(),
            })?;
        let tcp = TcpStream::connect_timeout(&addr, budget).map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                ChannelError::timeout(format!("connect to {}", peer), budget)
            } else {
                ChannelError::Connect {
                    address: peer.to_string(),
                    reason: err.to_string(),
                }
            }
        })?;
        tcp.set_read_timeout(Some(budget)).ok();
        tcp.set_write_timeout(Some(budget)).ok();

        let mut session = Session::new()
            .map_err(|err| ChannelError::transport(format!("failed to create ssh session: {}", err)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(duration_ms(budget));
        abort.check("ssh handshake")?;
        session
            .handshake()
            .map_err(|err| map_ssh_error(err, "ssh handshake", budget))?;

        let observed = fingerprint_host_key_sha256(&session).ok_or_else(|| {
            ChannelError::transport(format!("{} presented no host key", peer))
        })?;
        self.trust
            .check(peer, &observed, self.settings.host_key_policy)?;

        abort.check("ssh authentication")?;
        session
            .userauth_pubkey_memory(
                &self.settings.user,
                None,
                &self.settings.private_key,
                self.settings.passphrase.as_deref(),
            )
            .map_err(|err| ChannelError::Auth {
                user: self.settings.user.clone(),
                reason: err.message().to_string(),
            })?;
        if !session.authenticated() {
            return Err(ChannelError::Auth {
                user: self.settings.user.clone(),
                reason: "server rejected the key".to_string(),
            });
        }
        session.set_timeout(duration_ms(self.settings.exec_timeout));
        Ok(session)
    }
}

/// Shell commands run over `exec`; agent requests travel through a
/// `direct-tcpip` forward to the agent on the target's loopback.
pub struct SshChannel {
    session: Session,
    peer: String,
    agent_port: u16,
    exec_timeout: Duration,
    abort: AbortSignal,
    closed: bool,
}

impl Channel for SshChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn request(&mut self, request: &AgentRequest) -> Result<AgentResponse, ChannelError> {
        self.abort.check("agent tunnel")?;
        self.session.set_blocking(true);
        self.session.set_timeout(duration_ms(self.exec_timeout));
        let mut channel = self
            .session
            .channel_direct_tcpip(network::AGENT_LOOPBACK_HOST, self.agent_port, None)
            .map_err(|err| map_ssh_error(err, "agent tunnel", self.exec_timeout))?;
        self.session
            .set_timeout(duration_ms(Duration::from_millis(network::ABORT_POLL_INTERVAL_MS)));
        let response =
            protocol::abortable_round_trip(&mut channel, request, self.exec_timeout, &self.abort);
        self.session.set_timeout(duration_ms(self.exec_timeout));
        let _ = channel.send_eof();
        let _ = channel.close();
        response
    }

    fn run_shell(&mut self, command: &str) -> Result<CommandResult, ChannelError> {
        exec_blocking(&self.session, command, self.exec_timeout, &self.abort)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.set_blocking(true);
        let _ = self.session.disconnect(None, "fleetrun done", None);
    }
}

/// Runs `command` on a fresh exec channel, polling stdout and stderr
/// without blocking so that the timeout and `abort` are honoured between
/// reads.
fn exec_blocking(
    session: &Session,
    command: &str,
    timeout: Duration,
    abort: &AbortSignal,
) -> Result<CommandResult, ChannelError> {
    abort.check("ssh exec")?;
    session.set_blocking(true);
    let mut channel = session
        .channel_session()
        .map_err(|err| map_ssh_error(err, "ssh channel", timeout))?;
    channel
        .exec(command)
        .map_err(|err| map_ssh_error(err, "ssh exec", timeout))?;
    session.set_blocking(false);

    let max_capture = limits::MAX_CAPTURE_BYTES;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut truncated = false;
    let mut stderr_stream = channel.stderr();
    let started = Instant::now();

    loop {
        let mut progressed = false;
        let mut buf = [0u8; 8192];
        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                truncated |= capture(&mut stdout, &buf[..n], max_capture);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                session.set_blocking(true);
                return Err(ChannelError::transport(format!("ssh stdout read failed: {}", err)));
            }
        }
        match stderr_stream.read(&mut buf) {
            Ok(n) if n > 0 => {
                truncated |= capture(&mut stderr, &buf[..n], max_capture);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                session.set_blocking(true);
                return Err(ChannelError::transport(format!("ssh stderr read failed: {}", err)));
            }
        }

        if channel.eof() {
            break;
        }
        if abort.is_aborted() {
            session.set_blocking(true);
            let _ = channel.close();
            return Err(ChannelError::aborted(format!("command `{}`", command)));
        }
        if started.elapsed() > timeout {
            session.set_blocking(true);
            let _ = channel.close();
            return Err(ChannelError::timeout(format!("command `{}`", command), timeout));
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(network::EXEC_POLL_INTERVAL_MS));
        }
    }

    session.set_blocking(true);
    let _ = channel.wait_close();
    let exit_code = i64::from(channel.exit_status().unwrap_or(-1));
    Ok(CommandResult {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        truncated,
    })
}

/// Appends up to the cap; returns true when bytes were dropped.
fn capture(into: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(into.len());
    if chunk.len() <= room {
        into.extend_from_slice(chunk);
        return false;
    }
    into.extend_from_slice(&chunk[..room]);
    true
}

fn fingerprint_host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

fn duration_ms(duration: Duration) -> u32 {
    duration.as_millis().min(u128::from(u32::MAX)) as u32
}

fn map_ssh_error(err: ssh2::Error, operation: &str, after: Duration) -> ChannelError {
    let io_err: std::io::Error = err.into();
    match io_err.kind() {
        std::io::ErrorKind::TimedOut => ChannelError::timeout(operation, after),
        _ => ChannelError::transport(format!("{} failed: {}", operation, io_err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_stops_at_cap() {
        let mut out = Vec::new();
        assert!(!capture(&mut out, b"abc", 5));
        assert!(capture(&mut out, b"defg", 5));
        assert_eq!(out, b"abcde");
        assert!(capture(&mut out, b"h", 5));
        assert_eq!(out, b"abcde");
    }

    #[test]
    fn unreachable_address_fails_without_channel() {
        let connector = SshConnector::new(
            SshSettings {
                user: "root".to_string(),
                port: 1,
                agent_port: network::AGENT_DEFAULT_PORT,
                private_key: String::new(),
                passphrase: None,
                connect_timeout: Duration::from_millis(200),
                exec_timeout: Duration::from_millis(200),
                host_key_policy: HostKeyPolicy::Tofu,
                auth_retry: RetryPolicy::none(),
            },
            TrustStore::in_memory(Logger::new("test")),
            Logger::new("test"),
        );
        let result = connector.connect(
            "127.0.0.1",
            Instant::now() + Duration::from_secs(2),
            &AbortSignal::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn aborted_signal_stops_before_dialing() {
        let connector = SshConnector::new(
            SshSettings {
                user: "root".to_string(),
                port: network::SSH_DEFAULT_PORT,
                agent_port: network::AGENT_DEFAULT_PORT,
                private_key: String::new(),
                passphrase: None,
                connect_timeout: Duration::from_secs(5),
                exec_timeout: Duration::from_secs(5),
                host_key_policy: HostKeyPolicy::Tofu,
                auth_retry: RetryPolicy::none(),
            },
            TrustStore::in_memory(Logger::new("test")),
            Logger::new("test"),
        );
        let abort = AbortSignal::new();
        abort.abort();
        let started = Instant::now();
        let result = connector.connect("192.0.2.1", Instant::now() + Duration::from_secs(5), &abort);
        assert!(matches!(result, Err(ChannelError::Aborted { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
