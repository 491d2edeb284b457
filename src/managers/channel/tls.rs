use super::{protocol, remaining, AbortSignal, Channel};
use crate::constants::network;
use crate::errors::{ChannelError, FleetError};
use crate::model::{AgentRequest, AgentResponse};
use crate::services::config::TlsPaths;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// PEM material for mutual TLS plus the agent endpoint timing.
#[derive(Clone)]
pub struct TlsSettings {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub agent_port: u16,
    pub connect_timeout: Duration,
    pub exec_timeout: Duration,
}

impl TlsSettings {
    pub fn from_paths(
        paths: &TlsPaths,
        agent_port: u16,
        connect_timeout: Duration,
        exec_timeout: Duration,
    ) -> Result<Self, FleetError> {
        Ok(Self {
            ca_pem: read_pem("tls.ca", paths.ca.as_deref())?,
            cert_pem: read_pem("tls.cert", paths.cert.as_deref())?,
            key_pem: read_pem("tls.key", paths.key.as_deref())?,
            agent_port,
            connect_timeout,
            exec_timeout,
        })
    }
}

fn read_pem(field: &str, path: Option<&Path>) -> Result<Vec<u8>, FleetError> {
    let path = path.ok_or_else(|| {
        FleetError::invalid_params(format!("{} is required for the direct-tls transport", field))
            .with_hint("Set tls.ca, tls.cert and tls.key in the config file.")
    })?;
    std::fs::read(path).map_err(|err| {
        FleetError::invalid_params(format!("Failed to read {} {}: {}", field, path.display(), err))
    })
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, FleetError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| FleetError::invalid_params(format!("failed to parse certificates: {}", err)))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, FleetError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|err| FleetError::invalid_params(format!("failed to parse private key: {}", err)))
}

fn provider_builder() -> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>, FleetError> {
    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|err| FleetError::internal(format!("TLS configuration error: {}", err)))
}

/// Dials the agent port directly and authenticates both ends with the
/// operator's CA.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
    agent_port: u16,
    connect_timeout: Duration,
    exec_timeout: Duration,
}

impl TlsConnector {
    pub fn new(settings: TlsSettings) -> Result<Self, FleetError> {
        let ca_certs = parse_certificates(&settings.ca_pem)?;
        if ca_certs.is_empty() {
            return Err(FleetError::invalid_params("no CA certificates found"));
        }
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).map_err(|err| {
                FleetError::invalid_params(format!("failed to add CA certificate: {}", err))
            })?;
        }
        let client_certs = parse_certificates(&settings.cert_pem)?;
        if client_certs.is_empty() {
            return Err(FleetError::invalid_params("no client certificates found"));
        }
        let client_key = parse_private_key(&settings.key_pem)?;
        let config = provider_builder()?
            .with_root_certificates(roots)
            .with_client_auth_cert(client_certs, client_key)
            .map_err(|err| FleetError::invalid_params(format!("client config error: {}", err)))?;
        Ok(Self {
            config: Arc::new(config),
            agent_port: settings.agent_port,
            connect_timeout: settings.connect_timeout,
            exec_timeout: settings.exec_timeout,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let config = provider_builder()
            .expect("provider")
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
            agent_port: crate::constants::network::AGENT_DEFAULT_PORT,
            connect_timeout: Duration::from_millis(200),
            exec_timeout: Duration::from_millis(200),
        }
    }

    pub fn connect(
        &self,
        address: &str,
        deadline: Instant,
        abort: &AbortSignal,
    ) -> Result<TlsChannel, ChannelError> {
        abort.check("tls connect")?;
        let peer = format!("{}:{}", address, self.agent_port);
        let budget = remaining(deadline, self.connect_timeout, "tls connect")?;
        let addr = peer
            .to_socket_addrs()
            .map_err(|err| ChannelError::Connect {
                address: peer.clone(),
                reason: err.to_string(),
            })?
            .next()
            .ok_or_else(|| ChannelError::Connect {
                address: peer.clone(),
                reason: "address did not resolve".to_string(),
            })?;
        let mut tcp = TcpStream::connect_timeout(&addr, budget).map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                ChannelError::timeout(format!("connect to {}", peer), budget)
            } else {
                ChannelError::Connect {
                    address: peer.clone(),
                    reason: err.to_string(),
                }
            }
        })?;
        tcp.set_read_timeout(Some(budget)).ok();
        tcp.set_write_timeout(Some(budget)).ok();

        let server_name = ServerName::try_from(address.to_string())
            .map_err(|err| ChannelError::transport(format!("invalid server name {}: {}", address, err)))?;
        let mut conn = ClientConnection::new(self.config.clone(), server_name)
            .map_err(|err| ChannelError::transport(format!("TLS setup failed: {}", err)))?;
        while conn.is_handshaking() {
            abort.check("TLS handshake")?;
            conn.complete_io(&mut tcp).map_err(|err| match err.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    ChannelError::timeout("TLS handshake", budget)
                }
                _ => ChannelError::transport(format!("TLS handshake with {} failed: {}", peer, err)),
            })?;
        }

        // Short socket timeouts; the request budget is enforced above them.
        let poll = Duration::from_millis(network::ABORT_POLL_INTERVAL_MS).min(self.exec_timeout);
        tcp.set_read_timeout(Some(poll)).ok();
        tcp.set_write_timeout(Some(poll)).ok();
        Ok(TlsChannel {
            stream: StreamOwned::new(conn, tcp),
            peer,
            exec_timeout: self.exec_timeout,
            abort: abort.clone(),
            closed: false,
        })
    }
}

/// One TLS session to the agent, reused for every request to the target.
pub struct TlsChannel {
    stream: StreamOwned<ClientConnection, TcpStream>,
    peer: String,
    exec_timeout: Duration,
    abort: AbortSignal,
    closed: bool,
}

impl Channel for TlsChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn request(&mut self, request: &AgentRequest) -> Result<AgentResponse, ChannelError> {
        if self.closed {
            return Err(ChannelError::transport(format!("channel to {} is closed", self.peer)));
        }
        protocol::abortable_round_trip(&mut self.stream, request, self.exec_timeout, &self.abort)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stream.conn.send_close_notify();
        let _ = self.stream.conn.complete_io(&mut self.stream.sock);
        let _ = self.stream.sock.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_paths_are_rejected() {
        let err = match TlsSettings::from_paths(
            &TlsPaths::default(),
            1337,
            Duration::from_secs(1),
            Duration::from_secs(1),
        ) {
            Err(err) => err,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.message.contains("tls.ca"));
    }

    #[test]
    fn garbage_ca_is_rejected() {
        let settings = TlsSettings {
            ca_pem: b"not a certificate".to_vec(),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            agent_port: 1337,
            connect_timeout: Duration::from_secs(1),
            exec_timeout: Duration::from_secs(1),
        };
        assert!(TlsConnector::new(settings).is_err());
    }

    #[test]
    fn refused_connection_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut connector = TlsConnector::for_tests();
        connector.agent_port = port;
        let err = match connector.connect(
            "127.0.0.1",
            Instant::now() + Duration::from_secs(2),
            &AbortSignal::new(),
        ) {
            Err(err) => err,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, ChannelError::Connect { .. }));
    }
}
