use crate::constants::{limits, network};
use crate::errors::GatewayError;
use crate::managers::targets::Target;
use crate::services::logger::Logger;
use crate::services::secret_ref::{CredentialMaterial, CredentialResolver};
use async_trait::async_trait;
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Raw capture of one remote command run, before any sanitization.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_ms: u64,
}

/// One live authenticated channel to a remote host. Implementations must be
/// safe to call from independent tasks, though the pool guarantees a session
/// is never shared between two in-flight executions.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, GatewayError>;
    async fn close(&self);
}

/// Seam between the pool and the transport: tests inject a scripted
/// connector, production wires [`SshConnector`].
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Arc<dyn RemoteSession>, GatewayError>;
}

pub struct SshConnector {
    logger: Logger,
    resolver: Arc<dyn CredentialResolver>,
    handshake_timeout: Duration,
}

impl SshConnector {
    pub fn new(
        logger: Logger,
        resolver: Arc<dyn CredentialResolver>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            logger: logger.child("ssh"),
            resolver,
            handshake_timeout,
        }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, target: &Target) -> Result<Arc<dyn RemoteSession>, GatewayError> {
        let material = self.resolver.resolve(&target.credential_ref).await?;
        if material.is_empty() {
            return Err(GatewayError::connection(format!(
                "Credential reference for target {} resolved to no usable material",
                target.id
            )));
        }
        let target_clone = target.clone();
        let handshake_timeout = self.handshake_timeout;
        let handshake = tokio::task::spawn_blocking(move || {
            connect_blocking(&target_clone, &material, handshake_timeout)
        });
        let session = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                GatewayError::connection(format!(
                    "SSH handshake to target {} timed out",
                    target.id
                ))
            })?
            .map_err(|_| GatewayError::internal("SSH handshake task failed"))??;

        self.logger.debug(
            "Session established",
            Some(&serde_json::json!({"target": target.id})),
        );
        Ok(Arc::new(SshRemoteSession {
            session: Arc::new(Mutex::new(session)),
        }))
    }
}

struct SshRemoteSession {
    session: Arc<Mutex<Session>>,
}

#[async_trait]
impl RemoteSession for SshRemoteSession {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, GatewayError> {
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = session.lock().unwrap_or_else(|err| err.into_inner());
            exec_blocking(&guard, &command, timeout)
        })
        .await
        .map_err(|_| GatewayError::internal("SSH exec task failed"))?
    }

    async fn close(&self) {
        let session = self.session.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let guard = session.lock().unwrap_or_else(|err| err.into_inner());
            let _ = guard.disconnect(None, "session closed", None);
        })
        .await;
    }
}

fn map_ssh_error(context: &str, err: ssh2::Error) -> GatewayError {
    GatewayError::connection(format!("{}: {}", context, err))
}

fn connect_blocking(
    target: &Target,
    material: &CredentialMaterial,
    timeout: Duration,
) -> Result<Session, GatewayError> {
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|err| {
            GatewayError::connection(format!(
                "Failed to resolve target {} ({}:{}): {}",
                target.id, target.host, target.port, err
            ))
        })?
        .next()
        .ok_or_else(|| {
            GatewayError::connection(format!(
                "Target {} has no reachable address ({}:{})",
                target.id, target.host, target.port
            ))
        })?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|err| {
        GatewayError::connection(format!(
            "Failed to connect to target {} ({}): {}",
            target.id, addr, err
        ))
    })?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    let mut session = Session::new()
        .map_err(|_| GatewayError::internal("Failed to allocate SSH session"))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| map_ssh_error(&format!("SSH handshake with target {} failed", target.id), err))?;

    if let Some(key) = material.private_key.as_deref() {
        session
            .userauth_pubkey_memory(&target.username, None, key, material.passphrase.as_deref())
            .map_err(|err| {
                map_ssh_error(
                    &format!("SSH key authentication failed for target {}", target.id),
                    err,
                )
            })?;
    } else if let Some(password) = material.password.as_deref() {
        session
            .userauth_password(&target.username, password)
            .map_err(|err| {
                map_ssh_error(
                    &format!("SSH password authentication failed for target {}", target.id),
                    err,
                )
            })?;
    }

    if !session.authenticated() {
        return Err(GatewayError::connection(format!(
            "SSH authentication was not accepted by target {}",
            target.id
        )));
    }

    let keepalive_secs = (network::KEEPALIVE_INTERVAL_MS / 1000).max(1) as u32;
    session.set_keepalive(true, keepalive_secs);
    Ok(session)
}

fn capture(buffer: &mut Vec<u8>, chunk: &[u8]) {
    let remaining = limits::MAX_CAPTURE_BYTES.saturating_sub(buffer.len());
    if remaining > 0 {
        buffer.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
}

fn exec_blocking(
    session: &Session,
    command: &str,
    timeout: Duration,
) -> Result<ExecOutput, GatewayError> {
    let started = Instant::now();
    let mut channel = session
        .channel_session()
        .map_err(|err| GatewayError::execution(format!("SSH channel open failed: {}", err)))?;
    channel
        .exec(command)
        .map_err(|err| GatewayError::execution(format!("SSH exec failed: {}", err)))?;
    session.set_blocking(false);

    let mut stdout_buf: Vec<u8> = Vec::new();
    let mut stderr_buf: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    let mut timed_out = false;

    loop {
        let mut progressed = false;
        match channel.stream(0).read(&mut buf) {
            Ok(n) if n > 0 => {
                capture(&mut stdout_buf, &buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                session.set_blocking(true);
                return Err(GatewayError::execution(format!(
                    "SSH stdout read failed: {}",
                    err
                )));
            }
        }
        match channel.stream(ssh2::EXTENDED_DATA_STDERR).read(&mut buf) {
            Ok(n) if n > 0 => {
                capture(&mut stderr_buf, &buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                session.set_blocking(true);
                return Err(GatewayError::execution(format!(
                    "SSH stderr read failed: {}",
                    err
                )));
            }
        }

        if channel.eof() {
            break;
        }
        if started.elapsed() > timeout {
            timed_out = true;
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    if timed_out {
        // Give the remote a short grace to flush and close, then give up;
        // the caller destroys the session rather than reusing it.
        let _ = channel.close();
        let deadline =
            Instant::now() + Duration::from_millis(network::TIMEOUT_SSH_EXEC_HARD_GRACE_MS);
        while Instant::now() < deadline && !channel.eof() {
            std::thread::sleep(Duration::from_millis(20));
        }
        session.set_blocking(true);
        return Err(GatewayError::execution_timeout(format!(
            "Remote command timed out after {} ms",
            timeout.as_millis()
        )));
    }

    session.set_blocking(true);
    let _ = channel.wait_close();
    let exit_code = i64::from(channel.exit_status().unwrap_or(-1));

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
        stderr: String::from_utf8_lossy(&stderr_buf).to_string(),
        exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}
