#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use sshgate::config::{CacheConfig, PoolConfig, SecurityConfig};
use sshgate::errors::GatewayError;
use sshgate::managers::gateway::Gateway;
use sshgate::managers::pool::session::{ExecOutput, RemoteSession, SessionConnector};
use sshgate::managers::pool::PoolManager;
use sshgate::managers::targets::{Target, TargetRegistry};
use sshgate::services::audit::AuditService;
use sshgate::services::auth::AuthService;
use sshgate::services::cache::CacheService;
use sshgate::services::introspection::{IntrospectionResponse, TokenIntrospector};
use sshgate::services::logger::Logger;
use sshgate::services::policy::PolicyService;
use sshgate::services::rate_limit::RateLimiter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const VALID_TOKEN: &str = "test-token-a1b2c3";

/// Shared state behind the scripted connector: counts connects and live
/// sessions, records peak concurrency of real (non-probe) commands, and
/// lets tests poison sessions to simulate dead channels.
#[derive(Default)]
pub struct MockNet {
    pub connect_count: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub exec_in_flight: AtomicUsize,
    pub max_exec_in_flight: AtomicUsize,
    pub exec_delay_ms: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_next_command: AtomicBool,
    pub responses: Mutex<HashMap<String, (String, i64)>>,
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockNet {
    pub fn respond(&self, command: &str, stdout: &str, exit_code: i64) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), (stdout.to_string(), exit_code));
    }

    pub fn poison_all_sessions(&self) {
        for session in self.sessions.lock().unwrap().iter() {
            session.healthy.store(false, Ordering::SeqCst);
        }
    }

    fn track_max(counter: &AtomicUsize, value: usize) {
        let mut seen = counter.load(Ordering::SeqCst);
        while value > seen {
            match counter.compare_exchange(seen, value, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => seen = actual,
            }
        }
    }
}

pub struct MockSession {
    net: Arc<MockNet>,
    pub healthy: AtomicBool,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, GatewayError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(GatewayError::execution("connection reset by peer"));
        }
        // Health probes are plain echo commands; answer them inline so pool
        // validation works without scripting.
        if let Some(rest) = command.strip_prefix("echo ") {
            return Ok(ExecOutput {
                stdout: format!("{}\n", rest),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 1,
            });
        }
        if self.net.fail_next_command.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::execution("channel closed"));
        }

        let in_flight = self.net.exec_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        MockNet::track_max(&self.net.max_exec_in_flight, in_flight);
        let delay = self.net.exec_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.net.exec_in_flight.fetch_sub(1, Ordering::SeqCst);

        let canned = self.net.responses.lock().unwrap().get(command).cloned();
        let (stdout, exit_code) = canned.unwrap_or_else(|| ("ok\n".to_string(), 0));
        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code,
            duration_ms: delay as u64,
        })
    }

    async fn close(&self) {
        self.net.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    pub net: Arc<MockNet>,
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self, target: &Target) -> Result<Arc<dyn RemoteSession>, GatewayError> {
        if self.net.fail_connect.load(Ordering::SeqCst) {
            return Err(GatewayError::connection(format!(
                "SSH handshake with target {} failed: simulated refusal",
                target.id
            )));
        }
        self.net.connect_count.fetch_add(1, Ordering::SeqCst);
        let live = self.net.live.fetch_add(1, Ordering::SeqCst) + 1;
        MockNet::track_max(&self.net.max_live, live);
        let session = Arc::new(MockSession {
            net: self.net.clone(),
            healthy: AtomicBool::new(true),
        });
        self.net.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct MockIntrospector;

#[async_trait]
impl TokenIntrospector for MockIntrospector {
    async fn introspect(&self, token: &str) -> Result<IntrospectionResponse, GatewayError> {
        if token == VALID_TOKEN {
            return Ok(IntrospectionResponse {
                active: true,
                scope: Some("ssh:execute ssh:read".to_string()),
                sub: Some("service-account".to_string()),
                exp: Some(chrono::Utc::now().timestamp() + 3_600),
                client_id: Some("test-client".to_string()),
                username: Some("svc".to_string()),
                token_type: Some("Bearer".to_string()),
            });
        }
        Ok(IntrospectionResponse {
            active: false,
            scope: None,
            sub: None,
            exp: None,
            client_id: None,
            username: None,
            token_type: None,
        })
    }
}

pub fn test_pool_config(max_sessions: usize, acquire_timeout: Duration) -> PoolConfig {
    PoolConfig {
        min_sessions: 0,
        max_sessions,
        acquire_timeout,
        idle_timeout: Duration::from_secs(300),
        health_check_interval: Duration::from_secs(60),
        handshake_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(2),
    }
}

pub fn test_cache_config() -> CacheConfig {
    CacheConfig {
        redis_url: None,
        local_max_entries: 256,
        local_default_ttl: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(30),
        shared_timeout: Duration::from_millis(100),
    }
}

pub fn sample_target(id: &str) -> Target {
    Target {
        id: id.to_string(),
        host: "10.0.0.5".to_string(),
        port: 22,
        username: "admin".to_string(),
        credential_ref: "ref:env:SSHGATE_TEST_KEY".to_string(),
        allowed_operations: None,
        tags: Vec::new(),
    }
}

pub struct Harness {
    pub gateway: Gateway,
    pub net: Arc<MockNet>,
}

/// Gateway wired against scripted collaborators: local-only cache, a
/// permissive introspector for [`VALID_TOKEN`], and the mock transport.
pub fn build_gateway(pool: PoolConfig) -> Harness {
    let logger = Logger::new("test");
    let net = Arc::new(MockNet::default());
    let connector: Arc<dyn SessionConnector> = Arc::new(MockConnector { net: net.clone() });

    let cache = Arc::new(CacheService::local_only(logger.clone(), test_cache_config()));
    let security = SecurityConfig::from_env();
    let introspector: Arc<dyn TokenIntrospector> = Arc::new(MockIntrospector);
    let auth = Arc::new(AuthService::new(
        logger.clone(),
        security.clone(),
        cache.clone(),
        introspector,
    ));
    let policy = Arc::new(PolicyService::new(
        logger.clone(),
        sshgate::config::default_operations(),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(
        logger.clone(),
        security.clone(),
        cache.clone(),
    ));
    let audit = Arc::new(AuditService::new(logger.clone()));
    let registry = Arc::new(TargetRegistry::new(logger.clone()));
    let pools = Arc::new(PoolManager::new(logger.clone(), pool, connector));

    let gateway = Gateway::new(
        logger,
        security,
        auth,
        policy,
        rate_limiter,
        audit,
        cache,
        registry,
        pools,
    );
    Harness { gateway, net }
}

#[allow(dead_code)]
pub fn no_args() -> Vec<Value> {
    Vec::new()
}
