use crate::constants::{cache, limits, network, pool, rate_limit, security};
use crate::errors::GatewayError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_sessions: usize,
    pub max_sessions: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self {
            min_sessions: env_usize("GATEWAY_POOL_MIN", pool::MIN_SESSIONS),
            max_sessions: env_usize("GATEWAY_POOL_MAX", pool::MAX_SESSIONS).max(1),
            acquire_timeout: Duration::from_millis(env_u64(
                "GATEWAY_POOL_ACQUIRE_TIMEOUT_MS",
                pool::ACQUIRE_TIMEOUT_MS,
            )),
            idle_timeout: Duration::from_millis(env_u64(
                "GATEWAY_POOL_IDLE_TIMEOUT_MS",
                pool::IDLE_TIMEOUT_MS,
            )),
            health_check_interval: Duration::from_millis(env_u64(
                "GATEWAY_POOL_HEALTH_INTERVAL_MS",
                pool::HEALTH_CHECK_INTERVAL_MS,
            )),
            handshake_timeout: Duration::from_millis(env_u64(
                "GATEWAY_SSH_HANDSHAKE_TIMEOUT_MS",
                network::TIMEOUT_SSH_HANDSHAKE_MS,
            )),
            drain_timeout: Duration::from_millis(env_u64(
                "GATEWAY_POOL_DRAIN_TIMEOUT_MS",
                pool::DRAIN_TIMEOUT_MS,
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub rate_limit_window: Duration,
    pub rate_limit_max: u64,
    pub token_cache_ttl: Duration,
    pub required_scopes: Vec<String>,
    /// Fixed scope -> permission derivation table.
    pub scope_permissions: HashMap<String, Vec<String>>,
    pub max_output_bytes: usize,
}

impl SecurityConfig {
    pub fn from_env() -> Self {
        Self {
            rate_limit_window: Duration::from_secs(env_u64(
                "GATEWAY_RATE_LIMIT_WINDOW_SECS",
                rate_limit::WINDOW_SECS,
            )),
            rate_limit_max: env_u64("GATEWAY_RATE_LIMIT_MAX", rate_limit::MAX_REQUESTS),
            token_cache_ttl: Duration::from_secs(env_u64(
                "GATEWAY_TOKEN_CACHE_TTL_SECS",
                security::TOKEN_CACHE_TTL_SECS,
            )),
            required_scopes: env_string("GATEWAY_REQUIRED_SCOPES")
                .map(|raw| {
                    raw.split_whitespace()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_else(|| {
                    security::REQUIRED_SCOPES
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                }),
            scope_permissions: default_scope_permissions(),
            max_output_bytes: env_usize("GATEWAY_MAX_OUTPUT_BYTES", limits::MAX_OUTPUT_BYTES),
        }
    }
}

fn default_scope_permissions() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        "ssh:execute".to_string(),
        vec!["execute:basic".to_string()],
    );
    map.insert(
        "ssh:admin".to_string(),
        vec![
            "execute:basic".to_string(),
            "execute:admin".to_string(),
            "targets:manage".to_string(),
        ],
    );
    map.insert("ssh:read".to_string(), vec!["targets:read".to_string()]);
    map
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub local_max_entries: usize,
    pub local_default_ttl: Duration,
    pub sweep_interval: Duration,
    pub shared_timeout: Duration,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: env_string("GATEWAY_REDIS_URL"),
            local_max_entries: env_usize("GATEWAY_CACHE_LOCAL_MAX", cache::LOCAL_MAX_ENTRIES),
            local_default_ttl: Duration::from_secs(env_u64(
                "GATEWAY_CACHE_LOCAL_TTL_SECS",
                cache::LOCAL_DEFAULT_TTL_SECS,
            )),
            sweep_interval: Duration::from_millis(env_u64(
                "GATEWAY_CACHE_SWEEP_INTERVAL_MS",
                cache::SWEEP_INTERVAL_MS,
            )),
            shared_timeout: Duration::from_millis(env_u64(
                "GATEWAY_CACHE_SHARED_TIMEOUT_MS",
                network::TIMEOUT_SHARED_CACHE_MS,
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntrospectionConfig {
    pub endpoint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub timeout: Duration,
}

impl IntrospectionConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env_string("GATEWAY_INTROSPECTION_URL"),
            client_id: env_string("GATEWAY_INTROSPECTION_CLIENT_ID"),
            client_secret: env_string("GATEWAY_INTROSPECTION_CLIENT_SECRET"),
            timeout: Duration::from_millis(env_u64(
                "GATEWAY_INTROSPECTION_TIMEOUT_MS",
                network::TIMEOUT_INTROSPECTION_MS,
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub addr: Option<String>,
    pub token: Option<String>,
    pub namespace: Option<String>,
    pub timeout: Duration,
}

impl VaultConfig {
    pub fn from_env() -> Self {
        Self {
            addr: env_string("GATEWAY_VAULT_ADDR"),
            token: env_string("GATEWAY_VAULT_TOKEN"),
            namespace: env_string("GATEWAY_VAULT_NAMESPACE"),
            timeout: Duration::from_millis(env_u64(
                "GATEWAY_VAULT_TIMEOUT_MS",
                network::TIMEOUT_VAULT_MS,
            )),
        }
    }
}

/// Post-execution rewrite applied to remote output before credential
/// masking. Declared per operation in the policy table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputTransform {
    HeadLines { lines: usize },
    RegexReplace { pattern: String, replace: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationSpec {
    /// Literal command vector; arguments are appended shell-escaped.
    pub command: Vec<String>,
    /// Exact strings or single-`*` wildcard patterns. Empty = unrestricted,
    /// which is flagged as a hazardous configuration at load time.
    #[serde(default)]
    pub allowed_args: Vec<String>,
    #[serde(default = "default_operation_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default)]
    pub output: Option<OutputTransform>,
}

fn default_operation_timeout_ms() -> u64 {
    network::TIMEOUT_SSH_EXEC_DEFAULT_MS
}

impl OperationSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
struct OperationsFile {
    operations: HashMap<String, OperationSpec>,
}

pub fn load_operations(
    path: Option<&Path>,
) -> Result<HashMap<String, OperationSpec>, GatewayError> {
    let Some(path) = path else {
        return Ok(default_operations());
    };
    let raw = std::fs::read_to_string(path).map_err(|err| {
        GatewayError::internal(format!(
            "Failed to read operations file {}: {}",
            path.display(),
            err
        ))
    })?;
    let parsed: OperationsFile = serde_json::from_str(&raw).map_err(|err| {
        GatewayError::internal(format!(
            "Failed to parse operations file {}: {}",
            path.display(),
            err
        ))
        .with_hint("Expected {\"operations\": {\"<name>\": {\"command\": [...], ...}}}")
    })?;
    for (name, spec) in parsed.operations.iter() {
        if spec.command.is_empty() {
            return Err(GatewayError::internal(format!(
                "Operation {} has an empty command vector",
                name
            )));
        }
    }
    Ok(parsed.operations)
}

/// Built-in policy table covering the common read-only host inspection
/// operations. A deployment overrides it with its own operations file.
pub fn default_operations() -> HashMap<String, OperationSpec> {
    let mut ops = HashMap::new();
    let read_only = |command: &[&str], timeout_ms: u64| OperationSpec {
        command: command.iter().map(|s| s.to_string()).collect(),
        allowed_args: Vec::new(),
        timeout_ms,
        required_permissions: vec!["execute:basic".to_string()],
        output: None,
    };
    ops.insert("disk_usage".to_string(), read_only(&["df", "-h"], 10_000));
    ops.insert("uptime".to_string(), read_only(&["uptime"], 10_000));
    ops.insert("memory".to_string(), read_only(&["free", "-h"], 10_000));
    ops.insert("hostname".to_string(), read_only(&["hostname"], 10_000));
    ops.insert("kernel".to_string(), read_only(&["uname", "-r"], 10_000));
    ops.insert("os".to_string(), read_only(&["uname", "-o"], 10_000));
    ops.insert(
        "architecture".to_string(),
        read_only(&["uname", "-m"], 10_000),
    );
    ops.insert(
        "cpu_info".to_string(),
        OperationSpec {
            command: vec!["lscpu".to_string()],
            allowed_args: Vec::new(),
            timeout_ms: 10_000,
            required_permissions: vec!["execute:basic".to_string()],
            output: Some(OutputTransform::HeadLines { lines: 20 }),
        },
    );
    ops
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub pool: PoolConfig,
    pub security: SecurityConfig,
    pub cache: CacheConfig,
    pub introspection: IntrospectionConfig,
    pub vault: VaultConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            pool: PoolConfig::from_env(),
            security: SecurityConfig::from_env(),
            cache: CacheConfig::from_env(),
            introspection: IntrospectionConfig::from_env(),
            vault: VaultConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_operations_include_host_inspection_set() {
        let ops = default_operations();
        assert!(ops.contains_key("disk_usage"));
        assert!(ops.contains_key("uptime"));
        assert_eq!(ops["disk_usage"].command, vec!["df", "-h"]);
    }

    #[test]
    fn operations_file_rejects_empty_command() {
        let dir = std::env::temp_dir().join(format!("sshgate-ops-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("operations.json");
        std::fs::write(
            &path,
            r#"{"operations": {"broken": {"command": []}}}"#,
        )
        .unwrap();
        let err = load_operations(Some(&path)).unwrap_err();
        assert!(err.message.contains("empty command vector"));
    }
}
