pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_HANDSHAKE_MS: u64 = 30_000;
    pub const TIMEOUT_SSH_EXEC_DEFAULT_MS: u64 = 30_000;
    pub const TIMEOUT_SSH_EXEC_HARD_GRACE_MS: u64 = 2_000;
    pub const TIMEOUT_HEALTH_PROBE_MS: u64 = 5_000;
    pub const TIMEOUT_INTROSPECTION_MS: u64 = 10_000;
    pub const TIMEOUT_VAULT_MS: u64 = 15_000;
    pub const TIMEOUT_SHARED_CACHE_MS: u64 = 2_000;
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
}

pub mod pool {
    pub const MIN_SESSIONS: usize = 0;
    pub const MAX_SESSIONS: usize = 5;
    pub const ACQUIRE_TIMEOUT_MS: u64 = 10_000;
    pub const IDLE_TIMEOUT_MS: u64 = 300_000;
    pub const HEALTH_CHECK_INTERVAL_MS: u64 = 60_000;
    pub const DRAIN_TIMEOUT_MS: u64 = 10_000;
}

pub mod limits {
    pub const MAX_PORT: u16 = 65_535;
    pub const MIN_PORT: u16 = 1;
    pub const MAX_ARGUMENT_LENGTH: usize = 1_024;
    pub const MAX_ARGUMENTS: usize = 32;
    pub const MAX_OPERATION_NAME_LENGTH: usize = 128;
    pub const MAX_CAPTURE_BYTES: usize = 256 * 1024;
    pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;
}

pub mod cache {
    pub const KEY_NAMESPACE: &str = "sshgate:";
    pub const LOCAL_MAX_ENTRIES: usize = 1_000;
    pub const LOCAL_DEFAULT_TTL_SECS: u64 = 60;
    pub const SWEEP_INTERVAL_MS: u64 = 30_000;
}

pub mod rate_limit {
    pub const WINDOW_SECS: u64 = 60;
    pub const MAX_REQUESTS: u64 = 100;
}

pub mod security {
    pub const TOKEN_CACHE_TTL_SECS: u64 = 300;
    pub const REQUIRED_SCOPES: &[&str] = &["ssh:execute"];
}
