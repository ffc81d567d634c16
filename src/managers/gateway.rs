use crate::config::SecurityConfig;
use crate::errors::GatewayError;
use crate::managers::pool::session::ExecOutput;
use crate::managers::pool::{PoolManager, SessionLease, SessionPool};
use crate::managers::targets::{Target, TargetRegistry};
use crate::services::audit::AuditService;
use crate::services::auth::{AuthService, Identity};
use crate::services::cache::CacheService;
use crate::services::logger::Logger;
use crate::services::policy::{AuthorizedCommand, PolicyService};
use crate::services::rate_limit::RateLimiter;
use crate::utils::redact::sanitize_output;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Final, immutable record of one remote execution. Output has always been
/// through the sanitizer by the time a result leaves the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub completed_at: chrono::DateTime<chrono::Utc>,
    pub sanitized: bool,
}

/// Drives one request through the full path:
/// authenticate -> rate limit -> authorize -> acquire -> execute ->
/// sanitize -> release -> audit.
pub struct Gateway {
    logger: Logger,
    security: SecurityConfig,
    auth: Arc<AuthService>,
    policy: Arc<PolicyService>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditService>,
    cache: Arc<CacheService>,
    registry: Arc<TargetRegistry>,
    pools: Arc<PoolManager>,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: Logger,
        security: SecurityConfig,
        auth: Arc<AuthService>,
        policy: Arc<PolicyService>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditService>,
        cache: Arc<CacheService>,
        registry: Arc<TargetRegistry>,
        pools: Arc<PoolManager>,
    ) -> Self {
        Self {
            logger: logger.child("gateway"),
            security,
            auth,
            policy,
            rate_limiter,
            audit,
            cache,
            registry,
            pools,
        }
    }

    fn audit_denied(
        &self,
        stage: &str,
        subject: Option<&str>,
        target_id: &str,
        operation: &str,
        err: &GatewayError,
    ) {
        self.audit.record(
            "execute",
            subject,
            "denied",
            serde_json::json!({
                "stage": stage,
                "target": target_id,
                "operation": operation,
                "code": err.code,
                "message": err.message,
                "severity": err.severity,
                "details": err.details,
            }),
        );
    }

    pub async fn execute(
        &self,
        target_id: &str,
        operation: &str,
        args: &[Value],
        token: &str,
    ) -> Result<CommandResult, GatewayError> {
        let identity = match self.auth.authenticate(token).await {
            Ok(identity) => identity,
            Err(err) => {
                self.audit_denied("authenticate", None, target_id, operation, &err);
                return Err(err);
            }
        };

        if let Err(err) = self
            .rate_limiter
            .check(&identity.subject, "execute")
            .await
        {
            self.audit_denied(
                "rate_limit",
                Some(&identity.subject),
                target_id,
                operation,
                &err,
            );
            return Err(err);
        }

        let target = match self.registry.get(target_id) {
            Ok(target) => target,
            Err(err) => {
                self.audit_denied("target", Some(&identity.subject), target_id, operation, &err);
                return Err(err);
            }
        };
        if !target.allows_operation(operation) {
            let err = GatewayError::authorization(format!(
                "Operation {} is not allowed on target {}",
                operation, target_id
            ));
            self.audit_denied(
                "target_policy",
                Some(&identity.subject),
                target_id,
                operation,
                &err,
            );
            return Err(err);
        }

        // Everything past this point has passed the security boundary; a
        // request rejected above never touches the pool.
        let command = match self.policy.authorize(operation, args, &identity) {
            Ok(command) => command,
            Err(err) => {
                self.audit_denied(
                    "authorize",
                    Some(&identity.subject),
                    target_id,
                    operation,
                    &err,
                );
                return Err(err);
            }
        };

        let pool = self.pools.get(target_id)?;
        let output = match self.run_command(&pool, &command, &identity, target_id).await {
            Ok(output) => output,
            Err(err) => {
                self.audit.record(
                    "execute",
                    Some(&identity.subject),
                    "failed",
                    serde_json::json!({
                        "target": target_id,
                        "operation": operation,
                        "code": err.code,
                        "message": err.message,
                    }),
                );
                return Err(err);
            }
        };

        let stdout = sanitize_output(
            &output.stdout,
            command.output.as_ref(),
            self.security.max_output_bytes,
        );
        let stderr = sanitize_output(&output.stderr, None, self.security.max_output_bytes);
        let result = CommandResult {
            exit_code: output.exit_code,
            stdout,
            stderr,
            duration_ms: output.duration_ms,
            completed_at: chrono::Utc::now(),
            sanitized: true,
        };

        self.audit.record(
            "execute",
            Some(&identity.subject),
            "ok",
            serde_json::json!({
                "target": target_id,
                "operation": operation,
                "args": command.sanitized_args,
                "exit_code": result.exit_code,
                "duration_ms": result.duration_ms,
            }),
        );
        Ok(result)
    }

    /// Executes on a leased session. A previously-healthy pooled session
    /// that fails at execution time gets exactly one reconnect-and-retry; a
    /// fresh session's failure, or any timeout, surfaces immediately.
    async fn run_command(
        &self,
        pool: &SessionPool,
        command: &AuthorizedCommand,
        identity: &Identity,
        target_id: &str,
    ) -> Result<ExecOutput, GatewayError> {
        let lease = pool.acquire().await?;
        let from_idle = lease.from_idle;
        match lease.exec(&command.command_line, command.timeout).await {
            Ok(output) => {
                pool.release(lease).await;
                Ok(output)
            }
            Err(err) if err.code == "EXECUTION_FAILED" && from_idle => {
                self.logger.warn(
                    "Pooled session went stale mid-request, retrying once",
                    Some(&serde_json::json!({
                        "target": target_id,
                        "operation": command.operation,
                        "subject": identity.subject,
                    })),
                );
                pool.discard(lease).await;
                let retry = pool.acquire().await?;
                match retry.exec(&command.command_line, command.timeout).await {
                    Ok(output) => {
                        pool.release(retry).await;
                        Ok(output)
                    }
                    Err(retry_err) => {
                        pool.discard(retry).await;
                        Err(retry_err)
                    }
                }
            }
            Err(err) => {
                pool.discard(lease).await;
                Err(err)
            }
        }
    }

    pub fn register_target(&self, target: Target) -> Result<(), GatewayError> {
        let target = self.registry.register(target)?;
        if let Err(err) = self.pools.register(target.clone()) {
            self.registry.remove(&target.id);
            return Err(err);
        }
        self.audit.record(
            "register_target",
            None,
            "ok",
            serde_json::json!({"target": target.id, "host": target.host}),
        );
        Ok(())
    }

    pub async fn remove_target(&self, target_id: &str) -> Result<(), GatewayError> {
        let removed = self.registry.remove(target_id);
        let pool_removed = self.pools.remove(target_id).await;
        if removed.is_none() && !pool_removed {
            return Err(GatewayError::pool(
                "UNKNOWN_TARGET",
                format!("Unknown target: {}", target_id),
            ));
        }
        self.audit.record(
            "remove_target",
            None,
            "ok",
            serde_json::json!({"target": target_id}),
        );
        Ok(())
    }

    pub fn list_targets(&self) -> Vec<Arc<Target>> {
        self.registry.list()
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.policy.operation_names()
    }

    /// Borrows one session and returns it straight away; between the borrow
    /// probe and the return probe this answers "can the gateway reach the
    /// target right now".
    pub async fn check_target(&self, target_id: &str) -> Result<bool, GatewayError> {
        self.registry.get(target_id)?;
        let pool = self.pools.get(target_id)?;
        let lease: SessionLease = pool.acquire().await?;
        pool.release(lease).await;
        Ok(true)
    }

    pub async fn status(&self) -> Value {
        serde_json::json!({
            "targets": self.registry.list().len(),
            "pools": self.pools.stats().await,
            "cache": self.cache.stats().await,
            "audit": self.audit.stats(),
        })
    }

    pub async fn shutdown(&self) {
        self.pools.shutdown().await;
        self.logger.info("Gateway shut down", None);
    }
}
