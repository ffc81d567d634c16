use crate::config::{OperationSpec, OutputTransform};
use crate::constants::limits;
use crate::errors::{GatewayError, Severity};
use crate::services::auth::Identity;
use crate::services::logger::Logger;
use crate::utils::text::{escape_shell_value, truncate_utf8_prefix};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Denylist scanned against every argument. Each entry names the rule so a
/// violation can be diagnosed without echoing the offending value.
static DANGEROUS_PATTERNS: Lazy<Vec<(&'static str, Severity, Regex)>> = Lazy::new(|| {
    vec![
        (
            "control characters",
            Severity::High,
            Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").expect("denylist regex"),
        ),
        (
            "shell metacharacters",
            Severity::High,
            Regex::new(r"[;&|`$<>\n\r]").expect("denylist regex"),
        ),
        (
            "variable expansion",
            Severity::High,
            Regex::new(r"\$\{|\$\(").expect("denylist regex"),
        ),
        (
            "path traversal",
            Severity::Medium,
            Regex::new(r"\.\./|/\.\.").expect("denylist regex"),
        ),
        (
            "code injection",
            Severity::High,
            Regex::new(r"(?i)\b(eval|exec|source)\s|<\(|>\(").expect("denylist regex"),
        ),
        (
            "destructive command",
            Severity::Critical,
            Regex::new(r"(?i)rm\s+-[a-z]*f|mkfs|dd\s+if=|:\(\)\s*\{|\b(shutdown|reboot|halt)\b")
                .expect("denylist regex"),
        ),
    ]
});

static OPTION_INJECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*-").expect("denylist regex"));

/// The fully vetted command handed to the pool: literal program vector plus
/// sanitized, shell-escaped arguments.
#[derive(Debug, Clone)]
pub struct AuthorizedCommand {
    pub operation: String,
    pub command_line: String,
    pub sanitized_args: Vec<String>,
    pub timeout: Duration,
    pub output: Option<OutputTransform>,
}

pub struct PolicyService {
    logger: Logger,
    operations: HashMap<String, OperationSpec>,
}

impl PolicyService {
    pub fn new(logger: Logger, operations: HashMap<String, OperationSpec>) -> Self {
        let logger = logger.child("policy");
        for (name, spec) in operations.iter() {
            if spec.allowed_args.is_empty() {
                // Deliberate but hazardous: an empty allow-list means "no
                // argument restriction" rather than "no arguments".
                logger.warn(
                    "Operation accepts unrestricted arguments",
                    Some(&serde_json::json!({"operation": name})),
                );
            }
        }
        Self { logger, operations }
    }

    pub fn operation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn lookup(&self, operation: &str) -> Option<&OperationSpec> {
        self.operations.get(operation)
    }

    /// Full authorization pass: operation lookup, permission superset check,
    /// then per-argument vetting in order type -> length -> dangerous
    /// pattern -> allow-list.
    pub fn authorize(
        &self,
        operation: &str,
        args: &[Value],
        identity: &Identity,
    ) -> Result<AuthorizedCommand, GatewayError> {
        let Some(spec) = self.operations.get(operation) else {
            // Probing for unlisted operations is treated as hostile, not as
            // a lookup miss.
            return Err(GatewayError::unknown_operation(format!(
                "Unknown operation: {}",
                truncate_utf8_prefix(operation, limits::MAX_OPERATION_NAME_LENGTH)
            ))
            .with_details(serde_json::json!({"subject": identity.subject})));
        };

        let missing = identity.has_permissions(&spec.required_permissions);
        if !missing.is_empty() {
            return Err(GatewayError::authorization(format!(
                "Insufficient permissions for operation {}",
                operation
            ))
            .with_details(serde_json::json!({
                "missing_permissions": missing,
                "subject": identity.subject,
            })));
        }

        if args.len() > limits::MAX_ARGUMENTS {
            return Err(GatewayError::validation(format!(
                "Too many arguments ({} > {})",
                args.len(),
                limits::MAX_ARGUMENTS
            )));
        }

        let mut sanitized = Vec::with_capacity(args.len());
        for (index, raw) in args.iter().enumerate() {
            sanitized.push(self.sanitize_argument(spec, raw, index)?);
        }

        let mut command_line = spec.command.join(" ");
        for arg in sanitized.iter() {
            command_line.push(' ');
            command_line.push_str(&escape_shell_value(arg));
        }

        Ok(AuthorizedCommand {
            operation: operation.to_string(),
            command_line,
            sanitized_args: sanitized,
            timeout: spec.timeout(),
            output: spec.output.clone(),
        })
    }

    fn sanitize_argument(
        &self,
        spec: &OperationSpec,
        raw: &Value,
        index: usize,
    ) -> Result<String, GatewayError> {
        let Some(text) = raw.as_str() else {
            return Err(GatewayError::validation(format!(
                "Argument {} must be a string",
                index
            )));
        };

        if text.len() > limits::MAX_ARGUMENT_LENGTH {
            return Err(GatewayError::validation(format!(
                "Argument {} exceeds the {}-byte limit",
                index,
                limits::MAX_ARGUMENT_LENGTH
            )));
        }

        for (rule, severity, pattern) in DANGEROUS_PATTERNS.iter() {
            if pattern.is_match(text) {
                self.logger.warn(
                    "Dangerous argument rejected",
                    Some(&serde_json::json!({"rule": rule, "index": index})),
                );
                return Err(GatewayError::security(
                    *severity,
                    format!("Argument {} matches denied pattern: {}", index, rule),
                )
                .with_details(serde_json::json!({"argument": text, "rule": rule})));
            }
        }

        // Allow-listed option flags are legitimate; a leading dash is only
        // option injection when the operation takes unrestricted arguments.
        if spec.allowed_args.is_empty() {
            if OPTION_INJECTION.is_match(text) {
                return Err(GatewayError::security(
                    Severity::Medium,
                    format!("Argument {} matches denied pattern: option injection", index),
                )
                .with_details(serde_json::json!({"argument": text})));
            }
            return Ok(text.to_string());
        }

        if spec
            .allowed_args
            .iter()
            .any(|pattern| matches_allow_pattern(pattern, text))
        {
            return Ok(text.to_string());
        }

        Err(GatewayError::validation(format!(
            "Argument {} is not permitted by the operation allow-list",
            index
        ))
        .with_details(serde_json::json!({"argument": text})))
    }
}

/// Exact match, or a single-`*` wildcard covering one contiguous segment
/// (e.g. `--lines=*` accepts `--lines=50`).
fn matches_allow_pattern(pattern: &str, value: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == value,
        Some((prefix, suffix)) => {
            if suffix.contains('*') {
                return false;
            }
            value.len() >= prefix.len() + suffix.len()
                && value.starts_with(prefix)
                && value.ends_with(suffix)
        }
    }
}
