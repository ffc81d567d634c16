use crate::constants::network;
use crate::errors::GatewayError;
use crate::services::logger::Logger;
use crate::services::validation::Validation;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A registered remote endpoint. `credential_ref` is an opaque reference
/// resolved by the credential resolver at session-creation time; the
/// registry never holds raw secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_operations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Target {
    pub fn from_value(validation: &Validation, value: &Value) -> Result<Self, GatewayError> {
        let id = validation.ensure_identifier(
            value.get("id").unwrap_or(&Value::Null),
            "target id",
        )?;
        let host = validation.ensure_string(value.get("host").unwrap_or(&Value::Null), "host")?;
        let port = validation.ensure_port(value.get("port"), network::SSH_DEFAULT_PORT)?;
        let username =
            validation.ensure_string(value.get("username").unwrap_or(&Value::Null), "username")?;
        let credential_ref = validation.ensure_string(
            value.get("credential_ref").unwrap_or(&Value::Null),
            "credential_ref",
        )?;
        let allowed_operations = match value.get("allowed_operations") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => {
                let mut ops = Vec::with_capacity(items.len());
                for item in items {
                    ops.push(validation.ensure_string(item, "allowed_operations entry")?);
                }
                Some(ops)
            }
            Some(_) => {
                return Err(GatewayError::validation(
                    "allowed_operations must be an array of operation names",
                ))
            }
        };
        let tags = match value.get("tags") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.trim().to_string()))
                .filter(|s| !s.is_empty())
                .collect(),
            Some(_) => return Err(GatewayError::validation("tags must be an array of strings")),
        };
        Ok(Self {
            id,
            host,
            port,
            username,
            credential_ref,
            allowed_operations,
            tags,
        })
    }

    pub fn allows_operation(&self, operation: &str) -> bool {
        match &self.allowed_operations {
            None => true,
            Some(allowed) => allowed.iter().any(|op| op == operation),
        }
    }
}

/// In-process registry of targets. Targets are immutable once registered;
/// the only lifecycle transitions are register and remove.
pub struct TargetRegistry {
    logger: Logger,
    targets: DashMap<String, Arc<Target>>,
}

impl TargetRegistry {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("targets"),
            targets: DashMap::new(),
        }
    }

    pub fn register(&self, target: Target) -> Result<Arc<Target>, GatewayError> {
        let target = Arc::new(target);
        let entry = self.targets.entry(target.id.clone());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(GatewayError::validation(format!(
                "Target {} is already registered",
                target.id
            ))
            .with_hint("Remove the target first; registered targets are immutable.")),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(target.clone());
                self.logger.info(
                    "Target registered",
                    Some(&serde_json::json!({
                        "id": target.id,
                        "host": target.host,
                        "port": target.port,
                    })),
                );
                Ok(target)
            }
        }
    }

    pub fn get(&self, target_id: &str) -> Result<Arc<Target>, GatewayError> {
        self.targets
            .get(target_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                GatewayError::pool("UNKNOWN_TARGET", format!("Unknown target: {}", target_id))
            })
    }

    pub fn remove(&self, target_id: &str) -> Option<Arc<Target>> {
        let removed = self.targets.remove(target_id).map(|(_, target)| target);
        if removed.is_some() {
            self.logger
                .info("Target removed", Some(&serde_json::json!({"id": target_id})));
        }
        removed
    }

    pub fn list(&self) -> Vec<Arc<Target>> {
        let mut targets: Vec<Arc<Target>> = self
            .targets
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        targets
    }
}
