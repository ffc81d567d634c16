use crate::config::SecurityConfig;
use crate::errors::GatewayError;
use crate::services::cache::CacheService;
use crate::services::introspection::TokenIntrospector;
use crate::services::logger::Logger;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Authenticated caller context derived from one bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub scopes: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    pub expires_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Identity {
    pub fn has_permissions(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|perm| !self.permissions.contains(*perm))
            .cloned()
            .collect()
    }
}

pub struct AuthService {
    logger: Logger,
    config: SecurityConfig,
    cache: Arc<CacheService>,
    introspector: Arc<dyn TokenIntrospector>,
}

impl AuthService {
    pub fn new(
        logger: Logger,
        config: SecurityConfig,
        cache: Arc<CacheService>,
        introspector: Arc<dyn TokenIntrospector>,
    ) -> Self {
        Self {
            logger: logger.child("auth"),
            config,
            cache,
            introspector,
        }
    }

    /// Cache key is a one-way digest; the raw token never reaches the cache
    /// or any log line.
    fn token_cache_key(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        format!("auth:token:{}", hex::encode(hasher.finalize()))
    }

    pub async fn authenticate(&self, token: &str) -> Result<Identity, GatewayError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(GatewayError::authentication("Bearer token is required"));
        }

        let cache_key = Self::token_cache_key(token);
        let now = chrono::Utc::now().timestamp();
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(identity) = serde_json::from_value::<Identity>(cached) {
                if identity.expires_at > now {
                    return Ok(identity);
                }
                self.cache.delete(&cache_key).await;
            }
        }

        let response = self.introspector.introspect(token).await?;
        if !response.active {
            return Err(GatewayError::authentication("Token is not active"));
        }
        let expires_at = response.exp.unwrap_or(0);
        if expires_at <= now {
            return Err(GatewayError::authentication("Token has expired"));
        }

        let scopes: BTreeSet<String> = response
            .scope
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        let missing: Vec<&String> = self
            .config
            .required_scopes
            .iter()
            .filter(|scope| !scopes.contains(*scope))
            .collect();
        if !missing.is_empty() {
            return Err(GatewayError::authorization(
                "Token is missing a required scope",
            )
            .with_details(serde_json::json!({
                "missing_scopes": missing,
            })));
        }

        let mut permissions = BTreeSet::new();
        for scope in scopes.iter() {
            if let Some(derived) = self.config.scope_permissions.get(scope) {
                permissions.extend(derived.iter().cloned());
            }
        }

        let subject = response
            .sub
            .or(response.client_id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let mut metadata = HashMap::new();
        if let Some(client_id) = response.client_id {
            metadata.insert("client_id".to_string(), client_id);
        }
        if let Some(username) = response.username {
            metadata.insert("username".to_string(), username);
        }
        if let Some(token_type) = response.token_type {
            metadata.insert("token_type".to_string(), token_type);
        }

        let identity = Identity {
            subject,
            scopes,
            permissions,
            expires_at,
            metadata,
        };

        let remaining = Duration::from_secs((expires_at - now).max(1) as u64);
        let ttl = remaining.min(self.config.token_cache_ttl);
        match serde_json::to_value(&identity) {
            Ok(value) => self.cache.set(&cache_key, value, ttl).await,
            Err(err) => self.logger.warn(
                "Failed to serialize identity for caching",
                Some(&serde_json::json!({"error": err.to_string()})),
            ),
        }

        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_cache_key_is_a_digest() {
        let key = AuthService::token_cache_key("super-secret-token");
        assert!(key.starts_with("auth:token:"));
        assert!(!key.contains("super-secret-token"));
        assert_eq!(key.len(), "auth:token:".len() + 64);
    }

    #[test]
    fn has_permissions_reports_missing_set() {
        let identity = Identity {
            subject: "svc".to_string(),
            scopes: BTreeSet::new(),
            permissions: ["execute:basic".to_string()].into_iter().collect(),
            expires_at: 0,
            metadata: HashMap::new(),
        };
        let missing = identity.has_permissions(&[
            "execute:basic".to_string(),
            "execute:admin".to_string(),
        ]);
        assert_eq!(missing, vec!["execute:admin".to_string()]);
    }
}
