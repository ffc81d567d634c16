use crate::config::VaultConfig;
use crate::errors::GatewayError;
use crate::services::logger::Logger;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use url::Url;

/// Minimal Vault KV v2 reader. The gateway only ever fetches credential
/// material by reference; it never writes secrets.
pub struct VaultClient {
    logger: Logger,
    addr: Url,
    token: String,
    namespace: Option<String>,
    client: Client,
    retries: u32,
}

impl VaultClient {
    pub fn new(logger: Logger, config: VaultConfig) -> Result<Self, GatewayError> {
        let addr_raw = config.addr.clone().ok_or_else(|| {
            GatewayError::internal("Vault address is not configured")
                .with_hint("Set GATEWAY_VAULT_ADDR, or use ref:env credential references.")
        })?;
        let addr = Url::parse(addr_raw.trim_end_matches('/')).map_err(|_| {
            GatewayError::internal(format!("Invalid Vault address: {}", addr_raw))
        })?;
        let token = config.token.clone().ok_or_else(|| {
            GatewayError::internal("Vault token is not configured")
                .with_hint("Set GATEWAY_VAULT_TOKEN.")
        })?;
        let client = Client::builder()
            .user_agent("sshgate/1.2")
            .timeout(config.timeout)
            .build()
            .map_err(|err| GatewayError::internal(format!("HTTP client init failed: {}", err)))?;
        Ok(Self {
            logger: logger.child("vault"),
            addr,
            token,
            namespace: config.namespace,
            client,
            retries: 1,
        })
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&self.token) {
            headers.insert("X-Vault-Token", value);
        }
        if let Some(namespace) = self.namespace.as_deref() {
            if let Ok(value) = HeaderValue::from_str(namespace) {
                headers.insert("X-Vault-Namespace", value);
            }
        }
        headers
    }

    /// Reads `secret.data.data` for `<mount>/<path>`, retrying once on
    /// transient provider failures.
    pub async fn kv2_read(&self, mount: &str, path: &str) -> Result<Value, GatewayError> {
        let url = self
            .addr
            .join(&format!("/v1/{}/data/{}", mount.trim_matches('/'), path.trim_matches('/')))
            .map_err(|_| {
                GatewayError::internal(format!("Invalid Vault secret path: {}/{}", mount, path))
            })?;

        let mut attempt = 0;
        loop {
            let response = self
                .client
                .get(url.clone())
                .headers(self.build_headers())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: Value = response.json().await.map_err(|_| {
                            GatewayError::internal("Vault returned a malformed response")
                        })?;
                        return body
                            .get("data")
                            .and_then(|v| v.get("data"))
                            .cloned()
                            .ok_or_else(|| {
                                GatewayError::internal("Vault response is missing secret data")
                            });
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(GatewayError::connection(format!(
                            "Vault secret not found: {}/{}",
                            mount, path
                        )));
                    }
                    if status.is_server_error() && attempt < self.retries {
                        attempt += 1;
                        self.logger.warn(
                            "Vault read failed, retrying",
                            Some(&serde_json::json!({"status": status.as_u16()})),
                        );
                        continue;
                    }
                    return Err(GatewayError::connection(format!(
                        "Vault read rejected with status {}",
                        status.as_u16()
                    )));
                }
                Err(err) if err.is_timeout() && attempt < self.retries => {
                    attempt += 1;
                    self.logger.warn("Vault read timed out, retrying", None);
                }
                Err(err) => {
                    return Err(GatewayError::connection(format!(
                        "Vault unreachable: {}",
                        err
                    )));
                }
            }
        }
    }
}
