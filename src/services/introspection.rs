use crate::config::IntrospectionConfig;
use crate::errors::GatewayError;
use crate::services::logger::Logger;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

/// RFC 7662 introspection response. Unknown fields are ignored so provider
/// extensions do not break deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<IntrospectionResponse, GatewayError>;
}

pub struct HttpIntrospector {
    logger: Logger,
    config: IntrospectionConfig,
    endpoint: Url,
    client: Client,
}

impl HttpIntrospector {
    pub fn new(logger: Logger, config: IntrospectionConfig) -> Result<Self, GatewayError> {
        let raw = config.endpoint.clone().ok_or_else(|| {
            GatewayError::internal("Token introspection endpoint is not configured")
                .with_hint("Set GATEWAY_INTROSPECTION_URL to the provider's introspect endpoint.")
        })?;
        let endpoint = Url::parse(&raw).map_err(|_| {
            GatewayError::internal(format!("Invalid introspection endpoint: {}", raw))
        })?;
        let client = Client::builder()
            .user_agent("sshgate/1.2")
            .timeout(config.timeout)
            .build()
            .map_err(|err| GatewayError::internal(format!("HTTP client init failed: {}", err)))?;
        Ok(Self {
            logger: logger.child("introspect"),
            config,
            endpoint,
            client,
        })
    }
}

#[async_trait]
impl TokenIntrospector for HttpIntrospector {
    async fn introspect(&self, token: &str) -> Result<IntrospectionResponse, GatewayError> {
        let mut form: Vec<(&str, &str)> = vec![("token", token)];
        if let (Some(client_id), Some(client_secret)) = (
            self.config.client_id.as_deref(),
            self.config.client_secret.as_deref(),
        ) {
            form.push(("client_id", client_id));
            form.push(("client_secret", client_secret));
        }
        let body = serde_urlencoded::to_string(&form)
            .map_err(|err| GatewayError::internal(format!("Failed to encode form: {}", err)))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::authentication("Token introspection timed out")
                } else {
                    self.logger.warn(
                        "Introspection request failed",
                        Some(&serde_json::json!({"error": err.to_string()})),
                    );
                    GatewayError::authentication("Token introspection provider unreachable")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::authentication(format!(
                "Token introspection rejected with status {}",
                status.as_u16()
            )));
        }

        response.json::<IntrospectionResponse>().await.map_err(|_| {
            GatewayError::authentication("Token introspection returned a malformed response")
        })
    }
}
