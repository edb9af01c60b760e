//! Access tokens and request signing for the cloud REST API
//!
//! Tokens are short-lived and never cached: every authenticated call fetches
//! a fresh one. Each request is signed with a SHA-256 over the token, the
//! sorted query parameters, the timestamp, the application secret and the
//! exact body bytes that go on the wire.

use super::CloudError;
use crate::config::{ConfigError, NodeConfig};
use crate::crypto::digest::{access_token_signature, request_signature};
use crate::error::sanitize_error_message;
use crate::platform::Clock;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const TOKEN_PATH: &str = "/apim-token-service/v2.0/token/get";
pub const HEADER_ACCESS_TOKEN: &str = "apim-accesstoken";
pub const HEADER_SIGNATURE: &str = "apim-signature";
pub const HEADER_TIMESTAMP: &str = "apim-timestamp";
const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// Identity of this node towards the REST API
#[derive(Clone)]
pub struct CloudCredentials {
    pub api_url: String,
    pub org_id: String,
    pub product_key: String,
    pub access_key: String,
    pub access_secret: String,
}

impl fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("api_url", &self.api_url)
            .field("org_id", &self.org_id)
            .field("product_key", &self.product_key)
            .field("access_key", &self.access_key)
            .field("access_secret", &"***")
            .finish()
    }
}

impl CloudCredentials {
    /// Combine the config file with the secrets held in the environment
    pub fn from_config(config: &NodeConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: config.cloud.api_url.trim_end_matches('/').to_string(),
            org_id: config.cloud.org_id.clone(),
            product_key: config.cloud.product_key.clone(),
            access_key: config.get_access_key()?,
            access_secret: config.get_access_secret()?,
        })
    }
}

/// Short-lived bearer token; never persisted
pub struct AccessToken(String);

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    #[serde(rename = "appKey")]
    app_key: &'a str,
    encryption: String,
    timestamp: &'a str,
}

/// REST client that obtains tokens and signs authenticated calls
pub struct CloudAuthClient {
    client: Client,
    credentials: CloudCredentials,
    clock: Arc<dyn Clock>,
}

impl CloudAuthClient {
    pub fn new(
        credentials: CloudCredentials,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CloudError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            credentials,
            clock,
        })
    }

    pub fn credentials(&self) -> &CloudCredentials {
        &self.credentials
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.credentials.api_url, path)
    }

    /// Fetch a fresh access token
    pub async fn get_access_token(&self) -> Result<AccessToken, CloudError> {
        let timestamp = self.clock.now_ms().to_string();
        let request = TokenRequest {
            app_key: &self.credentials.access_key,
            encryption: access_token_signature(
                &self.credentials.access_key,
                &timestamp,
                &self.credentials.access_secret,
            ),
            timestamp: &timestamp,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| CloudError::Local(format!("token request encoding: {e}")))?;

        let response = self
            .client
            .post(self.url(TOKEN_PATH))
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        let value = read_json(TOKEN_PATH, response).await?;

        match value.pointer("/data/accessToken").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => {
                debug!("Obtained access token");
                Ok(AccessToken(token.to_string()))
            }
            _ => Err(CloudError::Auth(format!(
                "token response carried no accessToken: {}",
                sanitize_error_message(&value.to_string())
            ))),
        }
    }

    /// Authenticated GET
    pub async fn signed_get(
        &self,
        path: &str,
        params: BTreeMap<&str, String>,
    ) -> Result<Value, CloudError> {
        self.send_signed(Method::GET, path, params, None).await
    }

    /// Authenticated POST; `body` is signed and sent byte-for-byte
    pub async fn signed_post(
        &self,
        path: &str,
        params: BTreeMap<&str, String>,
        body: String,
    ) -> Result<Value, CloudError> {
        self.send_signed(Method::POST, path, params, Some(body))
            .await
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: BTreeMap<&str, String>,
        body: Option<String>,
    ) -> Result<Value, CloudError> {
        let token = self.get_access_token().await?;
        let timestamp = self.clock.now_ms().to_string();
        let signature = request_signature(
            token.as_str(),
            &params,
            &timestamp,
            &self.credentials.access_secret,
            body.as_deref().unwrap_or(""),
        );

        let mut request = self
            .client
            .request(method, self.url(path))
            .query(&params)
            .header(HEADER_ACCESS_TOKEN, token.as_str())
            .header(HEADER_SIGNATURE, signature)
            .header(HEADER_TIMESTAMP, timestamp);
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, JSON_CONTENT_TYPE).body(body);
        }

        let response = request.send().await?;
        read_json(path, response).await
    }
}

async fn read_json(endpoint: &str, response: reqwest::Response) -> Result<Value, CloudError> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        let detail = sanitize_error_message(&text);
        warn!(endpoint, status = %status, body = %detail, "Cloud API returned an error status");
        return Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                CloudError::Auth(format!("{endpoint}: {status}"))
            }
            _ => CloudError::protocol(endpoint, format!("status {status}: {detail}")),
        });
    }

    serde_json::from_str(&text)
        .map_err(|e| CloudError::protocol(endpoint, format!("invalid JSON body: {e}")))
}
