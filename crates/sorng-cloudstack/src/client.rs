//! CloudStack HTTP API client.
//!
//! Every call is a signed `command=…&response=json&apiKey=…` request against
//! the configured endpoint, sent as a GET query string or a POST form body.
//! Responses come wrapped as `{"<command>response": {...}}`; the envelope is
//! stripped before the object is handed back.

use crate::api::{ApiParams, CloudStackApi, Command};
use crate::config::{CloudStackConfig, HttpMethod};
use crate::error::{CloudStackError, CloudStackResult};
use crate::signing;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Signed CloudStack API client backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct CloudStackClient {
    http: Client,
    config: CloudStackConfig,
    user_agent: String,
}

impl CloudStackClient {
    /// Build a new client from config.
    pub fn new(config: &CloudStackConfig) -> CloudStackResult<Self> {
        config.validate()?;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CloudStackError::connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config: config.clone(),
            user_agent: "SortOfRemoteNG/1.0 cloudstack-client/0.1".to_string(),
        })
    }

    /// Current config.
    pub fn config(&self) -> &CloudStackConfig {
        &self.config
    }

    /// Add the fixed parameters every command carries.
    fn full_params(&self, command: Command, mut params: ApiParams) -> ApiParams {
        params.insert("command".into(), command.as_str().into());
        params.insert("response".into(), "json".into());
        params.insert("apiKey".into(), self.config.api_key.clone());
        params
    }
}

#[async_trait]
impl CloudStackApi for CloudStackClient {
    async fn execute(&self, command: Command, params: ApiParams) -> CloudStackResult<Value> {
        let params = self.full_params(command, params);
        let query = signing::signed_query(&params, &self.config.secret_key);

        log::debug!("CloudStack {} {}", self.config.method, command);

        let request = match self.config.method {
            HttpMethod::Get => self
                .http
                .get(format!("{}?{}", self.config.endpoint, query)),
            HttpMethod::Post => self
                .http
                .post(&self.config.endpoint)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(query),
        };

        let resp = request
            .header("User-Agent", &self.user_agent)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| {
            CloudStackError::parse(format!("Failed to read response body: {e}"))
        })?;

        unwrap_response(command, status, &body)
    }
}

/// Strip the response envelope and normalise HTTP-level failures.
pub(crate) fn unwrap_response(
    command: Command,
    status: u16,
    body: &str,
) -> CloudStackResult<Value> {
    let parsed: Option<Value> = if body.trim().is_empty() {
        None
    } else {
        serde_json::from_str(body).ok()
    };

    let inner = parsed.as_ref().and_then(|v| envelope(command, v));

    if !(200..300).contains(&status) {
        let text = inner
            .as_ref()
            .and_then(|v| v.get("errortext"))
            .and_then(Value::as_str);

        return Err(match (status, text) {
            (401, Some(t)) => CloudStackError::auth(t.to_string()),
            (401, None) => CloudStackError::auth("Signature or API key rejected"),
            (_, Some(t)) => {
                log::warn!("CloudStack {command} failed with HTTP {status}: {t}");
                CloudStackError::operation_failed(t.to_string())
            }
            (code, None) => CloudStackError::api(
                code,
                format!("API error {code}: {}", truncate(body)),
            ),
        });
    }

    if parsed.is_none() {
        return Err(CloudStackError::parse(format!(
            "{command}: response is not JSON: {}",
            truncate(body)
        )));
    }

    inner.ok_or_else(|| CloudStackError::parse(format!("{command}: missing response envelope")))
}

fn truncate(body: &str) -> String {
    body.chars().take(500).collect()
}

fn envelope(command: Command, value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    let expected = format!("{}response", command.as_str().to_ascii_lowercase());

    if let Some(v) = obj.get(&expected) {
        return Some(v.clone());
    }
    if let Some(v) = obj.get("errorresponse") {
        return Some(v.clone());
    }
    obj.iter()
        .find(|(k, _)| k.ends_with("response"))
        .map(|(_, v)| v.clone())
}
