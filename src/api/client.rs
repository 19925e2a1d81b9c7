use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::{
    api::{ApiResponse, DeviceLogsApi, LogsPage, LogsQuery},
    config::ApiConfig,
    pipeline::CollectorError,
};

/// HTTP client for the vendor cloud. Construction only builds the underlying
/// client; `connect` performs the credential handshake and must succeed
/// before any log fetch.
#[derive(Debug, Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    access_id: String,
    access_key: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResult {
    access_token: String,
}

impl CloudClient {
    pub fn new(cfg: &ApiConfig) -> anyhow::Result<Self> {
        let (access_id, access_key) = cfg.credentials()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.endpoint.trim_end_matches('/').to_string(),
            access_id: access_id.to_string(),
            access_key: access_key.to_string(),
            token: None,
        })
    }

    /// Exchanges the credential pair for a bearer token.
    pub async fn connect(&mut self) -> Result<(), CollectorError> {
        let url = format!("{}/v1.0/token", self.base_url);
        let body = serde_json::json!({
            "access_id": self.access_id,
            "access_key": self.access_key,
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }
        let envelope: ApiResponse<TokenResult> = resp.json().await.map_err(|e| {
            CollectorError::MalformedResponse(format!("failed to decode token response: {e}"))
        })?;
        if envelope.success == Some(false) {
            return Err(CollectorError::Auth(format!(
                "token handshake rejected: {}",
                envelope.msg.unwrap_or_default()
            )));
        }
        let result = envelope.result.ok_or_else(|| {
            CollectorError::MalformedResponse("token response missing result".to_string())
        })?;
        self.token = Some(result.access_token);
        tracing::info!("cloud api token obtained");
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeviceLogsApi for CloudClient {
    async fn device_logs(
        &self,
        device_id: &str,
        query: &LogsQuery,
    ) -> Result<LogsPage, CollectorError> {
        let token = self.token.as_deref().ok_or_else(|| {
            CollectorError::Auth("client is not connected; call connect first".to_string())
        })?;
        let url = format!("{}/v2.0/cloud/thing/{device_id}/logs", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }
        let envelope: ApiResponse<LogsPage> = resp.json().await.map_err(|e| {
            CollectorError::MalformedResponse(format!("failed to decode logs response: {e}"))
        })?;
        if envelope.success == Some(false) {
            return Err(CollectorError::MalformedResponse(format!(
                "logs query failed: {}",
                envelope.msg.unwrap_or_default()
            )));
        }
        envelope.result.ok_or_else(|| {
            CollectorError::MalformedResponse("logs response missing result".to_string())
        })
    }
}

fn request_error(e: reqwest::Error) -> CollectorError {
    CollectorError::TransientFetch(format!("request failed: {e}"))
}

fn status_error(status: StatusCode, body: &str) -> CollectorError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        CollectorError::Auth(format!("request rejected with {status}: {body}"))
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        CollectorError::TransientFetch(format!("server returned {status}: {body}"))
    } else {
        CollectorError::MalformedResponse(format!("unexpected status {status}: {body}"))
    }
}
