use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::error::AnthropicError;
use super::types::{Message, MessagesRequest, MessagesResponse};
use crate::invoker::{InvocationRequest, ModelInvoker, ProviderError, RawOutput};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const STRUCTURED_SYSTEM_PROMPT: &str =
    "Respond with JSON only. Do not wrap the JSON in prose or code fences.";

pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, API_URL.to_string())
    }

    /// Create a client pointing at a custom endpoint (used by tests).
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self, AnthropicError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url,
        })
    }

    pub async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(1000);
            return Err(AnthropicError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AnthropicError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<MessagesResponse>().await?;
        Ok(body)
    }
}

#[async_trait]
impl ModelInvoker for AnthropicClient {
    async fn invoke(&self, request: InvocationRequest) -> Result<RawOutput, ProviderError> {
        let req = MessagesRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            system: request
                .structured
                .then(|| STRUCTURED_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(
                &request.prompt,
                request.mode,
                request.attachment.as_ref(),
            )],
        };

        let response = self.send_message(&req).await?;
        debug!(
            id = %response.id,
            model = %response.model,
            stop_reason = ?response.stop_reason,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "message received"
        );
        Ok(RawOutput::Text(response.text()))
    }
}
