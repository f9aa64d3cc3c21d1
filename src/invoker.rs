//! Boundary to the generative model provider.
//!
//! The pipeline only ever sees [`ModelInvoker`]: a prompt goes in, raw text
//! (or image bytes) or a [`ProviderError`] comes out. The Anthropic client in
//! [`crate::anthropic`] is one implementation, [`DryRunInvoker`] another.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the prompt is accompanied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    Text,
    Document,
    Image,
}

/// Binary input sent alongside a prompt (a PDF or an image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// A fully resolved request for one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub prompt: String,
    /// Provider-side model name, already resolved from the logical model id.
    pub model: String,
    pub max_tokens: u32,
    pub mode: InvocationMode,
    pub attachment: Option<Attachment>,
    /// The caller will try to decode JSON records from the answer.
    pub structured: bool,
}

/// Raw model output, before any extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOutput {
    Text(String),
    Image { media_type: String, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Worth retrying later: rate limits, overload, timeouts, 5xx.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Retrying the same request will not help: auth, malformed request.
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<RawOutput, ProviderError>;
}

/// Offline invoker used when no API key is configured.
///
/// Structured requests get an empty JSON array ("no findings"); free-form
/// requests get the prompt echoed back under a marker line.
pub struct DryRunInvoker;

#[async_trait]
impl ModelInvoker for DryRunInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<RawOutput, ProviderError> {
        tracing::debug!(model = %request.model, mode = ?request.mode, "dry-run invocation");
        if request.structured {
            return Ok(RawOutput::Text("[]".to_string()));
        }
        Ok(RawOutput::Text(format!(
            "[dry-run {}]\n{}",
            request.model, request.prompt
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(structured: bool) -> InvocationRequest {
        InvocationRequest {
            prompt: "Translate this".into(),
            model: "claude-haiku-4-5-20251001".into(),
            max_tokens: 256,
            mode: InvocationMode::Text,
            attachment: None,
            structured,
        }
    }

    #[tokio::test]
    async fn dry_run_answers_structured_requests_with_empty_array() {
        let out = DryRunInvoker.invoke(request(true)).await.unwrap();
        assert_eq!(out, RawOutput::Text("[]".into()));
    }

    #[tokio::test]
    async fn dry_run_echoes_free_form_prompt() {
        let out = DryRunInvoker.invoke(request(false)).await.unwrap();
        match out {
            RawOutput::Text(text) => {
                assert!(text.starts_with("[dry-run claude-haiku-4-5-20251001]"));
                assert!(text.ends_with("Translate this"));
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn provider_error_classification() {
        assert!(ProviderError::Transient("429".into()).is_transient());
        assert!(!ProviderError::Fatal("401".into()).is_transient());
        assert_eq!(
            ProviderError::Fatal("bad request".into()).to_string(),
            "fatal provider error: bad request"
        );
    }
}
