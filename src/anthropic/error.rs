//! Tipos de erro para o cliente da API Anthropic.
//!
//! Define [`AnthropicError`] com variantes para rate limiting, erros da API
//! e erros de rede, e a classificação em [`ProviderError`] transitório ou
//! fatal consumida pelo pipeline.

use thiserror::Error;

use crate::invoker::ProviderError;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429.
    /// `retry_after_ms` indica quanto esperar antes de tentar de novo.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Qualquer outro status HTTP de erro, com o corpo da resposta.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede (DNS, conexão recusada, timeout) ou corpo ilegível.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl AnthropicError {
    /// Se a mesma requisição pode funcionar mais tarde.
    pub fn is_transient(&self) -> bool {
        match self {
            AnthropicError::RateLimited { .. } => true,
            // 529 = overloaded
            AnthropicError::ApiError { status, .. } => {
                matches!(status, 408 | 409 | 429 | 500..=599)
            }
            AnthropicError::NetworkError(e) => e.is_timeout() || e.is_connect(),
        }
    }
}

impl From<AnthropicError> for ProviderError {
    fn from(err: AnthropicError) -> Self {
        if err.is_transient() {
            ProviderError::Transient(err.to_string())
        } else {
            ProviderError::Fatal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = AnthropicError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn api_error_display() {
        let err = AnthropicError::ApiError {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
    }

    #[test]
    fn classification_into_provider_errors() {
        let transient = [
            AnthropicError::RateLimited { retry_after_ms: 1000 },
            AnthropicError::ApiError { status: 500, message: "boom".into() },
            AnthropicError::ApiError { status: 529, message: "overloaded".into() },
        ];
        for err in transient {
            assert!(ProviderError::from(err).is_transient());
        }

        let fatal = [
            AnthropicError::ApiError { status: 400, message: "bad".into() },
            AnthropicError::ApiError { status: 401, message: "key".into() },
        ];
        for err in fatal {
            assert!(!ProviderError::from(err).is_transient());
        }
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AnthropicError>();
    }
}
