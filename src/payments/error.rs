use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Transport error: provider={provider}, message={message}")]
    Transport { provider: String, message: String },

    #[error("Provider {provider} timed out after {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },

    #[error("Invalid provider response: provider={provider}, message={message}")]
    InvalidResponse { provider: String, message: String },

    #[error("Provider configuration error: {message}")]
    Configuration { message: String },

    #[error("Provider {provider} does not support {operation}")]
    UnsupportedOperation { provider: String, operation: String },

    #[error("Webhook verification failed: {message}")]
    InvalidSignature { message: String },
}

impl ProviderError {
    /// No classifiable response was received; the request may or may not have
    /// reached the upstream.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport { .. } | ProviderError::Timeout { .. }
        )
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            ProviderError::Transport { provider, .. }
            | ProviderError::Timeout { provider, .. }
            | ProviderError::InvalidResponse { provider, .. }
            | ProviderError::UnsupportedOperation { provider, .. } => Some(provider),
            ProviderError::Configuration { .. } | ProviderError::InvalidSignature { .. } => None,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            ProviderError::Transport { .. } => 503,
            ProviderError::Timeout { .. } => 504,
            ProviderError::InvalidResponse { .. } => 502,
            ProviderError::Configuration { .. } => 500,
            ProviderError::UnsupportedOperation { .. } => 501,
            ProviderError::InvalidSignature { .. } => 401,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport {
            provider: "http".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_timeout_count_as_transport() {
        let transport = ProviderError::Transport {
            provider: "digiflazz".to_string(),
            message: "connection reset".to_string(),
        };
        let timeout = ProviderError::Timeout {
            provider: "digiflazz".to_string(),
            timeout_secs: 30,
        };
        let invalid = ProviderError::InvalidResponse {
            provider: "digiflazz".to_string(),
            message: "missing rc".to_string(),
        };

        assert!(transport.is_transport());
        assert!(timeout.is_transport());
        assert!(!invalid.is_transport());
        assert_eq!(timeout.http_status_code(), 504);
        assert_eq!(invalid.provider(), Some("digiflazz"));
    }
}
