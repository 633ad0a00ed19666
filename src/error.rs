use thiserror::Error;

#[derive(Error, Debug)]
pub enum DormantError {
    #[error("GitHub API error ({status}) for {url}: {message}")]
    ApiError {
        status: u16,
        url: String,
        message: String,
    },

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Rate limit exceeded, retry budget exhausted for {0}")]
    RateLimitExceeded(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Octocrab error: {0}")]
    OctocrabError(#[from] octocrab::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Malformed report: {0}")]
    ReportFormat(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DormantError {
    /// Server-side and connection failures are worth another attempt;
    /// malformed payloads and client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DormantError::ApiError { status, .. } => *status >= 500,
            DormantError::Transport(_) => true,
            // Anything that went wrong on the wire. Requests that could not
            // be built, bad redirects and undecodable bodies fail the same way
            // every time.
            DormantError::NetworkError(e) => {
                !(e.is_builder() || e.is_redirect() || e.is_decode() || e.is_status())
            }
            _ => false,
        }
    }

    /// GitHub answers 409 "Git Repository is empty." for repos without commits.
    pub fn is_empty_repository(&self) -> bool {
        matches!(
            self,
            DormantError::ApiError { status: 409, message, .. }
                if message.contains("Git Repository is empty")
        )
    }
}

pub type Result<T> = std::result::Result<T, DormantError>;
