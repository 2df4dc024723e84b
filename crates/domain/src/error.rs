/// Shared error type used across all Maestro crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("session not started")]
    NotStarted,

    #[error("session start failed: {0}")]
    StartFailed(String),

    #[error("session start timed out after {0}s")]
    StartTimeout(u64),

    #[error("no session with ID {0}")]
    UnknownSession(String),

    #[error("an orchestrator session is already active")]
    OrchestratorActive,

    #[error("no voice event received within {0}s")]
    VoiceTimeout(u64),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("interrupted")]
    Interrupted,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The stable wire string for this error, matching the `error` field of
    /// the `error` frames sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io_error",
            Error::Json(_) => "invalid_json",
            Error::Http(_) => "http_error",
            Error::NotStarted => "not_started",
            Error::StartFailed(_) => "start_failed",
            Error::StartTimeout(_) => "start_timeout",
            Error::UnknownSession(_) => "unknown_session",
            Error::OrchestratorActive => "orchestrator_active",
            Error::VoiceTimeout(_) => "voice_timeout",
            Error::Provider { .. } => "provider_error",
            Error::Interrupted => "interrupted",
            Error::Timeout(_) => "timeout",
            Error::Config(_) => "config_error",
            Error::Other(_) => "error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_wire_taxonomy() {
        assert_eq!(Error::NotStarted.kind(), "not_started");
        assert_eq!(Error::StartTimeout(30).kind(), "start_timeout");
        assert_eq!(Error::OrchestratorActive.kind(), "orchestrator_active");
        assert_eq!(Error::VoiceTimeout(30).kind(), "voice_timeout");
        assert_eq!(Error::Interrupted.kind(), "interrupted");
    }

    #[test]
    fn display_includes_detail() {
        let e = Error::StartFailed("spawn failed".into());
        assert!(e.to_string().contains("spawn failed"));
    }
}
