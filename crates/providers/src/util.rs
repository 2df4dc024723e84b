use ms_domain::{Error, Result};

pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Resolve the API key from the environment.
pub(crate) fn resolve_api_key() -> Result<String> {
    std::env::var("ANTHROPIC_API_KEY")
        .map_err(|_| Error::Config("ANTHROPIC_API_KEY is not set".into()))
}

pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    Error::Http(e.to_string())
}
