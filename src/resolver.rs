//! Lookup of session identifiers against the command server.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const LOOKUP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("command server request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("command server returned {0}")]
    Status(reqwest::StatusCode),
}

/// Fetches `{ "<id>": ["prog", "arg", ...] }` from the command server.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    client: reqwest::Client,
    url: String,
}

impl CommandResolver {
    pub fn new(url: impl Into<String>) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LOOKUP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the full mapping. Called per request so edits on the command
    /// server take effect immediately.
    pub async fn mapping(&self) -> Result<HashMap<String, Vec<String>>, ResolveError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(ResolveError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }

    /// Resolve one session id. Unknown ids and empty commands give `None`.
    pub async fn resolve(&self, id: &str) -> Result<Option<Vec<String>>, ResolveError> {
        let mut mapping = self.mapping().await?;
        let command = mapping.remove(id).filter(|cmd| !cmd.is_empty());
        debug!(id, found = command.is_some(), "Resolved session id");
        Ok(command)
    }
}
