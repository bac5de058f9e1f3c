//! Hub API seam
//!
//! Everything that talks to the backend HTTP API goes through the [`Backend`]
//! trait so the session cache, router and injection workers can be exercised
//! in tests without a live server.

use std::time::Duration;

use serde_json::json;

use crate::error::{HubError, Result};
use crate::types::Session;

/// Client interface to the hub's HTTP API.
pub trait Backend: Send + Sync + 'static {
    /// Fetch the current live-session list (uncached).
    ///
    /// # Errors
    /// Returns error when the backend is unreachable or replies with a
    /// non-success status.
    fn fetch_sessions(&self) -> impl std::future::Future<Output = Result<Vec<Session>>> + Send;

    /// Deliver `text` as a prompt to a session. The backend replies 200 or
    /// 204 when the prompt was accepted.
    ///
    /// # Errors
    /// Returns error on network failure or a non-success status.
    fn send_prompt(
        &self,
        session_id: &str,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// [`Backend`] implementation over reqwest.
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    prompt_timeout: Duration,
}

impl HttpBackend {
    /// Create a backend client for `base_url` with the given per-injection
    /// timeout.
    pub fn new(base_url: impl Into<String>, prompt_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            prompt_timeout,
        }
    }
}

impl Backend for HttpBackend {
    async fn fetch_sessions(&self) -> Result<Vec<Session>> {
        let resp = self
            .http
            .get(format!("{}/session", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn send_prompt(&self, session_id: &str, text: &str) -> Result<()> {
        // prompt_async triggers an LLM turn even when the session is idle;
        // the plain message endpoint only appends context.
        let resp = self
            .http
            .post(format!("{}/session/{session_id}/prompt_async", self.base_url))
            .timeout(self.prompt_timeout)
            .json(&json!({"parts": [{"type": "text", "text": text}]}))
            .send()
            .await?;

        match resp.status().as_u16() {
            200 | 204 => Ok(()),
            status => Err(HubError::InjectionRejected {
                session_id: session_id.to_string(),
                status,
            }),
        }
    }
}
