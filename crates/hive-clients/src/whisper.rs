//! Whisper transcription client: multipart audio upload, text out.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use hive_core::config::WhisperConfig;
use hive_core::{HiveError, Result};

use crate::breaker::CircuitBreaker;
use crate::error::{classify_reqwest, classify_status};

pub struct WhisperClient {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl WhisperClient {
    pub fn new(config: &WhisperConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            breaker,
        }
    }

    /// Transcribe an OGG/Opus voice note. `duration_secs` is only used for
    /// logging; limits are enforced before download.
    pub async fn transcribe(&self, bytes: Vec<u8>, duration_secs: u64) -> Result<String> {
        self.breaker
            .guard(self.transcribe_inner(bytes, duration_secs))
            .await
    }

    async fn transcribe_inner(&self, bytes: Vec<u8>, duration_secs: u64) -> Result<String> {
        let url = format!("{}/v1/audio/transcriptions", self.api_base);
        debug!(bytes = bytes.len(), duration_secs, "whisper request");

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("voice.ogg")
            .mime_str("audio/ogg")
            .map_err(|e| HiveError::Internal(format!("multipart build failed: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify_reqwest("whisper", e))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "whisper api error");
            return Err(classify_status("whisper", status, None, &text));
        }

        let parsed: TranscriptionResponse =
            resp.json().await.map_err(|e| HiveError::PermanentExternal {
                service: "whisper".to_string(),
                reason: format!("undecodable response: {e}"),
            })?;
        Ok(parsed.text)
    }
}
