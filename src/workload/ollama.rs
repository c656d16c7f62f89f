//! [`WorkloadBackend`] over the Ollama HTTP API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | load | `POST /api/generate {model, keep_alive}` |
//! | prime | `POST /api/generate {model, prompt:"ok", options:{num_predict:1}}` |
//! | run | `POST /api/generate {model, prompt, stream:false}` |
//! | unload | `POST /api/generate {model, keep_alive:0}` |
//! | ping | `GET /api/tags` |
//! | resident | `GET /api/ps` |
//!
//! Step deadlines are enforced by the lifecycle; the client timeout here is
//! only a backstop.

use super::{RunMetrics, RunOutput, WorkloadBackend, WorkloadInput, WorkloadUnit};
use crate::config::BackendConfig;
use crate::error::{Result, VigilError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    /// Nanoseconds.
    #[serde(default)]
    total_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsModel>,
}

#[derive(Debug, Deserialize)]
struct PsModel {
    #[serde(default)]
    name: String,
    #[serde(default)]
    model: Option<String>,
}

/// Ollama-compatible backend.
pub struct OllamaBackend {
    base_url: String,
    keep_alive: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(config: &BackendConfig) -> Self {
        let backstop = config
            .load_timeout_secs
            .max(config.run_timeout_secs)
            .saturating_add(30);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(backstop))
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            keep_alive: config.keep_alive.clone(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn generate(&self, body: Value) -> Result<GenerateResponse> {
        let url = format!("{}/api/generate", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VigilError::Backend(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.chars().take(500).collect::<String>()
            )));
        }

        resp.json::<GenerateResponse>()
            .await
            .map_err(|e| VigilError::Backend(format!("unrecognized generate response: {e}")))
    }
}

#[async_trait]
impl WorkloadBackend for OllamaBackend {
    async fn load(&self, unit: &WorkloadUnit) -> Result<()> {
        debug!(unit = %unit.identifier, "loading unit");
        self.generate(json!({
            "model": unit.identifier,
            "keep_alive": self.keep_alive,
        }))
        .await
        .map_err(|e| VigilError::Load(format!("{}: {e}", unit.identifier)))?;
        Ok(())
    }

    async fn prime(&self, unit: &WorkloadUnit) -> Result<()> {
        self.generate(json!({
            "model": unit.identifier,
            "prompt": "ok",
            "stream": false,
            "keep_alive": self.keep_alive,
            "options": { "num_predict": 1 },
        }))
        .await
        .map_err(|e| VigilError::Warmup(format!("{}: {e}", unit.identifier)))?;
        Ok(())
    }

    async fn run(&self, unit: &WorkloadUnit, input: &WorkloadInput) -> Result<RunOutput> {
        let resp = self
            .generate(json!({
                "model": unit.identifier,
                "prompt": input.prompt(),
                "stream": false,
                "keep_alive": self.keep_alive,
            }))
            .await
            .map_err(|e| VigilError::Execution(format!("{}: {e}", unit.identifier)))?;

        Ok(RunOutput {
            text: resp.response,
            metrics: RunMetrics {
                prompt_tokens: resp.prompt_eval_count.unwrap_or(0),
                output_tokens: resp.eval_count.unwrap_or(0),
                backend_ms: resp.total_duration.unwrap_or(0) / 1_000_000,
            },
        })
    }

    async fn unload(&self, unit: &WorkloadUnit) -> Result<()> {
        debug!(unit = %unit.identifier, "unloading unit");
        self.generate(json!({
            "model": unit.identifier,
            "keep_alive": 0,
        }))
        .await
        .map_err(|e| VigilError::Release(format!("{}: {e}", unit.identifier)))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(VigilError::Backend(format!(
                "HTTP {} from /api/tags",
                resp.status().as_u16()
            )))
        }
    }

    async fn resident(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/ps", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        if !resp.status().is_success() {
            return Err(VigilError::Backend(format!(
                "HTTP {} from /api/ps",
                resp.status().as_u16()
            )));
        }
        let ps = resp
            .json::<PsResponse>()
            .await
            .map_err(|e| VigilError::Backend(format!("unrecognized /api/ps response: {e}")))?;
        Ok(ps
            .models
            .into_iter()
            .map(|m| m.model.filter(|id| !id.is_empty()).unwrap_or(m.name))
            .filter(|id| !id.is_empty())
            .collect())
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> VigilError {
    if e.is_timeout() {
        VigilError::Backend("request timed out".to_owned())
    } else if e.is_connect() {
        VigilError::Backend("backend not running (connection refused)".to_owned())
    } else {
        VigilError::Backend(format!("transport error: {e}"))
    }
}
