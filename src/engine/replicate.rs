//! FLUX text-to-image over the Replicate predictions API.
//!
//! Replicate predictions are asynchronous: the create call returns a status
//! URL that is polled until the prediction settles.

use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    truncate, Artifact, EngineCapabilities, EngineError, EngineKind, EngineSettings,
    GenerationRequest, ImageEngine,
};

/// Characters of body text quoted into the prompt.
const BODY_EXCERPT_CHARS: usize = 50;

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: Option<String>,
}

impl Prediction {
    fn first_output(&self) -> Option<String> {
        match self.output.as_ref()? {
            serde_json::Value::String(url) => Some(url.clone()),
            serde_json::Value::Array(items) => items.first()?.as_str().map(str::to_string),
            _ => None,
        }
    }
}

/// Primary, cheap engine. No reference-image support.
pub struct ReplicateFluxEngine {
    http_client: ReqwestClient,
    token: Option<String>,
    base_url: String,
    model: String,
    poll_max_attempts: u32,
    poll_interval: Duration,
}

impl ReplicateFluxEngine {
    /// Build from settings; a missing token makes every call `Unavailable`.
    pub fn new(settings: &EngineSettings, token: Option<String>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http_client,
            token: token.filter(|t| !t.trim().is_empty()),
            base_url: settings.replicate_base_url.trim_end_matches('/').to_string(),
            model: settings.replicate_model.clone(),
            poll_max_attempts: settings.poll_max_attempts,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        })
    }

    /// Render the overlay and learned rules into a single text prompt.
    pub fn render_prompt(request: &GenerationRequest) -> String {
        let mut prompt = request.prompt.trim().to_string();
        if let Some(overlay) = &request.overlay {
            if !overlay.title.is_empty() {
                prompt.push_str(&format!(
                    "\nTEXT IN IMAGE: \"{}\"",
                    overlay.title.to_uppercase()
                ));
            }
            if let Some(subtitle) = overlay.subtitle.as_deref().filter(|s| !s.is_empty()) {
                prompt.push_str(&format!("\nSUBTITLE: \"{subtitle}\""));
            }
            if !overlay.body.is_empty() {
                let excerpt: String = overlay.body.chars().take(BODY_EXCERPT_CHARS).collect();
                prompt.push_str(&format!("\nBODY TEXT: \"{excerpt}\""));
            }
        }
        if let Some(feedback) = request.feedback.as_deref().filter(|f| !f.is_empty()) {
            prompt.push_str(&format!("\nCORRECTION: {feedback}"));
        }
        if !request.learned_rules.is_empty() {
            prompt.push_str(&request.learned_rules);
        }
        prompt
    }

    async fn read_prediction(&self, response: reqwest::Response) -> Result<Prediction, EngineError> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(EngineError::from_response(
                status.as_u16(),
                &body,
                retry_after.as_deref(),
            ));
        }
        response
            .json::<Prediction>()
            .await
            .map_err(|e| EngineError::rejected(format!("malformed prediction: {e}")))
    }

    fn settle(prediction: &Prediction) -> Option<Result<Artifact, EngineError>> {
        match prediction.status.as_str() {
            "succeeded" => Some(
                prediction
                    .first_output()
                    .map(Artifact::new)
                    .ok_or_else(|| EngineError::rejected("prediction succeeded without output")),
            ),
            "failed" | "canceled" => {
                let reason = prediction
                    .error
                    .as_ref()
                    .map(|e| truncate(&e.to_string(), 200))
                    .unwrap_or_else(|| prediction.status.clone());
                Some(Err(EngineError::unavailable(format!(
                    "prediction {}: {reason}",
                    prediction.status
                ))))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ImageEngine for ReplicateFluxEngine {
    async fn generate(&self, request: &GenerationRequest) -> Result<Artifact, EngineError> {
        let Some(token) = &self.token else {
            return Err(EngineError::unavailable("Replicate token not configured"));
        };

        let body = json!({
            "input": {
                "prompt": Self::render_prompt(request),
                "aspect_ratio": request.aspect_ratio.as_str(),
                "output_format": "png",
                "num_outputs": 1,
            }
        });
        let response = self
            .http_client
            .post(format!("{}/models/{}/predictions", self.base_url, self.model))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::from_transport(&e))?;
        let mut prediction = self.read_prediction(response).await?;

        for poll in 0..self.poll_max_attempts {
            if let Some(outcome) = Self::settle(&prediction) {
                return outcome;
            }
            let Some(url) = prediction.urls.as_ref().and_then(|u| u.get.clone()) else {
                return Err(EngineError::rejected("prediction has no status URL"));
            };
            debug!(poll, status = %prediction.status, "Polling prediction");
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .http_client
                .get(&url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| EngineError::from_transport(&e))?;
            prediction = self.read_prediction(response).await?;
        }

        if let Some(outcome) = Self::settle(&prediction) {
            return outcome;
        }
        warn!(
            polls = self.poll_max_attempts,
            "Prediction did not settle in time"
        );
        Err(EngineError::unavailable("prediction timed out"))
    }

    fn name(&self) -> &str {
        "replicate-flux"
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Flux
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            image_to_image: false,
        }
    }
}
