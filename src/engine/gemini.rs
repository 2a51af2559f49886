//! Google Gemini transports: the multimodal image engine and the text model.

use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{
    truncate, Artifact, EngineCapabilities, EngineError, EngineKind, EngineSettings,
    GenerationRequest, ImageEngine, TextEngine,
};

const STYLE_REFERENCE_NOTE: &str =
    "[STYLE REFERENCE] Follow the visual style and colors of the image above. Keep character features and layout.";

const PROJECTOR_NOTE: &str =
    "[STRICT TEXTURE MAPPING] Use the image above as the texture of the background screen. Do not alter its content.";

// ============================================================================
// Shared client
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

impl GenerateResponse {
    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
    }

    /// Why the model produced nothing usable, for error messages.
    fn refusal_reason(&self) -> String {
        let finish = self
            .candidates
            .first()
            .and_then(|c| c.finish_reason.clone());
        let text: Vec<&str> = self.parts().filter_map(|p| p.text.as_deref()).collect();
        match (finish, &self.prompt_feedback) {
            (Some(reason), _) if text.is_empty() => format!("finish reason {reason}"),
            (_, Some(feedback)) if text.is_empty() => truncate(&feedback.to_string(), 200),
            _ => truncate(&text.join(" "), 200),
        }
    }
}

#[derive(Debug, Clone)]
struct GeminiClient {
    http_client: ReqwestClient,
    api_key: Option<String>,
    base_url: String,
}

impl GeminiClient {
    fn new(settings: &EngineSettings, api_key: Option<String>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http_client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: settings.google_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn generate_content(
        &self,
        model: &str,
        body: &Value,
    ) -> Result<GenerateResponse, EngineError> {
        let Some(api_key) = &self.api_key else {
            return Err(EngineError::unavailable("Google API key not configured"));
        };

        let response = self
            .http_client
            .post(format!("{}/models/{model}:generateContent", self.base_url))
            .header("x-goog-api-key", api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::from_transport(&e))?;

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
            .json::<GenerateResponse>()
            .await
            .map_err(|e| EngineError::rejected(format!("malformed generateContent response: {e}")))
    }
}

// ============================================================================
// Image engine
// ============================================================================

/// Secondary, multimodal engine. Accepts reference images.
pub struct GeminiImageEngine {
    client: GeminiClient,
    model: String,
}

impl GeminiImageEngine {
    pub fn new(settings: &EngineSettings, api_key: Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: GeminiClient::new(settings, api_key)?,
            model: settings.google_image_model.clone(),
        })
    }

    /// Structured prompt payload; thumbnails and slides use different schemas.
    pub fn prompt_payload(request: &GenerationRequest) -> Value {
        let rules = request.learned_rules.trim();
        let feedback = request.feedback.as_deref().unwrap_or_default();
        match &request.overlay {
            Some(overlay) if overlay.is_thumbnail() => json!({
                "task": "thumbnail",
                "visual_description": request.prompt,
                "text_in_image": {
                    "title": overlay.title,
                    "subtitle": overlay.subtitle.clone().unwrap_or_default(),
                },
                "aspect_ratio": request.aspect_ratio.as_str(),
                "safety_rules": rules,
                "feedback_correction": feedback,
            }),
            Some(overlay) => json!({
                "task": "slide",
                "visual_description": request.prompt,
                "text_in_image": {
                    "title": overlay.title,
                    "body": overlay.body,
                },
                "aspect_ratio": request.aspect_ratio.as_str(),
                "safety_rules": rules,
                "feedback_correction": feedback,
            }),
            None => json!({
                "task": "image",
                "visual_description": request.prompt,
                "aspect_ratio": request.aspect_ratio.as_str(),
                "safety_rules": rules,
                "feedback_correction": feedback,
            }),
        }
    }

    fn request_body(request: &GenerationRequest) -> Value {
        let mut parts = Vec::new();
        if let Some(image) = &request.reference_image {
            parts.push(json!({
                "inlineData": { "mimeType": image.mime_type, "data": image.data }
            }));
            parts.push(json!({ "text": STYLE_REFERENCE_NOTE }));
        }
        if let Some(image) = &request.projector_image {
            parts.push(json!({
                "inlineData": { "mimeType": image.mime_type, "data": image.data }
            }));
            parts.push(json!({ "text": PROJECTOR_NOTE }));
        }
        parts.push(json!({ "text": Self::prompt_payload(request).to_string() }));
        json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "responseModalities": ["IMAGE", "TEXT"],
                "imageConfig": { "aspectRatio": request.aspect_ratio.as_str() },
            }
        })
    }
}

#[async_trait]
impl ImageEngine for GeminiImageEngine {
    async fn generate(&self, request: &GenerationRequest) -> Result<Artifact, EngineError> {
        let response = self
            .client
            .generate_content(&self.model, &Self::request_body(request))
            .await?;

        let image = response.parts().find_map(|p| p.inline_data.as_ref());
        match image {
            Some(data) => {
                debug!(mime = %data.mime_type, bytes = data.data.len(), "Received image part");
                Ok(Artifact::new(format!(
                    "data:{};base64,{}",
                    data.mime_type, data.data
                )))
            }
            None => Err(EngineError::rejected(format!(
                "no image in response: {}",
                response.refusal_reason()
            ))),
        }
    }

    fn name(&self) -> &str {
        "google-image"
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Google
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            image_to_image: true,
        }
    }
}

// ============================================================================
// Text engine
// ============================================================================

/// Google text model used for drafting, refinement and auto-fix.
pub struct GeminiTextEngine {
    client: GeminiClient,
    model: String,
}

impl GeminiTextEngine {
    pub fn new(settings: &EngineSettings, api_key: Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: GeminiClient::new(settings, api_key)?,
            model: settings.google_text_model.clone(),
        })
    }
}

#[async_trait]
impl TextEngine for GeminiTextEngine {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, EngineError> {
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });
        let response = self.client.generate_content(&self.model, &body).await?;

        let text: String = response
            .parts()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(EngineError::rejected(format!(
                "empty text response: {}",
                response.refusal_reason()
            )));
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FailureKind, ReferenceImage, TextOverlay};
    use crate::feedback::Scope;

    fn settings(base_url: &str) -> EngineSettings {
        EngineSettings {
            google_base_url: base_url.to_string(),
            ..Default::default()
        }
    }

    fn image_path() -> String {
        format!(
            "/models/{}:generateContent",
            EngineSettings::default().google_image_model
        )
    }

    fn text_path() -> String {
        format!(
            "/models/{}:generateContent",
            EngineSettings::default().google_text_model
        )
    }

    // =========================================================================
    // Payloads
    // =========================================================================

    #[test]
    fn test_payload_thumbnail_schema() {
        let mut req = GenerationRequest::new("neon city", Scope::thumbnail()).with_overlay(
            TextOverlay {
                title: "Top 10".into(),
                body: String::new(),
                subtitle: Some("Episode 4".into()),
            },
        );
        req.learned_rules = "\n[RULES]:\n1. No hands".into();
        let payload = GeminiImageEngine::prompt_payload(&req);
        assert_eq!(payload["task"], "thumbnail");
        assert_eq!(payload["text_in_image"]["subtitle"], "Episode 4");
        assert!(payload["safety_rules"].as_str().unwrap().contains("No hands"));
    }

    #[test]
    fn test_payload_slide_schema_with_feedback() {
        let req = GenerationRequest::new("diagram", Scope::slide_deck())
            .with_overlay(TextOverlay {
                title: "Cells".into(),
                body: "Mitochondria".into(),
                subtitle: None,
            })
            .with_feedback("text is misspelled");
        let payload = GeminiImageEngine::prompt_payload(&req);
        assert_eq!(payload["task"], "slide");
        assert_eq!(payload["text_in_image"]["body"], "Mitochondria");
        assert_eq!(payload["feedback_correction"], "text is misspelled");
    }

    #[test]
    fn test_request_body_puts_reference_first() {
        let req = GenerationRequest::new("restyle", Scope::remake_slide())
            .with_reference_image(ReferenceImage::from_base64("data:image/png;base64,QUJD"));
        let body = GeminiImageEngine::request_body(&req);
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["inlineData"]["data"], "QUJD");
        assert_eq!(parts[1]["text"], STYLE_REFERENCE_NOTE);
        assert!(parts[2]["text"].as_str().unwrap().contains("restyle"));
    }

    #[test]
    fn test_request_body_projector_after_reference() {
        let req = GenerationRequest::new("classroom with a screen", Scope::single())
            .with_reference_image(ReferenceImage::from_base64("QUJD"))
            .with_projector_image(ReferenceImage::from_base64("data:image/png;base64,WFla"));
        let body = GeminiImageEngine::request_body(&req);
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[2]["inlineData"]["data"], "WFla");
        assert_eq!(parts[2]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[3]["text"], PROJECTOR_NOTE);
    }

    // =========================================================================
    // Transport
    // =========================================================================

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let engine = GeminiImageEngine::new(&EngineSettings::default(), Some("  ".into())).unwrap();
        let err = engine
            .generate(&GenerationRequest::new("x", Scope::single()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Unavailable);
    }

    #[tokio::test]
    async fn test_image_part_becomes_data_uri() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", image_path().as_str())
            .match_header("x-goog-api-key", "key")
            .with_status(200)
            .with_body(
                r#"{"candidates":[{"content":{"parts":[{"text":"here"},{"inlineData":{"mimeType":"image/png","data":"AAAA"}}]}}]}"#,
            )
            .create_async()
            .await;

        let engine = GeminiImageEngine::new(&settings(&server.url()), Some("key".into())).unwrap();
        let artifact = engine
            .generate(&GenerationRequest::new("x", Scope::single()))
            .await
            .unwrap();
        assert_eq!(artifact.uri, "data:image/png;base64,AAAA");
    }

    #[tokio::test]
    async fn test_no_image_part_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", image_path().as_str())
            .with_status(200)
            .with_body(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#)
            .create_async()
            .await;

        let engine = GeminiImageEngine::new(&settings(&server.url()), Some("key".into())).unwrap();
        let err = engine
            .generate(&GenerationRequest::new("x", Scope::single()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);
        assert!(err.message.contains("SAFETY"));
    }

    #[tokio::test]
    async fn test_daily_quota_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", image_path().as_str())
            .with_status(429)
            .with_body(
                r#"{"error":{"code":429,"message":"Quota exceeded for quota metric 'GenerateRequestsPerDay'","status":"RESOURCE_EXHAUSTED"}}"#,
            )
            .create_async()
            .await;

        let engine = GeminiImageEngine::new(&settings(&server.url()), Some("key".into())).unwrap();
        let err = engine
            .generate(&GenerationRequest::new("x", Scope::single()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::DailyQuota);
    }

    #[tokio::test]
    async fn test_text_completion_joins_parts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", text_path().as_str())
            .with_status(200)
            .with_body(r#"{"candidates":[{"content":{"parts":[{"text":"[{\"title\":"},{"text":"\"A\"}]"}]}}]}"#)
            .create_async()
            .await;

        let engine = GeminiTextEngine::new(&settings(&server.url()), Some("key".into())).unwrap();
        let text = engine.complete("system", "prompt").await.unwrap();
        assert_eq!(text, r#"[{"title":"A"}]"#);
    }

    #[tokio::test]
    async fn test_text_server_fault() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", text_path().as_str())
            .with_status(503)
            .with_body(r#"{"error":{"message":"The model is overloaded."}}"#)
            .create_async()
            .await;

        let engine = GeminiTextEngine::new(&settings(&server.url()), Some("key".into())).unwrap();
        let err = engine.complete("s", "p").await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ServerFault);
    }
}
