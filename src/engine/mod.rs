//! Generation engine abstraction.
//!
//! Every backing provider implements [`ImageEngine`] (or [`TextEngine`] for
//! the text model used by the assist services). Transports never raise
//! free-form errors: a failed call returns an [`EngineError`] whose
//! [`FailureKind`] is decided once, at the HTTP boundary, so the retry
//! layer can work from a closed enum instead of message text.
//!
//! # Architecture
//!
//! ```text
//! BatchRunner ──> GenerationPipeline ──> EngineSelector ──> RetryPolicy ──> ImageEngine
//!                                              │                               │
//!                                              └──── fallback on Unavailable ──┘
//! ```

pub mod gemini;
pub mod mock;
pub mod replicate;
pub mod selector;

pub use gemini::{GeminiImageEngine, GeminiTextEngine};
pub use mock::{MockImageEngine, MockTextEngine};
pub use replicate::ReplicateFluxEngine;
pub use selector::{EngineDecision, EngineSelector, FallbackConfig, Generation};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::feedback::Scope;
use crate::retry::ErrorClass;

// =============================================================================
// Engine identity
// =============================================================================

/// Backing engine families, used for pricing and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// FLUX via Replicate: cheap and fast, text-to-image only.
    Flux,
    /// Google multimodal image model: supports reference images.
    Google,
}

impl EngineKind {
    /// Parse an engine name from settings or CLI input.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "flux" | "replicate" => Some(Self::Flux),
            "google" | "gemini" => Some(Self::Google),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flux => write!(f, "flux"),
            Self::Google => write!(f, "google"),
        }
    }
}

/// What an engine can do beyond plain text-to-image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Accepts a reference image for style transfer / remakes.
    pub image_to_image: bool,
}

// =============================================================================
// Requests and artifacts
// =============================================================================

/// Output frame shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    #[value(name = "1:1")]
    Square,
    #[serde(rename = "3:4")]
    #[value(name = "3:4")]
    Portrait,
    #[serde(rename = "4:3")]
    #[value(name = "4:3")]
    Landscape,
    #[serde(rename = "16:9")]
    #[value(name = "16:9")]
    Wide,
    #[serde(rename = "9:16")]
    #[value(name = "9:16")]
    Tall,
}

impl AspectRatio {
    /// Wire form accepted by both providers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Portrait => "3:4",
            Self::Landscape => "4:3",
            Self::Wide => "16:9",
            Self::Tall => "9:16",
        }
    }
}

/// Verbatim text the image must carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextOverlay {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
}

impl TextOverlay {
    /// Thumbnails carry a subtitle, or a title with no body.
    #[must_use]
    pub fn is_thumbnail(&self) -> bool {
        self.subtitle.is_some() || (self.body.is_empty() && !self.title.is_empty())
    }
}

/// Inline reference image (base64, optionally a data URI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub mime_type: String,
    pub data: String,
}

impl ReferenceImage {
    /// Build from a data URI or raw base64 payload.
    #[must_use]
    pub fn from_base64(data: &str) -> Self {
        let (mime_type, payload) = match data.split_once(',') {
            Some((header, payload)) => {
                let mime = header
                    .trim_start_matches("data:")
                    .split(';')
                    .next()
                    .filter(|m| !m.is_empty())
                    .unwrap_or("image/jpeg");
                (mime.to_string(), payload.to_string())
            }
            None => ("image/jpeg".to_string(), data.to_string()),
        };
        Self {
            mime_type,
            data: payload,
        }
    }
}

/// One fully-assembled generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub overlay: Option<TextOverlay>,
    pub aspect_ratio: AspectRatio,
    pub reference_image: Option<ReferenceImage>,
    /// Picture to show on a screen inside the scene, kept unaltered.
    pub projector_image: Option<ReferenceImage>,
    pub scope: Scope,
    /// Correction note for a manual regenerate.
    pub feedback: Option<String>,
    /// Formatted rule block pulled from the feedback store.
    pub learned_rules: String,
}

impl GenerationRequest {
    /// Create a request with defaults for everything but the prompt.
    pub fn new(prompt: impl Into<String>, scope: Scope) -> Self {
        Self {
            prompt: prompt.into(),
            overlay: None,
            aspect_ratio: AspectRatio::default(),
            reference_image: None,
            projector_image: None,
            scope,
            feedback: None,
            learned_rules: String::new(),
        }
    }

    #[must_use]
    pub fn with_overlay(mut self, overlay: TextOverlay) -> Self {
        self.overlay = Some(overlay);
        self
    }

    #[must_use]
    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    #[must_use]
    pub fn with_reference_image(mut self, image: ReferenceImage) -> Self {
        self.reference_image = Some(image);
        self
    }

    #[must_use]
    pub fn with_projector_image(mut self, image: ReferenceImage) -> Self {
        self.projector_image = Some(image);
        self
    }

    #[must_use]
    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }

    /// Capabilities this request needs from an engine.
    #[must_use]
    pub fn required_capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            image_to_image: self.reference_image.is_some() || self.projector_image.is_some(),
        }
    }
}

/// Reference to a produced image (remote URL or data URI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub uri: String,
}

impl Artifact {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

// =============================================================================
// Engine errors
// =============================================================================

/// Failure signal carried by every transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Provider's daily request quota is spent.
    DailyQuota,
    /// Key invalid, permission or billing denied.
    PermissionDenied,
    /// Per-minute rate limit (HTTP 429 / resource exhausted).
    RateLimited,
    /// Provider-side fault (HTTP 5xx / overloaded).
    ServerFault,
    /// Engine unreachable or not configured.
    Unavailable,
    /// Request refused or response unusable.
    Rejected,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DailyQuota => "daily quota exceeded",
            Self::PermissionDenied => "permission denied",
            Self::RateLimited => "rate limited",
            Self::ServerFault => "server fault",
            Self::Unavailable => "engine unavailable",
            Self::Rejected => "request rejected",
        };
        write!(f, "{s}")
    }
}

/// Structured failure from a generation transport.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: FailureKind,
    pub message: String,
    /// Provider-suggested wait before the next attempt.
    pub retry_after: Option<Duration>,
}

impl EngineError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }

    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Taxonomy class for retry and halt decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        ErrorClass::from(self.kind)
    }

    /// Map an HTTP error response to a structured failure.
    ///
    /// Quota markers win over the status code: providers report daily
    /// exhaustion as a 429 that must not be retried.
    pub fn from_response(status: u16, body: &str, retry_after_header: Option<&str>) -> Self {
        let kind = classify_response(status, body);
        let mut err = Self::new(kind, format!("HTTP {status}: {}", truncate(body, 500)));
        if kind == FailureKind::RateLimited {
            let hint = retry_after_header
                .and_then(|h| h.trim().parse::<f64>().ok())
                .and_then(hint_from_secs)
                .or_else(|| extract_retry_hint(body));
            if let Some(delay) = hint {
                err = err.with_retry_after(delay);
            }
        }
        err
    }

    /// Map a transport-level failure (DNS, TLS, connect, timeout).
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(FailureKind::ServerFault, format!("request timed out: {err}"))
        } else {
            Self::unavailable(format!("transport failure: {err}"))
        }
    }
}

fn classify_response(status: u16, body: &str) -> FailureKind {
    let lower = body.to_lowercase();
    if lower.contains("generaterequestsperday")
        || lower.contains("per_day")
        || lower.contains("perday")
        || lower.contains("daily_quota_exceeded")
    {
        return FailureKind::DailyQuota;
    }
    if status == 401
        || status == 403
        || lower.contains("permission_denied")
        || lower.contains("the caller does not have permission")
        || lower.contains("billing")
    {
        return FailureKind::PermissionDenied;
    }
    if status == 429
        || lower.contains("resource_exhausted")
        || lower.contains("resource has been exhausted")
    {
        return FailureKind::RateLimited;
    }
    if (500..=599).contains(&status) || lower.contains("overloaded") {
        return FailureKind::ServerFault;
    }
    FailureKind::Rejected
}

fn retry_hint_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)retry (?:in|after) (\d+(?:\.\d+)?)\s*s").ok())
        .as_ref()
}

/// Pull a "retry in N s" hint out of provider text.
#[must_use]
pub fn extract_retry_hint(text: &str) -> Option<Duration> {
    let caps = retry_hint_regex()?.captures(text)?;
    let secs: f64 = caps.get(1)?.as_str().parse().ok()?;
    hint_from_secs(secs)
}

/// Provider-supplied waits that are not finite and positive, or that
/// overflow a `Duration`, carry no hint.
fn hint_from_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

// =============================================================================
// Engine traits
// =============================================================================

/// A backing image generation provider.
///
/// Implementations resolve with an [`Artifact`] or fail with a classified
/// [`EngineError`]; they never retry on their own.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Issue one generation call.
    async fn generate(&self, request: &GenerationRequest) -> Result<Artifact, EngineError>;

    /// Human-readable engine name for logs.
    fn name(&self) -> &str;

    /// Pricing family.
    fn kind(&self) -> EngineKind;

    fn capabilities(&self) -> EngineCapabilities;
}

/// A text model used for drafting, prompt refinement and auto-fix.
#[async_trait]
pub trait TextEngine: Send + Sync {
    /// Run one completion with a system instruction.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, EngineError>;

    fn name(&self) -> &str;
}

// =============================================================================
// Engine settings
// =============================================================================

/// Engine section of the settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Preferred engine for plain text-to-image requests.
    pub primary: String,
    /// Engine used for fallback and image-to-image requests.
    pub secondary: String,
    /// Fall back to the secondary engine when the primary is unreachable.
    pub fallback: bool,
    /// Env var holding the Replicate token.
    pub replicate_token_env: String,
    /// Env var holding the Google API key.
    pub google_api_key_env: String,
    pub replicate_model: String,
    pub google_image_model: String,
    pub google_text_model: String,
    pub replicate_base_url: String,
    pub google_base_url: String,
    pub request_timeout_secs: u64,
    /// Status polls before an asynchronous prediction is abandoned.
    pub poll_max_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            primary: "flux".to_string(),
            secondary: "google".to_string(),
            fallback: true,
            replicate_token_env: "REPLICATE_API_TOKEN".to_string(),
            google_api_key_env: "GEMINI_API_KEY".to_string(),
            replicate_model: "black-forest-labs/flux-schnell".to_string(),
            google_image_model: "gemini-3-pro-image-preview".to_string(),
            google_text_model: "gemini-2.5-flash".to_string(),
            replicate_base_url: "https://api.replicate.com/v1".to_string(),
            google_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            request_timeout_secs: 120,
            poll_max_attempts: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl EngineSettings {
    /// Validate engine names and limits.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (field, value) in [("primary", &self.primary), ("secondary", &self.secondary)] {
            if EngineKind::parse(value).is_none() {
                problems.push(format!(
                    "engines.{field}: unknown engine '{value}' (valid: flux, google)"
                ));
            }
        }
        if self.request_timeout_secs == 0 {
            problems.push("engines.request_timeout_secs must be greater than 0".to_string());
        }
        if self.poll_max_attempts == 0 {
            problems.push("engines.poll_max_attempts must be greater than 0".to_string());
        }
        problems
    }
}
