//! Offline engines with scripted behavior.
//!
//! Used by unit tests and by the CLI `--mock` mode. Thread-safe for use in
//! async contexts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    Artifact, EngineCapabilities, EngineError, EngineKind, GenerationRequest, ImageEngine,
    TextEngine,
};

/// Callback run at the start of every call with the 1-based call number.
pub type CallHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Mock image engine.
///
/// # Example
///
/// ```rust,ignore
/// use slidegen::engine::{MockImageEngine, EngineKind, EngineError, FailureKind};
///
/// let engine = MockImageEngine::new("flux-mock", EngineKind::Flux)
///     .with_failure_on_call(3, EngineError::new(FailureKind::PermissionDenied, "403"));
/// ```
pub struct MockImageEngine {
    name: String,
    kind: EngineKind,
    capabilities: EngineCapabilities,
    latency: Option<Duration>,
    call_count: AtomicU32,
    /// Number of leading calls to fail before succeeding.
    fail_count: AtomicU32,
    fail_error: Option<EngineError>,
    failures_by_call: HashMap<u32, EngineError>,
    failures_by_prompt: Vec<(String, EngineError)>,
    requests: Mutex<Vec<GenerationRequest>>,
    hook: Option<CallHook>,
}

impl MockImageEngine {
    pub fn new(name: impl Into<String>, kind: EngineKind) -> Self {
        Self {
            name: name.into(),
            kind,
            capabilities: EngineCapabilities::default(),
            latency: None,
            call_count: AtomicU32::new(0),
            fail_count: AtomicU32::new(0),
            fail_error: None,
            failures_by_call: HashMap::new(),
            failures_by_prompt: Vec::new(),
            requests: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    #[must_use]
    pub fn with_image_to_image(mut self, supported: bool) -> Self {
        self.capabilities.image_to_image = supported;
        self
    }

    /// Simulated call duration.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the first `count` calls with `error`, then succeed.
    #[must_use]
    pub fn with_fail_count(mut self, count: u32, error: EngineError) -> Self {
        self.fail_count = AtomicU32::new(count);
        self.fail_error = Some(error);
        self
    }

    /// Fail exactly the `call`-th call (1-based).
    #[must_use]
    pub fn with_failure_on_call(mut self, call: u32, error: EngineError) -> Self {
        self.failures_by_call.insert(call, error);
        self
    }

    /// Fail every call whose prompt contains `marker`.
    #[must_use]
    pub fn with_prompt_failure(mut self, marker: impl Into<String>, error: EngineError) -> Self {
        self.failures_by_prompt.push((marker.into(), error));
        self
    }

    #[must_use]
    pub fn with_hook(mut self, hook: CallHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received, in call order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn scripted_failure(&self, call: u32, request: &GenerationRequest) -> Option<EngineError> {
        if let Some(err) = self.failures_by_call.get(&call) {
            return Some(err.clone());
        }
        if let Some((_, err)) = self
            .failures_by_prompt
            .iter()
            .find(|(marker, _)| request.prompt.contains(marker.as_str()))
        {
            return Some(err.clone());
        }
        let remaining = self.fail_count.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_count.fetch_sub(1, Ordering::SeqCst);
            return self.fail_error.clone();
        }
        None
    }
}

#[async_trait]
impl ImageEngine for MockImageEngine {
    async fn generate(&self, request: &GenerationRequest) -> Result<Artifact, EngineError> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(hook) = &self.hook {
            hook(call);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.scripted_failure(call, request) {
            Some(err) => Err(err),
            None => Ok(Artifact::new(format!("mock://{}/{call}.png", self.name))),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }
}

/// Mock text model returning canned responses.
#[derive(Debug, Default)]
pub struct MockTextEngine {
    responses: Mutex<Vec<String>>,
    fallback: String,
    error: Option<EngineError>,
    call_count: AtomicU32,
    prompts: Mutex<Vec<(String, String)>>,
}

impl MockTextEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Response returned once the queued responses run out.
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.fallback = response.into();
        self
    }

    /// Queue responses returned in order, one per call.
    #[must_use]
    pub fn with_responses<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut queued: Vec<String> = responses.into_iter().map(Into::into).collect();
        queued.reverse();
        Self {
            responses: Mutex::new(queued),
            ..self
        }
    }

    /// Fail every call.
    #[must_use]
    pub fn with_error(mut self, error: EngineError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// `(system, prompt)` pairs received, in call order.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TextEngine for MockTextEngine {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, EngineError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((system.to_string(), prompt.to_string()));
        }
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let queued = self.responses.lock().ok().and_then(|mut r| r.pop());
        Ok(queued.unwrap_or_else(|| self.fallback.clone()))
    }

    fn name(&self) -> &str {
        "mock-text"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FailureKind;
    use crate::feedback::Scope;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest::new(prompt, Scope::slide_deck())
    }

    #[tokio::test]
    async fn test_mock_succeeds_and_counts() {
        let engine = MockImageEngine::new("m", EngineKind::Flux);
        let a = engine.generate(&request("one")).await.unwrap();
        let b = engine.generate(&request("two")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(engine.call_count(), 2);
        assert_eq!(engine.requests()[1].prompt, "two");
    }

    #[tokio::test]
    async fn test_mock_failure_on_call() {
        let engine = MockImageEngine::new("m", EngineKind::Flux)
            .with_failure_on_call(2, EngineError::new(FailureKind::PermissionDenied, "403"));
        assert!(engine.generate(&request("a")).await.is_ok());
        let err = engine.generate(&request("b")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::PermissionDenied);
        assert!(engine.generate(&request("c")).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_fail_count_then_success() {
        let engine = MockImageEngine::new("m", EngineKind::Google)
            .with_fail_count(2, EngineError::new(FailureKind::ServerFault, "500"));
        assert!(engine.generate(&request("a")).await.is_err());
        assert!(engine.generate(&request("a")).await.is_err());
        assert!(engine.generate(&request("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_prompt_failure() {
        let engine = MockImageEngine::new("m", EngineKind::Flux)
            .with_prompt_failure("[broken]", EngineError::rejected("nope"));
        assert!(engine.generate(&request("fine")).await.is_ok());
        assert!(engine.generate(&request("a [broken] one")).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_text_queue_then_fallback() {
        let engine = MockTextEngine::new()
            .with_responses(["first", "second"])
            .with_response("rest");
        assert_eq!(engine.complete("s", "p").await.unwrap(), "first");
        assert_eq!(engine.complete("s", "p").await.unwrap(), "second");
        assert_eq!(engine.complete("s", "p").await.unwrap(), "rest");
        assert_eq!(engine.call_count(), 3);
    }
}
