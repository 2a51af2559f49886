//! Request assembly shared by batch and single-shot generation.

use std::sync::Arc;
use tracing::debug;

use super::WorkItem;
use crate::engine::{AspectRatio, EngineSelector, Generation, GenerationRequest};
use crate::error::{Result, SlidegenError};
use crate::feedback::{FeedbackStore, Scope};

/// Builds requests (with learned rules for their scope) and hands them to
/// the engine selector.
#[derive(Debug)]
pub struct GenerationPipeline {
    selector: Arc<EngineSelector>,
    feedback: Arc<FeedbackStore>,
}

impl GenerationPipeline {
    pub fn new(selector: Arc<EngineSelector>, feedback: Arc<FeedbackStore>) -> Self {
        Self { selector, feedback }
    }

    #[must_use]
    pub fn selector(&self) -> &Arc<EngineSelector> {
        &self.selector
    }

    #[must_use]
    pub fn feedback(&self) -> &Arc<FeedbackStore> {
        &self.feedback
    }

    /// Request for one work item of a batch.
    #[must_use]
    pub fn request_for(
        &self,
        item: &WorkItem,
        scope: &Scope,
        aspect_ratio: AspectRatio,
        feedback: Option<&str>,
    ) -> GenerationRequest {
        let mut request = GenerationRequest::new(item.prompt.clone(), scope.clone())
            .with_overlay(item.overlay())
            .with_aspect_ratio(aspect_ratio);
        if let Some(image) = &item.reference_image {
            request = request.with_reference_image(image.clone());
        }
        if let Some(image) = &item.projector_image {
            request = request.with_projector_image(image.clone());
        }
        if let Some(note) = feedback.map(str::trim).filter(|n| !n.is_empty()) {
            request = request.with_feedback(note);
        }
        request
    }

    /// Inject the scope's learned rules and generate.
    ///
    /// An empty prompt is rejected before any engine is called.
    pub async fn generate(&self, mut request: GenerationRequest) -> Result<Generation> {
        if request.prompt.trim().is_empty() {
            return Err(SlidegenError::invalid_input("prompt", "must not be empty"));
        }
        let rules = self.feedback.rules_for(&request.scope);
        if !rules.is_empty() {
            debug!(scope = %request.scope, count = rules.rules.len(), "Injecting learned rules");
        }
        request.learned_rules = rules.to_string();
        self.selector.generate(&request).await
    }
}
