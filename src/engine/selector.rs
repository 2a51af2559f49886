//! Engine selection with single-call fallback.
//!
//! The selector owns the choice of engine for each request. A request that
//! needs image-to-image goes to the capable engine unconditionally.
//! Otherwise the primary engine is tried first, and the secondary only when
//! the primary is unreachable or misconfigured. Every engine call is wrapped
//! in the [`RetryPolicy`], so callers only ever see a success or a
//! classified failure.
//!
//! # Example
//!
//! ```rust,ignore
//! use slidegen::engine::{EngineSelector, FallbackConfig};
//!
//! let selector = EngineSelector::builder()
//!     .primary(flux)
//!     .secondary(google)
//!     .retry(RetryPolicy::default())
//!     .cost_model(costs)
//!     .build()?;
//!
//! let generation = selector.generate(&request).await?;
//! println!("{} cost {}", generation.decision.engine, generation.decision.unit_cost);
//! ```

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    Artifact, EngineCapabilities, EngineError, EngineKind, FailureKind, GenerationRequest,
    ImageEngine,
};
use crate::cost::CostModel;
use crate::error::{Result, SlidegenError};
use crate::retry::RetryPolicy;

// =============================================================================
// Fallback
// =============================================================================

/// Configuration for fallback behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackConfig {
    pub enabled: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl FallbackConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    /// Only an unreachable engine triggers fallback; taxonomy failures never do.
    #[must_use]
    pub fn should_fallback(&self, error: &EngineError) -> bool {
        self.enabled && error.kind == FailureKind::Unavailable
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Which engine served a call and what one call on it costs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDecision {
    pub engine: EngineKind,
    pub engine_name: String,
    /// Integer cost in local currency units.
    pub unit_cost: u64,
    pub fell_back: bool,
}

/// Successful generation plus the decision that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub artifact: Artifact,
    pub decision: EngineDecision,
}

// =============================================================================
// Selector
// =============================================================================

pub struct EngineSelector {
    primary: Arc<dyn ImageEngine>,
    secondary: Option<Arc<dyn ImageEngine>>,
    retry: RetryPolicy,
    fallback: FallbackConfig,
    costs: Arc<CostModel>,
}

impl std::fmt::Debug for EngineSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSelector")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.as_ref().map(|e| e.name()))
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl EngineSelector {
    #[must_use]
    pub fn builder() -> EngineSelectorBuilder {
        EngineSelectorBuilder::default()
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn cost_model(&self) -> &Arc<CostModel> {
        &self.costs
    }

    /// Engines to try for a request with the given needs, in order.
    pub fn select(&self, needs: EngineCapabilities) -> Result<Vec<Arc<dyn ImageEngine>>> {
        let engines = std::iter::once(&self.primary).chain(self.secondary.iter());

        if needs.image_to_image {
            return engines
                .into_iter()
                .find(|e| e.capabilities().image_to_image)
                .map(|e| vec![Arc::clone(e)])
                .ok_or_else(|| SlidegenError::NoEngine {
                    reason: "no configured engine supports reference images".to_string(),
                });
        }

        Ok(engines.map(Arc::clone).collect())
    }

    /// Generate through the selected engines with retry and fallback.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let route = self.select(request.required_capabilities())?;
        let mut last_error: Option<EngineError> = None;

        for (idx, engine) in route.iter().enumerate() {
            debug!(engine = engine.name(), "Dispatching generation");

            match self.retry.run(|| engine.generate(request)).await {
                Ok(artifact) => {
                    let unit_cost = self.costs.unit_cost(engine.kind()).await;
                    if idx > 0 {
                        info!(engine = engine.name(), "Generation succeeded after fallback");
                    }
                    return Ok(Generation {
                        artifact,
                        decision: EngineDecision {
                            engine: engine.kind(),
                            engine_name: engine.name().to_string(),
                            unit_cost,
                            fell_back: idx > 0,
                        },
                    });
                }
                Err(err) => {
                    let next = route.get(idx + 1);
                    match next {
                        Some(next) if self.fallback.should_fallback(&err) => {
                            warn!(
                                from = engine.name(),
                                to = next.name(),
                                reason = %err,
                                "Falling back to next engine"
                            );
                            last_error = Some(err);
                        }
                        _ => return Err(err.into()),
                    }
                }
            }
        }

        Err(match last_error {
            Some(err) => err.into(),
            None => SlidegenError::NoEngine {
                reason: "no engines configured".to_string(),
            },
        })
    }
}

// =============================================================================
// Builder
// =============================================================================

#[derive(Default)]
pub struct EngineSelectorBuilder {
    primary: Option<Arc<dyn ImageEngine>>,
    secondary: Option<Arc<dyn ImageEngine>>,
    retry: RetryPolicy,
    fallback: FallbackConfig,
    costs: Option<Arc<CostModel>>,
}

impl EngineSelectorBuilder {
    #[must_use]
    pub fn primary(mut self, engine: Arc<dyn ImageEngine>) -> Self {
        self.primary = Some(engine);
        self
    }

    #[must_use]
    pub fn secondary(mut self, engine: Arc<dyn ImageEngine>) -> Self {
        self.secondary = Some(engine);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn fallback(mut self, config: FallbackConfig) -> Self {
        self.fallback = config;
        self
    }

    #[must_use]
    pub fn cost_model(mut self, costs: Arc<CostModel>) -> Self {
        self.costs = Some(costs);
        self
    }

    pub fn build(self) -> Result<EngineSelector> {
        let primary = self.primary.ok_or_else(|| SlidegenError::NoEngine {
            reason: "a primary engine is required".to_string(),
        })?;
        let costs = self
            .costs
            .ok_or_else(|| SlidegenError::config("engine selector needs a cost model"))?;
        Ok(EngineSelector {
            primary,
            secondary: self.secondary,
            retry: self.retry,
            fallback: self.fallback,
            costs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{FixedRate, PricingConfig};
    use crate::engine::{MockImageEngine, ReferenceImage};
    use crate::feedback::Scope;
    use crate::retry::RetryConfig;

    fn costs() -> Arc<CostModel> {
        Arc::new(CostModel::new(
            PricingConfig::default(),
            Arc::new(FixedRate::new(25_000)),
        ))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_delay_ms: 1,
            rate_limit_step_ms: 1,
            hint_buffer_ms: 0,
            ..Default::default()
        })
    }

    fn selector(
        primary: Arc<MockImageEngine>,
        secondary: Arc<MockImageEngine>,
    ) -> EngineSelector {
        EngineSelector::builder()
            .primary(primary)
            .secondary(secondary)
            .retry(fast_retry())
            .cost_model(costs())
            .build()
            .unwrap()
    }

    fn flux() -> MockImageEngine {
        MockImageEngine::new("flux", EngineKind::Flux)
    }

    fn google() -> MockImageEngine {
        MockImageEngine::new("google", EngineKind::Google).with_image_to_image(true)
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("a slide", Scope::slide_deck())
    }

    // =========================================================================
    // FallbackConfig
    // =========================================================================

    #[test]
    fn test_fallback_only_on_unavailable() {
        let config = FallbackConfig::default();
        assert!(config.should_fallback(&EngineError::unavailable("down")));
        assert!(!config.should_fallback(&EngineError::new(FailureKind::ServerFault, "500")));
        assert!(!config.should_fallback(&EngineError::new(FailureKind::DailyQuota, "q")));
        assert!(!FallbackConfig::disabled().should_fallback(&EngineError::unavailable("down")));
    }

    // =========================================================================
    // Selection
    // =========================================================================

    #[test]
    fn test_select_prefers_primary() {
        let s = selector(Arc::new(flux()), Arc::new(google()));
        let route = s.select(EngineCapabilities::default()).unwrap();
        assert_eq!(route.len(), 2);
        assert_eq!(route[0].kind(), EngineKind::Flux);
    }

    #[test]
    fn test_select_image_to_image_is_unconditional() {
        let s = selector(Arc::new(flux()), Arc::new(google()));
        let route = s
            .select(EngineCapabilities {
                image_to_image: true,
            })
            .unwrap();
        assert_eq!(route.len(), 1);
        assert_eq!(route[0].kind(), EngineKind::Google);
    }

    #[test]
    fn test_select_image_to_image_without_capable_engine() {
        let s = EngineSelector::builder()
            .primary(Arc::new(flux()))
            .cost_model(costs())
            .build()
            .unwrap();
        let err = s
            .select(EngineCapabilities {
                image_to_image: true,
            })
            .err()
            .unwrap();
        assert!(matches!(err, SlidegenError::NoEngine { .. }));
    }

    #[test]
    fn test_builder_requires_primary() {
        let err = EngineSelector::builder().cost_model(costs()).build().unwrap_err();
        assert!(matches!(err, SlidegenError::NoEngine { .. }));
    }

    // =========================================================================
    // Generation
    // =========================================================================

    #[tokio::test]
    async fn test_primary_success_prices_primary() {
        let primary = Arc::new(flux());
        let secondary = Arc::new(google());
        let s = selector(primary.clone(), secondary.clone());

        let generation = s.generate(&request()).await.unwrap();
        assert_eq!(generation.decision.engine, EngineKind::Flux);
        assert_eq!(generation.decision.unit_cost, 50);
        assert!(!generation.decision.fell_back);
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_primary_falls_back() {
        let primary = Arc::new(flux().with_fail_count(1, EngineError::unavailable("no token")));
        let secondary = Arc::new(google());
        let s = selector(primary.clone(), secondary.clone());

        let generation = s.generate(&request()).await.unwrap();
        assert_eq!(generation.decision.engine, EngineKind::Google);
        assert_eq!(generation.decision.unit_cost, 750);
        assert!(generation.decision.fell_back);
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fatal_primary_does_not_fall_back() {
        let primary = Arc::new(
            flux().with_fail_count(1, EngineError::new(FailureKind::PermissionDenied, "403")),
        );
        let secondary = Arc::new(google());
        let s = selector(primary.clone(), secondary.clone());

        let err = s.generate(&request()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_retryable_primary_retries_in_place() {
        let primary = Arc::new(
            flux().with_fail_count(2, EngineError::new(FailureKind::ServerFault, "500")),
        );
        let secondary = Arc::new(google());
        let s = selector(primary.clone(), secondary.clone());

        let generation = s.generate(&request()).await.unwrap();
        assert_eq!(generation.decision.engine, EngineKind::Flux);
        assert_eq!(primary.call_count(), 3);
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reference_image_goes_to_capable_engine() {
        let primary = Arc::new(flux());
        let secondary = Arc::new(google());
        let s = selector(primary.clone(), secondary.clone());

        let req = request().with_reference_image(ReferenceImage::from_base64("AAAA"));
        let generation = s.generate(&req).await.unwrap();
        assert_eq!(generation.decision.engine, EngineKind::Google);
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_both_unavailable_returns_last_error() {
        let primary = Arc::new(flux().with_fail_count(1, EngineError::unavailable("flux down")));
        let secondary =
            Arc::new(google().with_fail_count(1, EngineError::unavailable("google down")));
        let s = selector(primary, secondary);

        let err = s.generate(&request()).await.unwrap_err();
        assert!(err.to_string().contains("google down"));
    }
}
