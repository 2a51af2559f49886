//! slidegen - resilient image generation orchestrator
//!
//! Drives batches of image generations (slide decks, thumbnails, stills)
//! against unreliable paid engines: classified retry, engine fallback,
//! integer cost accounting, cooperative pause and resume, and a scoped
//! memory of corrections learned from operator complaints.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`batch`] - Work items, batch state machines and the sequential runner
//! - [`engine`] - Engine traits, HTTP transports, mocks and the engine selector
//! - [`retry`] - Error taxonomy and the retry policy
//! - [`repair`] - Tolerant decoding of model output that should be JSON
//! - [`feedback`] - Scoped store of learned correction rules
//! - [`cost`] - Pricing, exchange rates and the persistent cost ledger
//! - [`assist`] - Text-model drafting, prompt optimization and auto-fix
//! - [`config`] - Settings loading and validation
//! - [`error`] - Custom error types and handling
//!
//! # Example
//!
//! ```rust,ignore
//! use slidegen::{BatchRunner, GenerationPipeline, Settings};
//!
//! let settings = Settings::load(Path::new("."))?;
//! let runner = BatchRunner::new(pipeline, ledger, &settings.batch);
//! let report = runner.run(&mut batch).await?;
//! println!("{} completed, status {}", report.completed.len(), report.status);
//! ```

pub mod assist;
pub mod batch;
pub mod config;
pub mod cost;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod repair;
pub mod retry;

// Re-export commonly used types
pub use error::{Result, SlidegenError};

pub use config::Settings;

pub use batch::{
    BatchConfig, BatchEvent, BatchReport, BatchRun, BatchRunner, BatchStatus, GenerationPipeline,
    HaltReason, ItemStatus, PauseToken, WorkItem,
};

pub use engine::{
    Artifact, AspectRatio, EngineError, EngineKind, EngineSelector, FailureKind,
    GenerationRequest, ImageEngine, TextEngine,
};

pub use retry::{classify, ErrorClass, RetryConfig, RetryPolicy};

pub use repair::repair_json;

pub use feedback::{FeedbackRule, FeedbackStore, LearnedRules, Scope};

pub use cost::{CostLedger, CostModel, PricingConfig};

pub use assist::{AutoFix, OptimizeReport, TextAssistant};
