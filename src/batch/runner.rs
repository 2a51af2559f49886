//! Sequential batch execution with pause, resume and single-item retry.
//!
//! # Architecture
//!
//! ```text
//! run(batch) ──for each item in id order──┐
//!     │                                   ▼
//!     │              COMPLETED? ── yes ──> skip
//!     │                  │ no
//!     │        courtesy delay, pause check ──> PAUSED
//!     │                  ▼
//!     │     GENERATING ──> pipeline ──> COMPLETED (+cost)
//!     │                        │
//!     │                        └──> ERROR ── fatal? ──> halt, PAUSED
//!     ▼
//! COMPLETED | PAUSED
//! ```
//!
//! Exactly one item is in flight at a time. The pause flag is polled only
//! between items; a started item always reaches a terminal status first.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{BatchRun, BatchStatus, GenerationPipeline, ItemStatus, WorkItem};
use crate::cost::CostLedger;
use crate::engine::AspectRatio;
use crate::error::{Result, SlidegenError};
use crate::feedback::Scope;
use crate::retry::ErrorClass;

/// Batch section of the settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    /// Pause between consecutive generation calls.
    pub inter_item_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            inter_item_delay_ms: 500,
        }
    }
}

/// Why a run stopped before reaching the end of the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The pause token was set.
    Paused,
    /// A fatal failure needs a human.
    Fatal {
        item: u32,
        class: ErrorClass,
        message: String,
    },
}

/// Outcome of one `run` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub completed: Vec<u32>,
    pub failed: Vec<u32>,
    pub skipped: Vec<u32>,
    /// Cost accrued by this run only.
    pub cost_added: u64,
    pub halt: Option<HaltReason>,
}

/// Progress notifications; each carries the item as it stands after its
/// status update.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    /// The item is now GENERATING ("currently selected").
    ItemStarted(WorkItem),
    ItemCompleted { item: WorkItem, unit_cost: u64 },
    ItemFailed { item: WorkItem, class: ErrorClass },
    Halted(HaltReason),
    Finished(BatchReport),
}

/// Persists the batch whenever an item changes status.
///
/// Called once when an item starts GENERATING and once when it settles, so
/// an interrupted process leaves a plan that [`BatchRun::recover_interrupted`]
/// can settle and a resume never pays again for completed items.
pub type Checkpoint = Box<dyn Fn(&BatchRun) -> Result<()> + Send + Sync>;

enum ItemOutcome {
    Completed,
    Failed(ErrorClass, String),
}

/// Drives a [`BatchRun`] through the generation pipeline.
pub struct BatchRunner {
    pipeline: Arc<GenerationPipeline>,
    ledger: Arc<CostLedger>,
    inter_item_delay: Duration,
    events: Option<mpsc::UnboundedSender<BatchEvent>>,
    checkpoint: Option<Checkpoint>,
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("pipeline", &self.pipeline)
            .field("inter_item_delay", &self.inter_item_delay)
            .field("events", &self.events.is_some())
            .field("checkpoint", &self.checkpoint.is_some())
            .finish_non_exhaustive()
    }
}

impl BatchRunner {
    pub fn new(
        pipeline: Arc<GenerationPipeline>,
        ledger: Arc<CostLedger>,
        config: &BatchConfig,
    ) -> Self {
        Self {
            pipeline,
            ledger,
            inter_item_delay: Duration::from_millis(config.inter_item_delay_ms),
            events: None,
            checkpoint: None,
        }
    }

    /// Persist progress through `checkpoint` as items change status.
    #[must_use]
    pub fn with_checkpoint<F>(mut self, checkpoint: F) -> Self
    where
        F: Fn(&BatchRun) -> Result<()> + Send + Sync + 'static,
    {
        self.checkpoint = Some(Box::new(checkpoint));
        self
    }

    /// A failed checkpoint is logged; the in-memory batch stays authoritative.
    fn checkpoint(&self, batch: &BatchRun) {
        if let Some(checkpoint) = &self.checkpoint {
            if let Err(err) = checkpoint(batch) {
                warn!(error = %err, "Failed to checkpoint batch progress");
            }
        }
    }

    /// Send progress events to `tx`.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<BatchEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver just means nobody is watching.
            let _ = tx.send(event);
        }
    }

    fn validate(batch: &BatchRun) -> Result<()> {
        if batch.items().is_empty() {
            return Err(SlidegenError::invalid_input("items", "batch has no items"));
        }
        if let Some(item) = batch
            .items()
            .iter()
            .find(|i| i.status() != ItemStatus::Completed && i.prompt.trim().is_empty())
        {
            return Err(SlidegenError::invalid_input(
                format!("items[{}].prompt", item.id),
                "must not be empty",
            ));
        }
        Ok(())
    }

    /// Run every eligible item in id order.
    ///
    /// COMPLETED items are skipped, so resuming a paused batch never pays
    /// twice for finished work. A fatal failure stops the loop and leaves the
    /// batch PAUSED; any other failure marks only that item ERROR.
    pub async fn run(&self, batch: &mut BatchRun) -> Result<BatchReport> {
        Self::validate(batch)?;
        batch.transition(BatchStatus::Processing)?;
        let token = batch.pause_token();
        token.reset();

        let scope = batch.scope.clone();
        let aspect_ratio = batch.aspect_ratio;
        let mut report = BatchReport {
            status: BatchStatus::Processing,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            cost_added: 0,
            halt: None,
        };
        let mut dispatched = false;

        info!(topic = %batch.topic, items = batch.items().len(), "Batch started");

        for idx in 0..batch.items().len() {
            let (id, status) = {
                let item = &batch.items()[idx];
                (item.id, item.status())
            };
            if status == ItemStatus::Completed {
                debug!(item = id, "Skipping completed item");
                report.skipped.push(id);
                continue;
            }

            if token.is_paused() {
                report.halt = Some(HaltReason::Paused);
                break;
            }
            if dispatched && !self.inter_item_delay.is_zero() {
                tokio::time::sleep(self.inter_item_delay).await;
                if token.is_paused() {
                    report.halt = Some(HaltReason::Paused);
                    break;
                }
            }
            dispatched = true;

            match self.process_item(batch, idx, None, &scope, aspect_ratio).await? {
                (ItemOutcome::Completed, cost) => {
                    report.completed.push(id);
                    report.cost_added += cost;
                }
                (ItemOutcome::Failed(class, message), _) if class.is_fatal() => {
                    error!(item = id, class = %class, "Fatal failure, halting batch");
                    report.failed.push(id);
                    let halt = HaltReason::Fatal {
                        item: id,
                        class,
                        message,
                    };
                    self.emit(BatchEvent::Halted(halt.clone()));
                    report.halt = Some(halt);
                    break;
                }
                (ItemOutcome::Failed(..), _) => report.failed.push(id),
            }
        }

        if report.halt.is_none() && token.is_paused() {
            report.halt = Some(HaltReason::Paused);
        }
        if report.halt == Some(HaltReason::Paused) {
            info!("Batch paused at item boundary");
            self.emit(BatchEvent::Halted(HaltReason::Paused));
        }

        let final_status = if report.halt.is_some() {
            BatchStatus::Paused
        } else {
            BatchStatus::Completed
        };
        batch.transition(final_status)?;
        report.status = final_status;

        info!(
            status = %final_status,
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cost = report.cost_added,
            "Batch finished"
        );
        self.emit(BatchEvent::Finished(report.clone()));
        Ok(report)
    }

    /// Regenerate one item outside the main loop.
    ///
    /// Accepts ERROR items (retry) and COMPLETED items (explicit regenerate);
    /// other items and the batch status are left untouched. The optional
    /// note is forwarded to the engine as a correction.
    pub async fn retry_item(
        &self,
        batch: &mut BatchRun,
        id: u32,
        feedback: Option<&str>,
    ) -> Result<WorkItem> {
        let idx = batch
            .items()
            .iter()
            .position(|i| i.id == id)
            .ok_or(SlidegenError::UnknownItem { id })?;
        let status = batch.items()[idx].status();
        if !matches!(status, ItemStatus::Error | ItemStatus::Completed) {
            return Err(SlidegenError::ItemTransition {
                id,
                from: status.to_string(),
                to: ItemStatus::Generating.to_string(),
            });
        }
        if batch.items()[idx].prompt.trim().is_empty() {
            return Err(SlidegenError::invalid_input(
                format!("items[{id}].prompt"),
                "must not be empty",
            ));
        }

        let scope = batch.scope.clone();
        let aspect_ratio = batch.aspect_ratio;
        info!(item = id, with_feedback = feedback.is_some(), "Retrying item");
        self.process_item(batch, idx, feedback, &scope, aspect_ratio)
            .await?;
        Ok(batch.items()[idx].clone())
    }

    /// GENERATING -> pipeline -> COMPLETED/ERROR for the item at `idx`.
    async fn process_item(
        &self,
        batch: &mut BatchRun,
        idx: usize,
        feedback: Option<&str>,
        scope: &Scope,
        aspect_ratio: AspectRatio,
    ) -> Result<(ItemOutcome, u64)> {
        let request = {
            let item = batch
                .item_at_mut(idx)
                .ok_or_else(|| SlidegenError::invalid_input("index", "out of range"))?;
            item.transition(ItemStatus::Generating)?;
            self.emit(BatchEvent::ItemStarted(item.clone()));
            self.pipeline.request_for(item, scope, aspect_ratio, feedback)
        };
        self.checkpoint(batch);

        let result = self.pipeline.generate(request).await;

        let item = batch
            .item_at_mut(idx)
            .ok_or_else(|| SlidegenError::invalid_input("index", "out of range"))?;
        let id = item.id;
        match result {
            Ok(generation) => {
                item.complete(generation.artifact)?;
                let unit_cost = generation.decision.unit_cost;
                let snapshot = item.clone();
                batch.accrue(unit_cost);
                self.ledger
                    .record(&generation.decision.engine.to_string(), unit_cost);
                info!(
                    item = id,
                    engine = %generation.decision.engine,
                    unit_cost,
                    "Item completed"
                );
                self.emit(BatchEvent::ItemCompleted {
                    item: snapshot,
                    unit_cost,
                });
                self.checkpoint(batch);
                Ok((ItemOutcome::Completed, unit_cost))
            }
            Err(err) => {
                let class = error_class(&err);
                let message = err.to_string();
                item.fail(class, message.clone())?;
                warn!(item = id, class = %class, error = %message, "Item failed");
                self.emit(BatchEvent::ItemFailed {
                    item: item.clone(),
                    class,
                });
                self.checkpoint(batch);
                Ok((ItemOutcome::Failed(class, message), 0))
            }
        }
    }
}

/// Taxonomy class of a pipeline failure; non-engine errors never retry.
pub(crate) fn error_class(err: &SlidegenError) -> ErrorClass {
    match err {
        SlidegenError::Engine(engine_err) => engine_err.class(),
        _ => ErrorClass::NonRetryable,
    }
}
