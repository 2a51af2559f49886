//! Batch model: work items, batch runs and their state machines.
//!
//! ```text
//! WorkItem:  PENDING ──> GENERATING ──> COMPLETED
//!                           │   ▲  ▲        │
//!                           ▼   │  └────────┘ (explicit regenerate)
//!                         ERROR ┘ (manual retry)
//!
//! BatchRun:  IDLE ──> REVIEW ──> PROCESSING ──> {COMPLETED, PAUSED}
//!            PAUSED ──> PROCESSING       (resume)
//!            COMPLETED ──> PROCESSING    (re-trigger)
//! ```
//!
//! Only the [`BatchRunner`] moves items through their states; every move
//! goes through a checked transition.

pub mod pipeline;
pub mod runner;

pub use pipeline::GenerationPipeline;
pub use runner::{BatchConfig, BatchEvent, BatchReport, BatchRunner, Checkpoint, HaltReason};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::{Artifact, AspectRatio, ReferenceImage, TextOverlay};
use crate::error::{Result, SlidegenError};
use crate::feedback::Scope;
use crate::retry::ErrorClass;

/// Temporary file suffix for atomic plan writes.
const TMP_SUFFIX: &str = ".tmp";

// =============================================================================
// Work items
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    #[default]
    Pending,
    Generating,
    Completed,
    Error,
}

impl ItemStatus {
    #[must_use]
    pub fn can_transition_to(self, to: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, to),
            (Pending, Generating)
                | (Generating, Completed)
                | (Generating, Error)
                | (Error, Generating)
                | (Completed, Generating)
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Generating => "GENERATING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Last failure recorded on an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub class: ErrorClass,
    pub message: String,
}

/// One unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable 1-based ordinal.
    pub id: u32,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub prompt: String,
    /// Source image for remakes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<ReferenceImage>,
    /// Picture shown on an in-scene screen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projector_image: Option<ReferenceImage>,
    #[serde(default)]
    status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ItemError>,
    #[serde(default)]
    pub is_optimized: bool,
}

impl WorkItem {
    pub fn new(
        id: u32,
        title: impl Into<String>,
        content: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            content: content.into(),
            subtitle: None,
            prompt: prompt.into(),
            reference_image: None,
            projector_image: None,
            status: ItemStatus::Pending,
            artifact: None,
            last_error: None,
            is_optimized: false,
        }
    }

    #[must_use]
    pub fn status(&self) -> ItemStatus {
        self.status
    }

    /// Verbatim text the image must carry.
    #[must_use]
    pub fn overlay(&self) -> TextOverlay {
        TextOverlay {
            title: self.title.clone(),
            body: self.content.clone(),
            subtitle: self.subtitle.clone(),
        }
    }

    /// Replace the item's text; the prompt needs refining again.
    pub fn edit_text(&mut self, title: impl Into<String>, content: impl Into<String>) {
        self.title = title.into();
        self.content = content.into();
        self.is_optimized = false;
    }

    pub(crate) fn transition(&mut self, to: ItemStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(SlidegenError::ItemTransition {
                id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub(crate) fn complete(&mut self, artifact: Artifact) -> Result<()> {
        self.transition(ItemStatus::Completed)?;
        self.artifact = Some(artifact);
        self.last_error = None;
        Ok(())
    }

    pub(crate) fn fail(&mut self, class: ErrorClass, message: impl Into<String>) -> Result<()> {
        self.transition(ItemStatus::Error)?;
        self.last_error = Some(ItemError {
            class,
            message: message.into(),
        });
        Ok(())
    }
}

// =============================================================================
// Pause token
// =============================================================================

/// Cooperative abort flag for one batch, polled only between items.
#[derive(Debug, Clone, Default)]
pub struct PauseToken(Arc<AtomicBool>);

impl PauseToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Batch runs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Idle,
    Review,
    Processing,
    Paused,
    Completed,
}

impl BatchStatus {
    #[must_use]
    pub fn can_transition_to(self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, to),
            (Idle, Review)
                | (Review, Processing)
                | (Processing, Completed)
                | (Processing, Paused)
                | (Paused, Processing)
                | (Completed, Processing)
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Review => "REVIEW",
            Self::Processing => "PROCESSING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
        };
        write!(f, "{s}")
    }
}

/// Ordered work items sharing one topic, scope, abort flag and cost total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub topic: String,
    pub scope: Scope,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    items: Vec<WorkItem>,
    status: BatchStatus,
    #[serde(default)]
    accrued_cost: u64,
    #[serde(skip)]
    pause: PauseToken,
}

impl BatchRun {
    pub fn new(topic: impl Into<String>, scope: Scope) -> Self {
        Self {
            topic: topic.into(),
            scope,
            aspect_ratio: AspectRatio::default(),
            items: Vec::new(),
            status: BatchStatus::Idle,
            accrued_cost: 0,
            pause: PauseToken::new(),
        }
    }

    #[must_use]
    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    /// Attach drafted items and move IDLE -> REVIEW.
    ///
    /// Ids must be unique; items are kept in ordinal order.
    pub fn load_drafts(&mut self, mut items: Vec<WorkItem>) -> Result<()> {
        if items.is_empty() {
            return Err(SlidegenError::invalid_input("items", "no items drafted"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = items.iter().find(|i| !seen.insert(i.id)) {
            return Err(SlidegenError::invalid_input(
                "items",
                format!("duplicate item id {}", dup.id),
            ));
        }
        self.transition(BatchStatus::Review)?;
        items.sort_by_key(|i| i.id);
        self.items = items;
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> BatchStatus {
        self.status
    }

    #[must_use]
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    #[must_use]
    pub fn item(&self, id: u32) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Mutable access for editing text and prompts outside a run.
    pub fn item_mut(&mut self, id: u32) -> Result<&mut WorkItem> {
        self.items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(SlidegenError::UnknownItem { id })
    }

    pub(crate) fn item_at_mut(&mut self, idx: usize) -> Option<&mut WorkItem> {
        self.items.get_mut(idx)
    }

    #[must_use]
    pub fn accrued_cost(&self) -> u64 {
        self.accrued_cost
    }

    pub(crate) fn accrue(&mut self, amount: u64) {
        self.accrued_cost = self.accrued_cost.saturating_add(amount);
    }

    /// Handle that can pause this batch from another task.
    #[must_use]
    pub fn pause_token(&self) -> PauseToken {
        self.pause.clone()
    }

    /// Request a cooperative pause at the next item boundary.
    pub fn pause(&self) {
        self.pause.pause();
    }

    pub(crate) fn transition(&mut self, to: BatchStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(SlidegenError::BatchTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    #[must_use]
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    /// Settle a run that was interrupted mid-item, e.g. by a crash.
    ///
    /// A PROCESSING batch becomes PAUSED and any GENERATING item becomes
    /// ERROR, so the next run re-attempts it. Returns the ids touched.
    pub fn recover_interrupted(&mut self) -> Vec<u32> {
        let mut touched = Vec::new();
        for item in &mut self.items {
            if item.status == ItemStatus::Generating
                && item
                    .fail(ErrorClass::NonRetryable, "interrupted before completion")
                    .is_ok()
            {
                touched.push(item.id);
            }
        }
        if self.status == BatchStatus::Processing {
            self.status = BatchStatus::Paused;
        }
        touched
    }

    /// Read a plan file written by [`BatchRun::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the plan atomically: temp file, sync, rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(TMP_SUFFIX);
        let tmp_path = PathBuf::from(tmp_path);

        let json = serde_json::to_string_pretty(self)?;
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: u32) -> Vec<WorkItem> {
        (1..=n)
            .map(|i| WorkItem::new(i, format!("Slide {i}"), "body", format!("prompt {i}")))
            .collect()
    }

    // =========================================================================
    // Item state machine
    // =========================================================================

    #[test]
    fn test_item_transitions() {
        use ItemStatus::*;
        assert!(Pending.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Completed));
        assert!(Generating.can_transition_to(Error));
        assert!(Error.can_transition_to(Generating));
        assert!(Completed.can_transition_to(Generating));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Error));
        assert!(!Error.can_transition_to(Completed));
        assert!(!Generating.can_transition_to(Generating));
        assert!(!Completed.can_transition_to(Pending));
    }

    #[test]
    fn test_item_illegal_transition_is_error() {
        let mut item = WorkItem::new(7, "t", "c", "p");
        let err = item.complete(Artifact::new("x")).unwrap_err();
        assert!(matches!(err, SlidegenError::ItemTransition { id: 7, .. }));
        assert_eq!(item.status(), ItemStatus::Pending);
    }

    #[test]
    fn test_item_complete_clears_error() {
        let mut item = WorkItem::new(1, "t", "c", "p");
        item.transition(ItemStatus::Generating).unwrap();
        item.fail(ErrorClass::RetryableServer, "500").unwrap();
        assert!(item.last_error.is_some());
        item.transition(ItemStatus::Generating).unwrap();
        item.complete(Artifact::new("uri")).unwrap();
        assert!(item.last_error.is_none());
        assert_eq!(item.artifact.as_ref().unwrap().uri, "uri");
    }

    #[test]
    fn test_edit_text_clears_optimized() {
        let mut item = WorkItem::new(1, "t", "c", "p");
        item.is_optimized = true;
        item.edit_text("new", "text");
        assert!(!item.is_optimized);
        assert_eq!(item.overlay().title, "new");
    }

    // =========================================================================
    // Batch state machine
    // =========================================================================

    #[test]
    fn test_batch_transitions() {
        use BatchStatus::*;
        assert!(Idle.can_transition_to(Review));
        assert!(Review.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Processing));
        assert!(Completed.can_transition_to(Processing));

        assert!(!Idle.can_transition_to(Processing));
        assert!(!Review.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Idle));
    }

    #[test]
    fn test_load_drafts_moves_to_review() {
        let mut batch = BatchRun::new("Cells", Scope::slide_deck());
        let mut drafted = items(3);
        drafted.reverse();
        batch.load_drafts(drafted).unwrap();
        assert_eq!(batch.status(), BatchStatus::Review);
        let ids: Vec<_> = batch.items().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_load_drafts_rejects_empty_and_duplicates() {
        let mut batch = BatchRun::new("t", Scope::slide_deck());
        assert!(batch.load_drafts(vec![]).is_err());
        let mut dup = items(2);
        dup[1].id = 1;
        assert!(batch.load_drafts(dup).is_err());
        assert_eq!(batch.status(), BatchStatus::Idle);
    }

    #[test]
    fn test_item_mut_unknown_id() {
        let mut batch = BatchRun::new("t", Scope::slide_deck());
        batch.load_drafts(items(1)).unwrap();
        assert!(matches!(
            batch.item_mut(9),
            Err(SlidegenError::UnknownItem { id: 9 })
        ));
    }

    #[test]
    fn test_pause_token_shared() {
        let batch = BatchRun::new("t", Scope::slide_deck());
        let token = batch.pause_token();
        assert!(!token.is_paused());
        batch.pause();
        assert!(token.is_paused());
        token.reset();
        assert!(!batch.pause_token().is_paused());
    }

    #[test]
    fn test_recover_interrupted() {
        let mut batch = BatchRun::new("t", Scope::slide_deck());
        batch.load_drafts(items(2)).unwrap();
        batch.transition(BatchStatus::Processing).unwrap();
        batch.item_at_mut(0).unwrap().transition(ItemStatus::Generating).unwrap();

        let touched = batch.recover_interrupted();
        assert_eq!(touched, vec![1]);
        assert_eq!(batch.status(), BatchStatus::Paused);
        assert_eq!(batch.items()[0].status(), ItemStatus::Error);
        assert_eq!(batch.items()[1].status(), ItemStatus::Pending);
    }

    #[test]
    fn test_plan_serialization_skips_pause_flag() {
        let mut batch = BatchRun::new("t", Scope::thumbnail());
        batch.load_drafts(items(1)).unwrap();
        batch.pause();
        let json = serde_json::to_string(&batch).unwrap();
        assert!(json.contains("\"status\":\"REVIEW\""));
        let restored: BatchRun = serde_json::from_str(&json).unwrap();
        assert!(!restored.pause_token().is_paused());
        assert_eq!(restored.scope, Scope::thumbnail());
    }

    #[test]
    fn test_plan_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plans/deck.json");
        let mut batch = BatchRun::new("Volcanoes", Scope::slide_deck())
            .with_aspect_ratio(AspectRatio::Wide);
        batch.load_drafts(items(2)).unwrap();
        batch.accrue(51);

        batch.save(&path).unwrap();
        assert!(!dir.path().join("plans/deck.json.tmp").exists());

        let restored = BatchRun::load(&path).unwrap();
        assert_eq!(restored.topic, "Volcanoes");
        assert_eq!(restored.aspect_ratio, AspectRatio::Wide);
        assert_eq!(restored.status(), BatchStatus::Review);
        assert_eq!(restored.accrued_cost(), 51);
        assert_eq!(restored.items(), batch.items());
    }

    #[test]
    fn test_plan_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = BatchRun::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, SlidegenError::Io(_)));
    }
}
