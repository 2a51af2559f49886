//! Text-model helpers around the image pipeline: drafting a batch from a
//! topic or a narration script, refining item prompts, and turning a
//! complaint into a fixed prompt plus a learned rule.
//!
//! Every completed text call is billed to the shared [`CostLedger`] under
//! [`TEXT_LEDGER_LABEL`].

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::batch::runner::error_class;
use crate::batch::{BatchRun, BatchStatus, HaltReason, WorkItem};
use crate::cost::{CostLedger, CostModel, TEXT_LEDGER_LABEL};
use crate::engine::{truncate, AspectRatio, EngineError, TextEngine};
use crate::error::{Result, SlidegenError};
use crate::feedback::{FeedbackRule, FeedbackStore, Scope};
use crate::repair::repair_json;
use crate::retry::RetryPolicy;

/// Slides requested per text call when drafting from a script.
pub const SCRIPT_CHUNK_SLIDES: usize = 5;

/// Narration seconds one slide covers when only a duration is given.
pub const SECONDS_PER_SLIDE: u32 = 32;

/// Script characters sent as context with every chunk.
const SCRIPT_CONTEXT_CHARS: usize = 10_000;

/// One slide as the text model describes it; every field is optional and
/// `content` may come back as a string, a list or an object.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DraftSlide {
    title: Value,
    content: Value,
    prompt: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FixResponse {
    fixed_prompt: String,
    preventative_rule: String,
}

/// Result of [`TextAssistant::auto_fix`].
#[derive(Debug, Clone, PartialEq)]
pub struct AutoFix {
    pub fixed_prompt: String,
    /// Rule learned from the complaint, if the model produced one.
    pub rule: Option<FeedbackRule>,
}

/// Outcome of one optimization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub optimized: Vec<u32>,
    pub failed: Vec<u32>,
    pub skipped: Vec<u32>,
    pub halt: Option<HaltReason>,
}

/// Flatten model-produced content into display text.
///
/// Lists join with blank lines; `{heading, text}` objects render as heading
/// then text; other objects join their values.
pub fn flatten_content(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(flatten_content)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Object(map) => {
            if let (Some(heading), Some(text)) = (map.get("heading"), map.get("text")) {
                return format!("{}\n\n{}", flatten_content(heading), flatten_content(text));
            }
            map.values()
                .map(flatten_content)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n")
        }
        other => other.to_string(),
    }
}

fn drafting_instruction(topic: &str, count: usize, scope: &Scope, rules: &str) -> String {
    format!(
        "ROLE: Lesson designer.\n\
         TASK: Plan exactly {count} slides about the topic below for the {scope} workflow.\n\
         Each slide needs a short title, the body text shown on the slide, and a \
         detailed visual prompt for an image model.\n\
         TOPIC: {topic}\n\
         OUTPUT: a JSON array only, escaping inner double quotes.\n\
         Example: [{{\"title\": \"...\", \"content\": \"...\", \"prompt\": \"...\"}}]\
         {rules}"
    )
}

fn script_instruction(total: usize, scope: &Scope, rules: &str) -> String {
    format!(
        "ROLE: Educational content architect and visual director.\n\
         TASK: Turn the narration script into exactly {total} presentation slides \
         for the {scope} workflow, in script order.\n\
         Each slide gets a short title, concise key points (not the full script), \
         and a detailed visual prompt for an image model.\n\
         OUTPUT: a JSON array only, escaping inner double quotes.\n\
         Example: [{{\"title\": \"...\", \"content\": \"...\", \"prompt\": \"...\"}}]\
         {rules}"
    )
}

fn optimization_instruction(item: &WorkItem, rules: &str) -> String {
    format!(
        "ROLE: Content compliance and visual director.\n\
         TASK: Write the final visual prompt for an image model.\n\
         INPUT DATA (DO NOT CHANGE):\n\
         Title: \"{title}\"\n\
         Body: \"{body}\"\n\
         RULES:\n\
         1. Instruct the image model to render the title and body EXACTLY as given.\n\
         2. Keep the current visual intent: {prompt}\n\
         OUTPUT FORMAT: just the prompt string.\
         {rules}",
        title = item.title,
        body = item.content,
        prompt = item.prompt,
    )
}

fn fix_instruction(scope: &Scope) -> String {
    format!(
        "ROLE: Error recovery specialist and system trainer.\n\
         TASK: Fix a visual prompt based on a user complaint AND derive a short \
         general rule that prevents the problem in future {scope} generations.\n\
         OUTPUT JSON: {{\"fixedPrompt\": \"...\", \"preventativeRule\": \"...\"}}"
    )
}

/// Number of slides for `minutes` of narration, rounded up.
#[must_use]
pub fn slides_for_duration(minutes: u32) -> usize {
    (minutes.saturating_mul(60)).div_ceil(SECONDS_PER_SLIDE) as usize
}

/// Work items numbered from 1; a missing title becomes `Slide N` and a
/// missing prompt falls back to the title.
fn items_from_slides(slides: Vec<DraftSlide>) -> Vec<WorkItem> {
    slides
        .into_iter()
        .zip(1u32..)
        .map(|(slide, id)| {
            let title = Some(flatten_content(&slide.title))
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("Slide {id}"));
            let prompt = Some(flatten_content(&slide.prompt))
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| title.clone());
            WorkItem::new(id, title, flatten_content(&slide.content), prompt)
        })
        .collect()
}

/// Text-model services sharing the retry policy, feedback store and ledger
/// of the image pipeline.
pub struct TextAssistant {
    text: Arc<dyn TextEngine>,
    retry: RetryPolicy,
    feedback: Arc<FeedbackStore>,
    costs: Arc<CostModel>,
    ledger: Arc<CostLedger>,
    inter_item_delay: Duration,
}

impl std::fmt::Debug for TextAssistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextAssistant")
            .field("text", &self.text.name())
            .field("retry", &self.retry)
            .field("inter_item_delay", &self.inter_item_delay)
            .finish_non_exhaustive()
    }
}

impl TextAssistant {
    pub fn new(
        text: Arc<dyn TextEngine>,
        retry: RetryPolicy,
        feedback: Arc<FeedbackStore>,
        costs: Arc<CostModel>,
        ledger: Arc<CostLedger>,
    ) -> Self {
        Self {
            text,
            retry,
            feedback,
            costs,
            ledger,
            inter_item_delay: Duration::ZERO,
        }
    }

    /// Pause between consecutive calls of an optimization pass.
    #[must_use]
    pub fn with_inter_item_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay = delay;
        self
    }

    /// One text call under the retry policy, billed on success.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let text = self
            .retry
            .run(|| self.text.complete(system, prompt))
            .await?;
        let cost = self.costs.text_call_cost().await;
        self.ledger.record(TEXT_LEDGER_LABEL, cost);
        debug!(engine = self.text.name(), chars = text.len(), cost, "Text call completed");
        Ok(text)
    }

    /// Ask the text model for `count` slides and load them into a new batch
    /// in REVIEW.
    ///
    /// A response that cannot be decoded counts as zero slides, which is an
    /// input error.
    pub async fn draft_batch(
        &self,
        topic: &str,
        count: usize,
        scope: Scope,
        aspect_ratio: AspectRatio,
    ) -> Result<BatchRun> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(SlidegenError::invalid_input("topic", "must not be empty"));
        }
        if count == 0 {
            return Err(SlidegenError::invalid_input("count", "must be at least 1"));
        }

        let rules = self.feedback.rules_for(&scope).to_string();
        let system = drafting_instruction(topic, count, &scope, &rules);
        let response = self
            .complete(&system, &format!("Create the {count} slides now."))
            .await?;

        let slides: Vec<DraftSlide> = repair_json(&response, Vec::new());
        if slides.len() != count {
            warn!(requested = count, received = slides.len(), "Slide count mismatch");
        }

        let items = items_from_slides(slides.into_iter().take(count).collect());

        let mut batch = BatchRun::new(topic, scope).with_aspect_ratio(aspect_ratio);
        batch.load_drafts(items)?;
        info!(topic = %batch.topic, items = batch.items().len(), "Batch drafted");
        Ok(batch)
    }

    /// Draft a deck that follows a narration script.
    ///
    /// The slide count is `count` when given, otherwise one slide per
    /// [`SECONDS_PER_SLIDE`] of narration. Slides are requested in chunks of
    /// [`SCRIPT_CHUNK_SLIDES`]; a chunk that fails without a fatal error is
    /// skipped. Drafted prompts are final, so items start optimized.
    pub async fn draft_from_script(
        &self,
        script: &str,
        minutes: u32,
        count: Option<usize>,
        scope: Scope,
        aspect_ratio: AspectRatio,
    ) -> Result<BatchRun> {
        let script = script.trim();
        if script.is_empty() {
            return Err(SlidegenError::invalid_input("script", "must not be empty"));
        }
        let total = count
            .filter(|c| *c > 0)
            .unwrap_or_else(|| slides_for_duration(minutes));
        if total == 0 {
            return Err(SlidegenError::invalid_input(
                "minutes",
                "must be at least 1 when no slide count is given",
            ));
        }

        let rules = self.feedback.rules_for(&scope).to_string();
        let system = script_instruction(total, &scope, &rules);
        let context: String = script.chars().take(SCRIPT_CONTEXT_CHARS).collect();
        let mut slides = Vec::with_capacity(total);

        for start in (1..=total).step_by(SCRIPT_CHUNK_SLIDES) {
            let end = (start + SCRIPT_CHUNK_SLIDES - 1).min(total);
            let wanted = end - start + 1;
            if start > 1 && !self.inter_item_delay.is_zero() {
                tokio::time::sleep(self.inter_item_delay).await;
            }
            let prompt = format!(
                "SCRIPT:\n\"\"\"{context}\"\"\"\n\
                 Generate slides #{start} to #{end} of {total}: exactly {wanted} slides."
            );
            match self.complete(&system, &prompt).await {
                Ok(response) => {
                    let chunk: Vec<DraftSlide> = repair_json(&response, Vec::new());
                    if chunk.len() != wanted {
                        warn!(start, end, received = chunk.len(), "Script chunk size mismatch");
                    }
                    slides.extend(chunk.into_iter().take(wanted));
                }
                Err(err) if error_class(&err).is_fatal() => return Err(err),
                Err(err) => warn!(start, end, error = %err, "Script chunk failed, skipping"),
            }
        }

        if slides.is_empty() {
            return Err(SlidegenError::invalid_input(
                "script",
                "no slides could be drafted from the script",
            ));
        }
        let mut items = items_from_slides(slides);
        for item in &mut items {
            item.is_optimized = true;
        }

        let topic = script.lines().find(|l| !l.trim().is_empty()).unwrap_or(script);
        let mut batch =
            BatchRun::new(truncate(topic.trim(), 60), scope).with_aspect_ratio(aspect_ratio);
        batch.load_drafts(items)?;
        info!(topic = %batch.topic, items = batch.items().len(), requested = total, "Batch drafted from script");
        Ok(batch)
    }

    /// Refine the prompt of every item not yet optimized, one at a time.
    ///
    /// Item failures leave the item untouched (still PENDING, not optimized)
    /// and move on; a fatal failure stops the pass. The batch's pause token
    /// is honoured between items.
    pub async fn optimize_batch(&self, batch: &mut BatchRun) -> Result<OptimizeReport> {
        match batch.status() {
            BatchStatus::Idle => {
                return Err(SlidegenError::invalid_input("items", "batch has no items"));
            }
            BatchStatus::Processing => {
                return Err(SlidegenError::BatchTransition {
                    from: BatchStatus::Processing.to_string(),
                    to: "OPTIMIZING".to_string(),
                });
            }
            _ => {}
        }

        let token = batch.pause_token();
        token.reset();
        let rules = self.feedback.rules_for(&batch.scope).to_string();
        let mut report = OptimizeReport::default();
        let mut dispatched = false;

        let pending: Vec<(u32, bool)> = batch
            .items()
            .iter()
            .map(|i| (i.id, i.is_optimized))
            .collect();

        for (id, is_optimized) in pending {
            if is_optimized {
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

            let system = match batch.item(id) {
                Some(item) => optimization_instruction(item, &rules),
                None => continue,
            };
            let result = self
                .complete(&system, "Execute optimization and verification.")
                .await
                .and_then(|text| {
                    let text = text.trim().to_string();
                    if text.is_empty() {
                        Err(EngineError::rejected("empty optimized prompt").into())
                    } else {
                        Ok(text)
                    }
                });

            match result {
                Ok(prompt) => {
                    let item = batch.item_mut(id)?;
                    item.prompt = prompt;
                    item.is_optimized = true;
                    debug!(item = id, "Prompt optimized");
                    report.optimized.push(id);
                }
                Err(err) => {
                    let class = error_class(&err);
                    report.failed.push(id);
                    if class.is_fatal() {
                        error!(item = id, class = %class, "Fatal failure, halting optimization");
                        report.halt = Some(HaltReason::Fatal {
                            item: id,
                            class,
                            message: err.to_string(),
                        });
                        break;
                    }
                    warn!(item = id, class = %class, error = %err, "Optimization failed, keeping draft prompt");
                }
            }
        }

        if report.halt.is_none() && token.is_paused() {
            report.halt = Some(HaltReason::Paused);
        }
        info!(
            optimized = report.optimized.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Optimization pass finished"
        );
        Ok(report)
    }

    /// Rewrite `prompt` to address `complaint` and learn a rule for `scope`.
    ///
    /// An undecodable response keeps the original prompt and learns nothing.
    /// A rule that cannot be persisted is logged and dropped; the fix itself
    /// still succeeds.
    pub async fn auto_fix(&self, prompt: &str, complaint: &str, scope: &Scope) -> Result<AutoFix> {
        if prompt.trim().is_empty() {
            return Err(SlidegenError::invalid_input("prompt", "must not be empty"));
        }
        if complaint.trim().is_empty() {
            return Err(SlidegenError::invalid_input("complaint", "must not be empty"));
        }

        let response = self
            .complete(
                &fix_instruction(scope),
                &format!("Original: \"{prompt}\"\nComplaint: \"{complaint}\""),
            )
            .await?;
        let parsed = repair_json(
            &response,
            FixResponse {
                fixed_prompt: prompt.to_string(),
                preventative_rule: String::new(),
            },
        );

        let fixed_prompt = if parsed.fixed_prompt.trim().is_empty() {
            prompt.to_string()
        } else {
            parsed.fixed_prompt.trim().to_string()
        };

        let rule = if parsed.preventative_rule.trim().is_empty() {
            None
        } else {
            match self
                .feedback
                .record_rule(complaint, prompt, &parsed.preventative_rule, scope)
            {
                Ok(rule) => Some(rule),
                Err(err) => {
                    warn!(scope = %scope, error = %err, "Could not persist learned rule");
                    None
                }
            }
        };

        Ok(AutoFix { fixed_prompt, rule })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ItemStatus;
    use crate::cost::{FixedRate, PricingConfig};
    use crate::engine::{FailureKind, MockTextEngine};
    use crate::retry::{ErrorClass, RetryConfig};
    use serde_json::json;

    struct Harness {
        assistant: TextAssistant,
        text: Arc<MockTextEngine>,
        feedback: Arc<FeedbackStore>,
        ledger: Arc<CostLedger>,
    }

    fn harness(text: MockTextEngine) -> Harness {
        let text = Arc::new(text);
        let feedback = Arc::new(FeedbackStore::in_memory());
        let ledger = Arc::new(CostLedger::in_memory());
        let costs = Arc::new(CostModel::new(
            PricingConfig::default(),
            Arc::new(FixedRate::new(25_000)),
        ));
        let assistant = TextAssistant::new(
            text.clone(),
            RetryPolicy::new(RetryConfig::default()),
            feedback.clone(),
            costs,
            ledger.clone(),
        );
        Harness {
            assistant,
            text,
            feedback,
            ledger,
        }
    }

    fn drafted(n: u32) -> BatchRun {
        let mut batch = BatchRun::new("Water cycle", Scope::slide_deck());
        batch
            .load_drafts(
                (1..=n)
                    .map(|i| WorkItem::new(i, format!("Slide {i}"), "body", format!("draft {i}")))
                    .collect(),
            )
            .unwrap();
        batch
    }

    // =========================================================================
    // Content flattening
    // =========================================================================

    #[test]
    fn test_flatten_content_shapes() {
        assert_eq!(flatten_content(&json!("plain")), "plain");
        assert_eq!(flatten_content(&json!(null)), "");
        assert_eq!(flatten_content(&json!(["a", "b"])), "a\n\nb");
        assert_eq!(
            flatten_content(&json!({"heading": "H", "text": "T"})),
            "H\n\nT"
        );
        assert_eq!(flatten_content(&json!([{"x": "1"}, 2])), "1\n\n2");
    }

    // =========================================================================
    // Drafting
    // =========================================================================

    #[tokio::test]
    async fn test_draft_batch_builds_review_batch() {
        let response = "Here you go:\n```json\n[\
            {\"title\": \"Evaporation\", \"content\": [\"Sun heats\", \"water rises\"], \"prompt\": \"3D sun\"},\
            {\"content\": {\"heading\": \"Rain\", \"text\": \"falls\"}, \"prompt\": \"clouds\"}\
            ]\n```";
        let h = harness(MockTextEngine::new().with_response(response));

        let batch = h
            .assistant
            .draft_batch("Water cycle", 2, Scope::slide_deck(), AspectRatio::Wide)
            .await
            .unwrap();

        assert_eq!(batch.status(), BatchStatus::Review);
        assert_eq!(batch.aspect_ratio, AspectRatio::Wide);
        let items = batch.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, 1);
        assert_eq!(items[0].content, "Sun heats\n\nwater rises");
        assert_eq!(items[1].title, "Slide 2");
        assert_eq!(items[1].content, "Rain\n\nfalls");
        assert!(items.iter().all(|i| i.status() == ItemStatus::Pending));
        assert!(items.iter().all(|i| !i.is_optimized));
    }

    #[tokio::test]
    async fn test_draft_batch_bills_text_call() {
        let h = harness(MockTextEngine::new().with_response(r#"[{"title":"A","prompt":"p"}]"#));
        h.assistant
            .draft_batch("Cells", 1, Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap();
        assert_eq!(h.ledger.session_total(), 5);
        assert_eq!(h.ledger.snapshot().engines[TEXT_LEDGER_LABEL].calls, 1);
    }

    #[tokio::test]
    async fn test_draft_batch_injects_scope_rules() {
        let h = harness(MockTextEngine::new().with_response(r#"[{"title":"A","prompt":"p"}]"#));
        h.feedback
            .record_rule("too dark", "p", "Use bright lighting", &Scope::slide_deck())
            .unwrap();
        h.feedback
            .record_rule("c", "p", "Unrelated rule", &Scope::thumbnail())
            .unwrap();

        h.assistant
            .draft_batch("Cells", 1, Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap();

        let (system, _) = &h.text.prompts()[0];
        assert!(system.contains("Use bright lighting"));
        assert!(!system.contains("Unrelated rule"));
    }

    #[tokio::test]
    async fn test_draft_batch_rejects_empty_topic_before_call() {
        let h = harness(MockTextEngine::new());
        let err = h
            .assistant
            .draft_batch("  ", 3, Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SlidegenError::InvalidInput { .. }));
        assert_eq!(h.text.call_count(), 0);
    }

    #[tokio::test]
    async fn test_draft_batch_garbage_response_is_input_error() {
        let h = harness(MockTextEngine::new().with_response("I cannot help with that."));
        let err = h
            .assistant
            .draft_batch("Cells", 3, Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SlidegenError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_draft_batch_fatal_error_propagates() {
        let h = harness(
            MockTextEngine::new().with_error(EngineError::new(FailureKind::DailyQuota, "per day")),
        );
        let err = h
            .assistant
            .draft_batch("Cells", 3, Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(h.text.call_count(), 1);
        assert_eq!(h.ledger.session_total(), 0);
    }

    // =========================================================================
    // Drafting from a script
    // =========================================================================

    fn slides_json(range: std::ops::RangeInclusive<u32>) -> String {
        let slides: Vec<_> = range
            .map(|n| json!({"title": format!("Part {n}"), "content": "point", "prompt": format!("scene {n}")}))
            .collect();
        json!(slides).to_string()
    }

    const SCRIPT: &str = "Why the sky is blue\nSunlight scatters off air molecules.";

    #[test]
    fn test_slides_for_duration_rounds_up() {
        assert_eq!(slides_for_duration(0), 0);
        assert_eq!(slides_for_duration(1), 2);
        assert_eq!(slides_for_duration(3), 6);
        assert_eq!(slides_for_duration(8), 15);
    }

    #[tokio::test]
    async fn test_script_draft_requests_chunks_in_order() {
        let h = harness(MockTextEngine::new().with_responses([slides_json(1..=5), slides_json(6..=7)]));

        let batch = h
            .assistant
            .draft_from_script(SCRIPT, 0, Some(7), Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap();

        assert_eq!(batch.status(), BatchStatus::Review);
        assert_eq!(batch.topic, "Why the sky is blue");
        let ids: Vec<u32> = batch.items().iter().map(|i| i.id).collect();
        assert_eq!(ids, (1..=7).collect::<Vec<_>>());
        assert_eq!(batch.items()[6].title, "Part 7");
        assert!(batch.items().iter().all(|i| i.is_optimized));

        let prompts = h.text.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].1.contains("#1 to #5 of 7"));
        assert!(prompts[1].1.contains("#6 to #7 of 7: exactly 2 slides"));
        assert!(prompts[0].0.contains("exactly 7 presentation slides"));
        assert_eq!(h.ledger.session_total(), 10);
    }

    #[tokio::test]
    async fn test_script_draft_count_from_duration() {
        let h = harness(MockTextEngine::new().with_response(slides_json(1..=5)));

        let batch = h
            .assistant
            .draft_from_script(SCRIPT, 1, None, Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap();

        assert_eq!(batch.items().len(), 2);
        assert_eq!(h.text.call_count(), 1);
    }

    #[tokio::test]
    async fn test_script_draft_skips_undecodable_chunk() {
        let h = harness(
            MockTextEngine::new().with_responses(["not json at all".to_string(), slides_json(6..=6)]),
        );

        let batch = h
            .assistant
            .draft_from_script(SCRIPT, 0, Some(6), Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap();

        assert_eq!(batch.items().len(), 1);
        assert_eq!(batch.items()[0].id, 1);
        assert_eq!(batch.items()[0].title, "Part 6");
    }

    #[tokio::test]
    async fn test_script_draft_all_chunks_failing_is_input_error() {
        let h = harness(MockTextEngine::new().with_error(EngineError::rejected("blocked")));

        let err = h
            .assistant
            .draft_from_script(SCRIPT, 0, Some(6), Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SlidegenError::InvalidInput { .. }));
        assert_eq!(h.text.call_count(), 2);
        assert_eq!(h.ledger.session_total(), 0);
    }

    #[tokio::test]
    async fn test_script_draft_fatal_stops_at_first_chunk() {
        let h = harness(
            MockTextEngine::new().with_error(EngineError::new(FailureKind::PermissionDenied, "403")),
        );

        let err = h
            .assistant
            .draft_from_script(SCRIPT, 0, Some(12), Scope::slide_deck(), AspectRatio::default())
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(h.text.call_count(), 1);
    }

    #[tokio::test]
    async fn test_script_draft_validates_inputs() {
        let h = harness(MockTextEngine::new().with_response(slides_json(1..=5)));

        for (script, minutes) in [("   ", 3), (SCRIPT, 0)] {
            let err = h
                .assistant
                .draft_from_script(script, minutes, None, Scope::slide_deck(), AspectRatio::default())
                .await
                .unwrap_err();
            assert!(matches!(err, SlidegenError::InvalidInput { .. }));
        }
        assert_eq!(h.text.call_count(), 0);
    }

    // =========================================================================
    // Optimization pass
    // =========================================================================

    #[tokio::test]
    async fn test_optimize_sets_prompt_and_flag() {
        let h = harness(MockTextEngine::new().with_responses(["  refined one ", "refined two"]));
        let mut batch = drafted(2);

        let report = h.assistant.optimize_batch(&mut batch).await.unwrap();

        assert_eq!(report.optimized, vec![1, 2]);
        assert_eq!(batch.item(1).unwrap().prompt, "refined one");
        assert!(batch.items().iter().all(|i| i.is_optimized));
        assert!(batch.items().iter().all(|i| i.status() == ItemStatus::Pending));
        assert_eq!(h.ledger.session_total(), 10);
    }

    #[tokio::test]
    async fn test_optimize_skips_already_optimized() {
        let h = harness(MockTextEngine::new().with_response("refined"));
        let mut batch = drafted(3);
        batch.item_mut(2).unwrap().is_optimized = true;

        let report = h.assistant.optimize_batch(&mut batch).await.unwrap();

        assert_eq!(report.skipped, vec![2]);
        assert_eq!(h.text.call_count(), 2);
        assert_eq!(batch.item(2).unwrap().prompt, "draft 2");
    }

    #[tokio::test]
    async fn test_optimize_item_failure_keeps_draft() {
        let h = harness(MockTextEngine::new().with_error(EngineError::rejected("blocked")));
        let mut batch = drafted(2);

        let report = h.assistant.optimize_batch(&mut batch).await.unwrap();

        assert_eq!(report.failed, vec![1, 2]);
        assert!(report.halt.is_none());
        let item = batch.item(1).unwrap();
        assert_eq!(item.prompt, "draft 1");
        assert!(!item.is_optimized);
        assert_eq!(item.status(), ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_optimize_fatal_halts_pass() {
        let h = harness(
            MockTextEngine::new().with_error(EngineError::new(FailureKind::PermissionDenied, "403")),
        );
        let mut batch = drafted(3);

        let report = h.assistant.optimize_batch(&mut batch).await.unwrap();

        assert_eq!(h.text.call_count(), 1);
        assert!(matches!(
            report.halt,
            Some(HaltReason::Fatal {
                item: 1,
                class: ErrorClass::FatalPermission,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_optimize_empty_response_is_item_failure() {
        let h = harness(MockTextEngine::new().with_response("   "));
        let mut batch = drafted(1);
        let report = h.assistant.optimize_batch(&mut batch).await.unwrap();
        assert_eq!(report.failed, vec![1]);
        assert!(!batch.item(1).unwrap().is_optimized);
    }

    #[tokio::test]
    async fn test_optimize_rejects_idle_batch() {
        let h = harness(MockTextEngine::new());
        let mut batch = BatchRun::new("t", Scope::slide_deck());
        assert!(h.assistant.optimize_batch(&mut batch).await.is_err());
        assert_eq!(h.text.call_count(), 0);
    }

    #[tokio::test]
    async fn test_edit_after_optimize_requeues_item() {
        let h = harness(MockTextEngine::new().with_response("refined"));
        let mut batch = drafted(2);
        h.assistant.optimize_batch(&mut batch).await.unwrap();

        batch.item_mut(2).unwrap().edit_text("New title", "New body");
        let report = h.assistant.optimize_batch(&mut batch).await.unwrap();

        assert_eq!(report.skipped, vec![1]);
        assert_eq!(report.optimized, vec![2]);
        let (system, _) = h.text.prompts().pop().unwrap();
        assert!(system.contains("New title"));
    }

    // =========================================================================
    // Auto-fix
    // =========================================================================

    #[tokio::test]
    async fn test_auto_fix_learns_rule() {
        let h = harness(MockTextEngine::new().with_response(
            r#"{"fixedPrompt": "cover art, large title", "preventativeRule": "Titles fill a third of the frame"}"#,
        ));

        let fix = h
            .assistant
            .auto_fix("cover art", "title too small", &Scope::thumbnail())
            .await
            .unwrap();

        assert_eq!(fix.fixed_prompt, "cover art, large title");
        let rule = fix.rule.unwrap();
        assert_eq!(rule.scope, Scope::thumbnail());
        assert_eq!(rule.complaint, "title too small");
        let learned = h.feedback.rules_for(&Scope::thumbnail());
        assert_eq!(learned.rules, vec!["Titles fill a third of the frame"]);
        assert!(h.feedback.rules_for(&Scope::slide_deck()).is_empty());
    }

    #[tokio::test]
    async fn test_auto_fix_empty_rule_learns_nothing() {
        let h = harness(
            MockTextEngine::new().with_response(r#"{"fixedPrompt": "better", "preventativeRule": ""}"#),
        );
        let fix = h
            .assistant
            .auto_fix("p", "c", &Scope::general())
            .await
            .unwrap();
        assert_eq!(fix.fixed_prompt, "better");
        assert!(fix.rule.is_none());
        assert!(h.feedback.records().is_empty());
    }

    #[tokio::test]
    async fn test_auto_fix_undecodable_keeps_original() {
        let h = harness(MockTextEngine::new().with_response("sorry, no JSON today"));
        let fix = h
            .assistant
            .auto_fix("original prompt", "too dark", &Scope::general())
            .await
            .unwrap();
        assert_eq!(fix.fixed_prompt, "original prompt");
        assert!(fix.rule.is_none());
        assert_eq!(h.ledger.session_total(), 5);
    }

    #[tokio::test]
    async fn test_auto_fix_validates_inputs() {
        let h = harness(MockTextEngine::new());
        assert!(h.assistant.auto_fix(" ", "c", &Scope::general()).await.is_err());
        assert!(h.assistant.auto_fix("p", "", &Scope::general()).await.is_err());
        assert_eq!(h.text.call_count(), 0);
    }
}
