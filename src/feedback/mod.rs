//! Scoped memory of learned corrections.
//!
//! When an operator explains what went wrong with an output, the auto-fix
//! service derives a preventative rule and records it here under the scope
//! (feature context) it came from. Every later request in that scope carries
//! the most recent distinct rules; other scopes never see them.
//!
//! The log is a bounded, newest-first JSON array stored under one fixed key
//! in a [`KeyValueStore`]. It is loaded lazily on first access and shared by
//! every flow through an explicit [`FeedbackStore`] handle.

pub mod storage;

pub use storage::{JsonFileStore, KeyValueStore, MemoryStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, SlidegenError};

// =============================================================================
// Scope
// =============================================================================

/// Feature context that partitions learned rules.
///
/// Scopes compare exactly after normalization to upper snake case, so
/// `slide-deck` and `SLIDE_DECK` name the same scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(name: impl AsRef<str>) -> Self {
        let normalized = name
            .as_ref()
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        Self(normalized)
    }

    pub fn general() -> Self {
        Self::new("GENERAL")
    }

    pub fn single() -> Self {
        Self::new("SINGLE")
    }

    pub fn slide_deck() -> Self {
        Self::new("SLIDE_DECK")
    }

    pub fn remake_slide() -> Self {
        Self::new("REMAKE_SLIDE")
    }

    pub fn mc_studio() -> Self {
        Self::new("MC_STUDIO")
    }

    pub fn thumbnail() -> Self {
        Self::new("THUMBNAIL")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::general()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Scope {
    type Err = SlidegenError;

    fn from_str(s: &str) -> Result<Self> {
        let scope = Self::new(s);
        if scope.0.is_empty() {
            return Err(SlidegenError::invalid_input("scope", "must not be empty"));
        }
        Ok(scope)
    }
}

// =============================================================================
// Records
// =============================================================================

/// A learned corrective directive. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRule {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// What the operator complained about.
    pub complaint: String,
    /// Leading characters of the prompt that drew the complaint.
    pub prompt_snippet: String,
    pub rule: String,
    pub scope: Scope,
}

/// Rules for one scope, most recent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnedRules {
    pub scope: Scope,
    pub rules: Vec<String>,
}

impl LearnedRules {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Numbered directive block, or nothing when there are no rules.
impl std::fmt::Display for LearnedRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.rules.is_empty() {
            return Ok(());
        }
        write!(f, "\n[LEARNED CORRECTIONS FOR {}]:", self.scope)?;
        for (i, rule) in self.rules.iter().enumerate() {
            write!(f, "\n{}. {rule}", i + 1)?;
        }
        Ok(())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Feedback section of the settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Records kept across all scopes.
    pub capacity: usize,
    /// Distinct rules returned per query.
    pub max_rules: usize,
    pub snippet_chars: usize,
    pub storage_key: String,
    /// Directory for the log; defaults to the user data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            max_rules: 5,
            snippet_chars: 100,
            storage_key: "SLIDEGEN_FEEDBACK_DB_V2".to_string(),
            dir: None,
        }
    }
}

impl FeedbackConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.capacity == 0 {
            problems.push("feedback.capacity must be greater than 0".to_string());
        }
        if self.max_rules == 0 {
            problems.push("feedback.max_rules must be greater than 0".to_string());
        }
        if self.storage_key.trim().is_empty() {
            problems.push("feedback.storage_key must not be empty".to_string());
        }
        problems
    }

    /// Configured directory, else `<data dir>/slidegen`.
    #[must_use]
    pub fn resolve_dir(&self) -> Option<PathBuf> {
        self.dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("slidegen")))
    }
}

// =============================================================================
// Store
// =============================================================================

/// Shared handle to the persisted feedback log.
pub struct FeedbackStore {
    kv: Arc<dyn KeyValueStore>,
    config: FeedbackConfig,
    /// `None` until first access.
    log: Mutex<Option<Vec<FeedbackRule>>>,
}

impl std::fmt::Debug for FeedbackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FeedbackStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: FeedbackConfig) -> Self {
        Self {
            kv,
            config,
            log: Mutex::new(None),
        }
    }

    /// Store backed by process memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), FeedbackConfig::default())
    }

    /// Store backed by JSON files in the configured or default data dir.
    pub fn open(config: FeedbackConfig) -> Result<Self> {
        let dir = config
            .resolve_dir()
            .ok_or_else(|| SlidegenError::config("no data directory for the feedback log"))?;
        Ok(Self::new(Arc::new(JsonFileStore::new(dir)), config))
    }

    fn load(&self) -> Vec<FeedbackRule> {
        let key = &self.config.storage_key;
        match self.kv.get(key) {
            Ok(None) => Vec::new(),
            Ok(Some(text)) => match serde_json::from_str(&text) {
                Ok(records) => records,
                Err(err) => {
                    warn!(key = %key, error = %err, "Corrupt feedback log, starting empty");
                    Vec::new()
                }
            },
            Err(err) => {
                warn!(key = %key, error = %err, "Feedback log unreadable, starting empty");
                Vec::new()
            }
        }
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut Vec<FeedbackRule>) -> Result<T>) -> Result<T> {
        let mut guard = self
            .log
            .lock()
            .map_err(|_| SlidegenError::storage(&self.config.storage_key, "log lock poisoned"))?;
        let log = guard.get_or_insert_with(|| self.load());
        f(log)
    }

    /// Append a rule (newest first), evict beyond capacity and persist.
    ///
    /// The in-memory log only changes once the write succeeds.
    pub fn record_rule(
        &self,
        complaint: &str,
        prompt: &str,
        rule: &str,
        scope: &Scope,
    ) -> Result<FeedbackRule> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Err(SlidegenError::invalid_input("rule", "must not be empty"));
        }

        let record = FeedbackRule {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            complaint: complaint.trim().to_string(),
            prompt_snippet: prompt.chars().take(self.config.snippet_chars).collect(),
            rule: rule.to_string(),
            scope: scope.clone(),
        };

        self.with_log(|log| {
            let mut updated = Vec::with_capacity(log.len() + 1);
            updated.push(record.clone());
            updated.extend(log.iter().cloned());
            updated.truncate(self.config.capacity);

            let json = serde_json::to_string(&updated)?;
            self.kv.put(&self.config.storage_key, &json)?;
            *log = updated;
            Ok(())
        })?;

        info!(scope = %scope, rule = %record.rule, "Learned new rule");
        Ok(record)
    }

    /// Most recent distinct rules recorded under exactly `scope`.
    pub fn rules_for(&self, scope: &Scope) -> LearnedRules {
        let max_rules = self.config.max_rules;
        let rules = self
            .with_log(|log| {
                let mut rules: Vec<String> = Vec::new();
                for record in log.iter().filter(|r| &r.scope == scope) {
                    if !rules.contains(&record.rule) {
                        rules.push(record.rule.clone());
                    }
                    if rules.len() == max_rules {
                        break;
                    }
                }
                Ok(rules)
            })
            .unwrap_or_else(|err| {
                warn!(error = %err, "Feedback log unavailable");
                Vec::new()
            });
        LearnedRules {
            scope: scope.clone(),
            rules,
        }
    }

    /// Whole log, newest first.
    pub fn records(&self) -> Vec<FeedbackRule> {
        self.with_log(|log| Ok(log.clone())).unwrap_or_default()
    }
}
