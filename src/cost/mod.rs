//! Per-call pricing and cost accounting.
//!
//! # Architecture
//!
//! Base prices are held in integer micro-USD and converted through the
//! [`ExchangeRateProvider`] with a ceiling division, so a unit cost is always
//! a whole number in local currency. The [`CostLedger`] accumulates those
//! unit costs across batch and single-shot flows and persists them to
//! `.slidegen/costs.json` for cross-session tracking.
//!
//! # Example
//!
//! ```rust,ignore
//! use slidegen::cost::{CostLedger, CostModel, FixedRate, PricingConfig};
//!
//! let model = CostModel::new(PricingConfig::default(), Arc::new(FixedRate::new(25_000)));
//! let ledger = CostLedger::in_memory();
//! ledger.record("flux", model.unit_cost(EngineKind::Flux).await);
//! println!("Spent {}", ledger.session_total());
//! ```

pub mod exchange;

pub use exchange::{CachedExchangeRate, ExchangeRateProvider, FixedRate, OpenErApi, RateSource};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::engine::EngineKind;

/// Ledger label for text-model calls.
pub const TEXT_LEDGER_LABEL: &str = "text";

const MICROS_PER_USD: u64 = 1_000_000;

// =============================================================================
// Pricing
// =============================================================================

/// Pricing section of the settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PricingConfig {
    pub flux_micro_usd: u64,
    pub google_image_micro_usd: u64,
    pub text_call_micro_usd: u64,
    /// Rate used when the feed is unreachable.
    pub fallback_rate: u64,
    pub rate_ttl_secs: u64,
    pub rate_url: String,
    pub currency: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            flux_micro_usd: 2_000,
            google_image_micro_usd: 30_000,
            text_call_micro_usd: 200,
            fallback_rate: 25_500,
            rate_ttl_secs: 3_600,
            rate_url: "https://open.er-api.com/v6/latest/USD".to_string(),
            currency: "VND".to_string(),
        }
    }
}

impl PricingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.fallback_rate == 0 {
            problems.push("pricing.fallback_rate must be greater than 0".to_string());
        }
        if self.currency.trim().is_empty() {
            problems.push("pricing.currency must not be empty".to_string());
        }
        problems
    }

    #[must_use]
    pub fn base_price(&self, engine: EngineKind) -> u64 {
        match engine {
            EngineKind::Flux => self.flux_micro_usd,
            EngineKind::Google => self.google_image_micro_usd,
        }
    }
}

/// Convert micro-USD to whole local units, rounding up.
#[must_use]
pub fn convert(micro_usd: u64, rate: u64) -> u64 {
    micro_usd.saturating_mul(rate).div_ceil(MICROS_PER_USD)
}

/// Prices engine calls in local currency.
pub struct CostModel {
    pricing: PricingConfig,
    rates: Arc<dyn ExchangeRateProvider>,
}

impl std::fmt::Debug for CostModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostModel")
            .field("pricing", &self.pricing)
            .finish_non_exhaustive()
    }
}

impl CostModel {
    pub fn new(pricing: PricingConfig, rates: Arc<dyn ExchangeRateProvider>) -> Self {
        Self { pricing, rates }
    }

    #[must_use]
    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    pub async fn rate(&self) -> u64 {
        self.rates.rate().await
    }

    /// Integer cost of one successful call on `engine`.
    pub async fn unit_cost(&self, engine: EngineKind) -> u64 {
        convert(self.pricing.base_price(engine), self.rates.rate().await)
    }

    /// Integer cost of one text-model call.
    pub async fn text_call_cost(&self) -> u64 {
        convert(self.pricing.text_call_micro_usd, self.rates.rate().await)
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Totals for one engine label.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct EngineCost {
    pub calls: u64,
    pub total: u64,
}

/// Persisted ledger contents.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LedgerData {
    /// All-time total across sessions.
    pub total: u64,
    pub engines: BTreeMap<String, EngineCost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Monotonic cost accumulator shared by every generation flow.
#[derive(Debug)]
pub struct CostLedger {
    costs_file: Option<PathBuf>,
    data: Mutex<LedgerData>,
    session_total: AtomicU64,
}

impl CostLedger {
    /// Open the ledger under `<project>/.slidegen/costs.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the costs file exists but cannot be parsed.
    pub fn new(project_dir: impl AsRef<Path>) -> Result<Self> {
        let costs_file = project_dir.as_ref().join(".slidegen/costs.json");
        let data = if costs_file.exists() {
            let file = File::open(&costs_file).context("Failed to open costs file")?;
            serde_json::from_reader(BufReader::new(file)).context("Failed to parse costs file")?
        } else {
            LedgerData::default()
        };
        Ok(Self {
            costs_file: Some(costs_file),
            data: Mutex::new(data),
            session_total: AtomicU64::new(0),
        })
    }

    /// Ledger that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            costs_file: None,
            data: Mutex::new(LedgerData::default()),
            session_total: AtomicU64::new(0),
        }
    }

    /// Add one paid call. Returns the new session total.
    pub fn record(&self, label: &str, amount: u64) -> u64 {
        if let Ok(mut data) = self.data.lock() {
            data.total = data.total.saturating_add(amount);
            let entry = data.engines.entry(label.to_string()).or_default();
            entry.calls += 1;
            entry.total = entry.total.saturating_add(amount);
            data.updated_at = Some(Utc::now());
        }
        let total = self.session_total.fetch_add(amount, Ordering::SeqCst) + amount;
        debug!(engine = label, amount, session_total = total, "Cost accrued");
        total
    }

    /// Spend recorded since this ledger was opened.
    #[must_use]
    pub fn session_total(&self) -> u64 {
        self.session_total.load(Ordering::SeqCst)
    }

    /// Spend across all persisted sessions.
    #[must_use]
    pub fn lifetime_total(&self) -> u64 {
        self.data.lock().map(|d| d.total).unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> LedgerData {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Write the ledger back to its costs file.
    pub fn save(&self) -> Result<()> {
        let Some(costs_file) = &self.costs_file else {
            return Ok(());
        };
        if let Some(parent) = costs_file.parent() {
            fs::create_dir_all(parent).context("Failed to create .slidegen directory")?;
        }
        let data = self.snapshot();
        let tmp_path = costs_file.with_extension("json.tmp");
        let file = File::create(&tmp_path).context("Failed to create costs file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &data).context("Failed to write costs file")?;
        writer.flush().context("Failed to write costs file")?;
        writer
            .get_ref()
            .sync_all()
            .context("Failed to sync costs file")?;
        fs::rename(&tmp_path, costs_file).context("Failed to replace costs file")?;
        Ok(())
    }

    /// Format a cost summary for display.
    #[must_use]
    pub fn format_summary(&self, currency: &str) -> String {
        let data = self.snapshot();
        let mut lines = vec![
            "=== Generation Cost Summary ===".to_string(),
            String::new(),
            format!("Total: {} {currency}", data.total),
            format!("This session: {} {currency}", self.session_total()),
        ];
        if !data.engines.is_empty() {
            lines.push(String::new());
            for (label, cost) in &data.engines {
                lines.push(format!(
                    "  {label}: {} {currency} over {} calls",
                    cost.total, cost.calls
                ));
            }
        }
        lines.join("\n")
    }
}
