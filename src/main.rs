//! slidegen - resilient image generation orchestrator
//!
//! Drafts slide batches with a text model, runs them through paid image
//! engines with retry and fallback, and learns corrections from complaints.

use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use slidegen::assist::{TextAssistant, SCRIPT_CHUNK_SLIDES};
use slidegen::cost::{CachedExchangeRate, ExchangeRateProvider, FixedRate, OpenErApi};
use slidegen::engine::{
    FallbackConfig, GeminiImageEngine, GeminiTextEngine, MockImageEngine, MockTextEngine,
    ReplicateFluxEngine,
};
use slidegen::{
    AspectRatio, BatchEvent, BatchRun, BatchRunner, CostLedger, CostModel, EngineError,
    EngineKind, EngineSelector, FailureKind, FeedbackStore, GenerationPipeline, HaltReason,
    ImageEngine, ItemStatus, Result, RetryPolicy, Scope, Settings, SlidegenError, TextEngine,
};

#[derive(Parser)]
#[command(name = "slidegen")]
#[command(version)]
#[command(about = "Resilient batch image generation with retry, fallback and learned corrections", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Directory for the learned-rules log (defaults to the user data dir)
    #[arg(long, global = true, env = "SLIDEGEN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Use offline mock engines instead of the remote providers
    #[arg(long, global = true)]
    mock: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Draft a batch from a topic and write it as a plan file
    Draft {
        /// Topic or source text for the slides
        #[arg(short, long)]
        topic: String,

        /// Number of slides to draft
        #[arg(short, long, default_value = "5")]
        count: usize,

        /// Feature scope for learned rules
        #[arg(short, long, default_value = "SLIDE_DECK")]
        scope: Scope,

        /// Output frame shape
        #[arg(short, long, value_enum, default_value = "16:9")]
        aspect: AspectRatio,

        /// Plan file to write
        #[arg(short, long)]
        out: PathBuf,

        /// Refine every prompt right after drafting
        #[arg(long)]
        optimize: bool,

        /// Overwrite an existing plan file
        #[arg(short, long)]
        force: bool,
    },

    /// Draft a plan that follows a narration script
    Script {
        /// Script file to read
        #[arg(long)]
        file: PathBuf,

        /// Narration length in minutes; one slide per 32 seconds
        #[arg(short, long, default_value = "0")]
        minutes: u32,

        /// Exact number of slides, overriding the duration
        #[arg(short, long)]
        count: Option<usize>,

        /// Feature scope for learned rules
        #[arg(short, long, default_value = "SLIDE_DECK")]
        scope: Scope,

        /// Output frame shape
        #[arg(short, long, value_enum, default_value = "16:9")]
        aspect: AspectRatio,

        /// Plan file to write
        #[arg(short, long)]
        out: PathBuf,

        /// Overwrite an existing plan file
        #[arg(short, long)]
        force: bool,
    },

    /// Refine the prompts of a plan's items that are not yet optimized
    Optimize {
        /// Plan file to update
        #[arg(long)]
        plan: PathBuf,
    },

    /// Run or resume a plan; Ctrl-C pauses after the current item
    Run {
        /// Plan file to run
        #[arg(long)]
        plan: PathBuf,
    },

    /// Regenerate one item of a plan
    Retry {
        /// Plan file to update
        #[arg(long)]
        plan: PathBuf,

        /// Item id
        #[arg(short, long)]
        item: u32,

        /// Correction note forwarded to the engine
        #[arg(short, long)]
        feedback: Option<String>,
    },

    /// Fix a prompt from a complaint and learn a rule for the scope
    Fix {
        /// Prompt that produced the bad output
        #[arg(long)]
        prompt: String,

        /// What was wrong with the output
        #[arg(short, long)]
        complaint: String,

        /// Feature scope the rule applies to
        #[arg(short, long, default_value = "GENERAL")]
        scope: Scope,
    },

    /// Show learned rules for a scope
    Rules {
        /// Feature scope
        #[arg(short, long, default_value = "GENERAL")]
        scope: Scope,

        /// List the whole log instead of one scope's block
        #[arg(long)]
        all: bool,
    },

    /// Show per-engine unit costs at the current exchange rate
    Price,

    /// Show the persisted cost ledger
    Costs,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "slidegen=debug,info"
    } else {
        "slidegen=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run_cli(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{} {}", "Error:".red().bold(), err);
            if err.requires_human() {
                let hint = match &err {
                    SlidegenError::Engine(engine_err) => engine_err.class().guidance(),
                    _ => "Fix the settings file, then run the command again.",
                };
                eprintln!("   {hint}");
            }
            std::process::exit(err.exit_code());
        }
    }
}

async fn run_cli(cli: Cli) -> Result<i32> {
    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        return Err(SlidegenError::config(format!(
            "Project directory does not exist: {}",
            project_path.display()
        )));
    }

    let services = Services::open(&project_path, cli.data_dir.clone(), cli.mock)?;

    match cli.command {
        Commands::Draft {
            topic,
            count,
            scope,
            aspect,
            out,
            optimize,
            force,
        } => {
            ensure_writable(&out, force)?;
            let assistant = services.assistant(|| mock_draft_response(&topic, count))?;
            let mut batch = assistant.draft_batch(&topic, count, scope, aspect).await?;
            let mut code = 0;
            if optimize {
                let report = assistant.optimize_batch(&mut batch).await?;
                code = print_optimize_report(&report);
            }
            batch.save(&out)?;
            services.ledger.save()?;
            print_plan(&batch, &out);
            Ok(code)
        }

        Commands::Script {
            file,
            minutes,
            count,
            scope,
            aspect,
            out,
            force,
        } => {
            ensure_writable(&out, force)?;
            let script = std::fs::read_to_string(&file).map_err(|e| {
                SlidegenError::invalid_input("file", format!("{}: {e}", file.display()))
            })?;
            let assistant =
                services.assistant(|| mock_draft_response("Script", SCRIPT_CHUNK_SLIDES))?;
            let batch = assistant
                .draft_from_script(&script, minutes, count, scope, aspect)
                .await?;
            batch.save(&out)?;
            services.ledger.save()?;
            print_plan(&batch, &out);
            Ok(0)
        }

        Commands::Optimize { plan } => {
            let mut batch = load_plan(&plan)?;
            let assistant =
                services.assistant(|| "Refined prompt: render the title and body verbatim".into())?;
            let report = assistant.optimize_batch(&mut batch).await?;
            batch.save(&plan)?;
            services.ledger.save()?;
            Ok(print_optimize_report(&report))
        }

        Commands::Run { plan } => run_plan(&services, &plan).await,

        Commands::Retry {
            plan,
            item,
            feedback,
        } => {
            let mut batch = load_plan(&plan)?;
            let runner = BatchRunner::new(
                services.pipeline()?,
                services.ledger.clone(),
                &services.settings.batch,
            );
            let result = runner.retry_item(&mut batch, item, feedback.as_deref()).await;
            batch.save(&plan)?;
            services.ledger.save()?;
            let item = result?;

            match item.status() {
                ItemStatus::Completed => {
                    let uri = item.artifact.as_ref().map_or("", |a| a.uri.as_str());
                    println!("{} #{} {}", "✓".green().bold(), item.id, truncate_uri(uri));
                    Ok(0)
                }
                _ => {
                    let (class, message) = item
                        .last_error
                        .as_ref()
                        .map(|e| (e.class, e.message.as_str()))
                        .unwrap_or((slidegen::ErrorClass::NonRetryable, "unknown failure"));
                    println!("{} #{} {}: {}", "✗".red().bold(), item.id, class, message);
                    println!("   {}", class.guidance());
                    Ok(if class.is_fatal() { 3 } else { 1 })
                }
            }
        }

        Commands::Fix {
            prompt,
            complaint,
            scope,
        } => {
            let assistant = services.assistant(|| {
                json!({
                    "fixedPrompt": format!("{prompt}. Correction: {complaint}"),
                    "preventativeRule": format!("Avoid this problem: {complaint}"),
                })
                .to_string()
            })?;
            let fix = assistant.auto_fix(&prompt, &complaint, &scope).await?;
            services.ledger.save()?;

            println!("{} {}", "Fixed prompt:".green().bold(), fix.fixed_prompt);
            match &fix.rule {
                Some(rule) => println!("{} [{}] {}", "Learned:".cyan().bold(), rule.scope, rule.rule),
                None => println!("{}", "No rule learned".dimmed()),
            }
            Ok(0)
        }

        Commands::Rules { scope, all } => {
            if all {
                let records = services.feedback.records();
                if records.is_empty() {
                    println!("No learned rules yet");
                }
                for record in records {
                    println!(
                        "{} [{}] {}",
                        record.created_at.format("%Y-%m-%d %H:%M"),
                        record.scope,
                        record.rule
                    );
                }
            } else {
                let rules = services.feedback.rules_for(&scope);
                if rules.is_empty() {
                    println!("No learned rules for {scope}");
                } else {
                    println!("{}", rules.to_string().trim_start());
                }
            }
            Ok(0)
        }

        Commands::Price => {
            let costs = &services.costs;
            let currency = &costs.pricing().currency;
            println!("{}", "Unit costs".cyan().bold());
            println!("   Exchange rate: {} {currency}/USD", costs.rate().await);
            for kind in [EngineKind::Flux, EngineKind::Google] {
                println!("   {:<8} {} {currency}", kind.to_string(), costs.unit_cost(kind).await);
            }
            println!("   {:<8} {} {currency}", "text", costs.text_call_cost().await);
            Ok(0)
        }

        Commands::Costs => {
            println!(
                "{}",
                services.ledger.format_summary(&services.costs.pricing().currency)
            );
            Ok(0)
        }
    }
}

// =============================================================================
// Wiring
// =============================================================================

struct Services {
    settings: Settings,
    feedback: Arc<FeedbackStore>,
    costs: Arc<CostModel>,
    ledger: Arc<CostLedger>,
    mock: bool,
}

impl Services {
    fn open(project_dir: &Path, data_dir: Option<PathBuf>, mock: bool) -> Result<Self> {
        let mut settings = Settings::load_validated(project_dir)?;
        if data_dir.is_some() {
            settings.feedback.dir = data_dir;
        }

        let pricing = settings.pricing.clone();
        let rates: Arc<dyn ExchangeRateProvider> = if mock {
            Arc::new(FixedRate::new(pricing.fallback_rate))
        } else {
            let source = OpenErApi::new(&pricing.rate_url, &pricing.currency)?;
            Arc::new(CachedExchangeRate::new(
                Arc::new(source),
                Duration::from_secs(pricing.rate_ttl_secs),
                pricing.fallback_rate,
            ))
        };

        Ok(Self {
            feedback: Arc::new(FeedbackStore::open(settings.feedback.clone())?),
            costs: Arc::new(CostModel::new(pricing, rates)),
            ledger: Arc::new(CostLedger::new(project_dir)?),
            settings,
            mock,
        })
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.settings.retry.clone())
    }

    fn image_engine(&self, kind: EngineKind) -> Result<Arc<dyn ImageEngine>> {
        if self.mock {
            return Ok(Arc::new(mock_image_engine(kind)));
        }
        let engines = &self.settings.engines;
        Ok(match kind {
            EngineKind::Flux => Arc::new(ReplicateFluxEngine::new(
                engines,
                std::env::var(&engines.replicate_token_env).ok(),
            )?),
            EngineKind::Google => Arc::new(GeminiImageEngine::new(
                engines,
                std::env::var(&engines.google_api_key_env).ok(),
            )?),
        })
    }

    fn selector(&self) -> Result<EngineSelector> {
        let engines = &self.settings.engines;
        let primary = EngineKind::parse(&engines.primary).ok_or_else(|| SlidegenError::InvalidConfig {
            field: "engines.primary".to_string(),
            reason: format!("unknown engine '{}'", engines.primary),
        })?;
        let mut builder = EngineSelector::builder()
            .primary(self.image_engine(primary)?)
            .retry(self.retry_policy())
            .fallback(if engines.fallback {
                FallbackConfig::default()
            } else {
                FallbackConfig::disabled()
            })
            .cost_model(self.costs.clone());
        match EngineKind::parse(&engines.secondary) {
            Some(secondary) if secondary != primary => {
                builder = builder.secondary(self.image_engine(secondary)?);
            }
            _ => {}
        }
        builder.build()
    }

    fn pipeline(&self) -> Result<Arc<GenerationPipeline>> {
        Ok(Arc::new(GenerationPipeline::new(
            Arc::new(self.selector()?),
            self.feedback.clone(),
        )))
    }

    /// Text assistant; `mock_response` is the canned answer in mock mode.
    fn assistant(&self, mock_response: impl FnOnce() -> String) -> Result<TextAssistant> {
        let text: Arc<dyn TextEngine> = if self.mock {
            Arc::new(MockTextEngine::new().with_response(mock_response()))
        } else {
            let engines = &self.settings.engines;
            Arc::new(GeminiTextEngine::new(
                engines,
                std::env::var(&engines.google_api_key_env).ok(),
            )?)
        };
        Ok(TextAssistant::new(
            text,
            self.retry_policy(),
            self.feedback.clone(),
            self.costs.clone(),
            self.ledger.clone(),
        )
        .with_inter_item_delay(Duration::from_millis(
            self.settings.batch.inter_item_delay_ms,
        )))
    }
}

/// Offline engine; prompt markers script failures for rehearsing recovery.
fn mock_image_engine(kind: EngineKind) -> MockImageEngine {
    let engine = MockImageEngine::new(format!("mock-{kind}"), kind)
        .with_image_to_image(kind == EngineKind::Google)
        .with_prompt_failure(
            "[mock:quota]",
            EngineError::new(FailureKind::DailyQuota, "quota exceeded per day"),
        )
        .with_prompt_failure(
            "[mock:permission]",
            EngineError::new(FailureKind::PermissionDenied, "PERMISSION_DENIED"),
        )
        .with_prompt_failure("[mock:reject]", EngineError::rejected("content refused"));
    match kind {
        EngineKind::Flux => engine.with_prompt_failure(
            "[mock:offline]",
            EngineError::unavailable("connection refused"),
        ),
        EngineKind::Google => engine,
    }
}

fn mock_draft_response(topic: &str, count: usize) -> String {
    let slides: Vec<_> = (1..=count)
        .map(|n| {
            json!({
                "title": format!("{topic} part {n}"),
                "content": format!("Key point {n} about {topic}"),
                "prompt": format!("3D illustration of {topic}, scene {n}"),
            })
        })
        .collect();
    json!(slides).to_string()
}

// =============================================================================
// Plans
// =============================================================================

fn ensure_writable(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        return Err(SlidegenError::invalid_input(
            "out",
            format!("{} already exists (use --force to overwrite)", out.display()),
        ));
    }
    Ok(())
}

fn print_plan(batch: &BatchRun, out: &Path) {
    println!(
        "{} Drafted {} items for '{}' ({})",
        "Plan:".cyan().bold(),
        batch.items().len(),
        batch.topic,
        batch.scope
    );
    for item in batch.items() {
        let marker = if item.is_optimized { "*" } else { " " };
        println!("  {marker}#{:<3} {}", item.id, item.title);
    }
    println!("   Written to {}", out.display());
}

fn load_plan(path: &Path) -> Result<BatchRun> {
    let mut batch = BatchRun::load(path).map_err(|e| {
        SlidegenError::invalid_input("plan", format!("{}: {e}", path.display()))
    })?;
    let touched = batch.recover_interrupted();
    if !touched.is_empty() {
        warn!(items = ?touched, "Recovered items interrupted by a previous run");
    }
    Ok(batch)
}

async fn run_plan(services: &Services, plan: &Path) -> Result<i32> {
    let mut batch = load_plan(plan)?;
    let remaining = batch.items().len() - batch.count(ItemStatus::Completed);

    let (tx, rx) = mpsc::unbounded_channel();
    let ledger = services.ledger.clone();
    let plan_path = plan.to_path_buf();
    let runner = BatchRunner::new(
        services.pipeline()?,
        services.ledger.clone(),
        &services.settings.batch,
    )
    .with_events(tx)
    .with_checkpoint(move |batch: &BatchRun| {
        batch.save(&plan_path)?;
        ledger.save()?;
        Ok(())
    });

    let token = batch.pause_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{} Pause requested, finishing the current item",
                "Pausing:".yellow().bold()
            );
            token.pause();
        }
    });
    let progress = tokio::spawn(render_progress(rx, remaining as u64));

    let result = runner.run(&mut batch).await;
    drop(runner);
    ctrl_c.abort();
    let _ = progress.await;

    batch.save(plan)?;
    services.ledger.save()?;
    let report = result?;

    println!(
        "{} {} - {} completed, {} failed, {} skipped",
        "Batch:".cyan().bold(),
        report.status,
        report.completed.len(),
        report.failed.len(),
        report.skipped.len()
    );
    println!(
        "   Cost: {} {} (batch total {})",
        report.cost_added,
        services.costs.pricing().currency,
        batch.accrued_cost()
    );
    info!(plan = %plan.display(), "Plan saved");

    Ok(match &report.halt {
        Some(HaltReason::Fatal {
            item,
            class,
            message,
        }) => {
            eprintln!(
                "{} Halted at item #{item}: {class} - {message}",
                "Fatal:".red().bold()
            );
            eprintln!("   {}", class.guidance());
            3
        }
        Some(HaltReason::Paused) => {
            println!("   Paused; run again to resume");
            0
        }
        None if !report.failed.is_empty() => 1,
        None => 0,
    })
}

async fn render_progress(mut rx: mpsc::UnboundedReceiver<BatchEvent>, total: u64) {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░ "),
    );

    while let Some(event) = rx.recv().await {
        match event {
            BatchEvent::ItemStarted(item) => {
                pb.set_message(format!("#{} {}", item.id, item.title));
            }
            BatchEvent::ItemCompleted { item, unit_cost } => {
                pb.inc(1);
                let uri = item.artifact.as_ref().map_or("", |a| a.uri.as_str());
                pb.println(format!(
                    "{} #{} {} (+{unit_cost})",
                    "✓".green().bold(),
                    item.id,
                    truncate_uri(uri)
                ));
            }
            BatchEvent::ItemFailed { item, class } => {
                pb.inc(1);
                pb.println(format!("{} #{} {class}", "✗".red().bold(), item.id));
            }
            BatchEvent::Halted(_) => {}
            BatchEvent::Finished(_) => pb.finish_and_clear(),
        }
    }
}

fn print_optimize_report(report: &slidegen::OptimizeReport) -> i32 {
    println!(
        "{} {} optimized, {} failed, {} already optimized",
        "Optimize:".cyan().bold(),
        report.optimized.len(),
        report.failed.len(),
        report.skipped.len()
    );
    match &report.halt {
        Some(HaltReason::Fatal { item, class, .. }) => {
            eprintln!("{} Halted at item #{item}: {class}", "Fatal:".red().bold());
            eprintln!("   {}", class.guidance());
            3
        }
        Some(HaltReason::Paused) => 0,
        None if !report.failed.is_empty() => 1,
        None => 0,
    }
}

/// Data URIs are long; show only their head.
fn truncate_uri(uri: &str) -> String {
    if uri.starts_with("data:") && uri.len() > 48 {
        format!("{}…", uri.chars().take(48).collect::<String>())
    } else {
        uri.to_string()
    }
}
