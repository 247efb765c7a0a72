use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sigcom_recon::config::EnrichmentConfig;
use sigcom_recon::ledger::{key_entity_id, Ledger, ENTITY_KEY};
use sigcom_recon::{
    load_source, schema_for, ClassificationWorkflow, ColumnKey, ConsolePrompter, EnrichmentCache,
    EnrichmentStore, FileStore, MemoryStore, PayrollWorkflow, PipelineConfig, Population,
    Prompter, ScriptedPrompter,
};

#[derive(Debug, Parser)]
#[command(name = "sigcom-recon", version, about = "Record reconciliation and operator-assisted enrichment")]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, default_value = "pipeline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consolidate statutory and fee-based payroll into one row per person
    Payroll,

    /// Fill a classification column, asking once per unknown key
    Enrich {
        /// Name of the [[enrichment]] section
        name: String,

        /// Keep checkpoint and ledger untouched; print the result instead of writing it
        #[arg(long)]
        dry_run: bool,

        /// Read answers from a file (one per line) instead of the terminal
        #[arg(long)]
        answers: Option<PathBuf>,
    },

    /// Inspect or reopen saved answers
    Mappings {
        name: String,

        /// Forget the answer for this key so the next run asks again
        #[arg(long, conflicts_with = "history")]
        reopen: Option<String>,

        /// Show the answer history of this key
        #[arg(long)]
        history: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sigcom_recon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_file(&cli.config)?;

    match cli.command {
        Command::Payroll => run_payroll(&config),
        Command::Enrich {
            name,
            dry_run,
            answers,
        } => run_enrich(config.enrichment(&name)?, dry_run, answers),
        Command::Mappings {
            name,
            reopen,
            history,
        } => run_mappings(config.enrichment(&name)?, reopen, history),
    }
}

fn run_payroll(config: &PipelineConfig) -> Result<()> {
    let payroll = config.payroll()?;

    println!("🧾 Payroll consolidation");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Loading extracts...");
    let statutory = Population::load(&payroll.statutory)?;
    let fee_based = Population::load(&payroll.fee_based)?;
    println!(
        "✓ {} statutory rows, {} fee-based rows",
        statutory.records.len(),
        fee_based.records.len()
    );

    println!("\n🔍 Resolving duplicated values...");
    let workflow = PayrollWorkflow::from_config(payroll)?;
    let outcome = workflow.run(statutory, fee_based)?;
    for report in outcome.round_one.iter().chain(outcome.round_two.iter()) {
        println!("✓ {}", report.summary());
    }
    println!("✓ {}", outcome.conservation.summary());

    println!("\n💾 Writing {}...", payroll.output.display());
    outcome.records.write_csv(&payroll.output)?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ {} people, one row each", outcome.records.len());
    Ok(())
}

fn run_enrich(config: &EnrichmentConfig, dry_run: bool, answers: Option<PathBuf>) -> Result<()> {
    let mut prompter: Box<dyn Prompter> = match &answers {
        Some(path) => Box::new(ScriptedPrompter::from_file(path)?),
        None => Box::new(ConsolePrompter::stdio()),
    };

    if dry_run {
        // Start from known answers without writing anything back
        let known = if config.ledger.exists() {
            Ledger::open(&config.ledger)?.mapping(&config.name)?
        } else {
            Default::default()
        };
        enrich_with(config, MemoryStore::seeded(known), prompter.as_mut(), true)
    } else {
        let store = FileStore::open(&config.checkpoint, &config.ledger, &config.name)?;
        enrich_with(config, store, prompter.as_mut(), false)
    }
}

fn enrich_with<S: EnrichmentStore>(
    config: &EnrichmentConfig,
    store: S,
    prompter: &mut dyn Prompter,
    dry_run: bool,
) -> Result<()> {
    println!("🏷️  Enrichment '{}' → {}", config.name, config.target);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let input = load_source(&config.input)?;
    println!("✓ Loaded {} rows", input.len());

    let mut workflow = ClassificationWorkflow::from_config(config, store)?;
    let outcome = workflow.run(&input, prompter)?;
    if !outcome.prefill_misses.is_empty() {
        println!("✓ {} values not in the prefill table", outcome.prefill_misses.len());
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ {}", outcome.summary.summary());

    if dry_run {
        outcome.records.write_to(io::stdout())?;
    } else {
        outcome.records.write_csv(&config.output)?;
        println!("💾 Wrote {}", config.output.display());
    }
    Ok(())
}

fn run_mappings(config: &EnrichmentConfig, reopen: Option<String>, history: Option<String>) -> Result<()> {
    if let Some(key) = reopen {
        let store = FileStore::open(&config.checkpoint, &config.ledger, &config.name)?;
        let mut cache = EnrichmentCache::new(store, config.target.clone());
        let extractor =
            ColumnKey::new(config.key.iter().cloned()).with_separator(config.key_separator.clone());
        let outcome = cache.reopen(&schema_for(&config.input), &extractor, &key)?;

        match outcome.previous_code {
            Some(code) => println!("✅ Reopened '{}' (was {}), {} rows cleared", key, code, outcome.rows_cleared),
            None => println!("⚠️  '{}' had no saved answer, {} rows cleared", key, outcome.rows_cleared),
        }
        return Ok(());
    }

    let ledger = Ledger::open(&config.ledger)?;

    if let Some(key) = history {
        let events = ledger.events_for(ENTITY_KEY, &key_entity_id(&config.name, &key))?;
        println!("📜 History of '{}' ({} events)", key, events.len());
        for event in events {
            println!(
                "   {}  {:<18} {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.event_type,
                event.data
            );
        }
        return Ok(());
    }

    let entries = ledger.entries(&config.name)?;
    println!("📒 {} saved answers for '{}'", entries.len(), config.name);
    for entry in entries {
        println!(
            "   {:<40} → {:<10} (rev {}, {})",
            entry.natural_key,
            entry.code,
            entry.revision,
            entry.resolved_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}
