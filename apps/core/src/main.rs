// PubMed Insight CLI
// Thin command-line front end over the core library.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pubmed_insight_core::config::{build_keyword_engine, build_manager, ServiceSettings};
use pubmed_insight_core::keywords::ExtractionOptions;
use pubmed_insight_core::models::{AnalysisOptions, GenerationOptions, Language, LiteratureItem};

#[derive(Parser)]
#[command(name = "pubmed-insight", version, about = "Keyword extraction and AI analysis for PubMed result sets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rank keywords of a JSON file holding literature items or plain strings
    Keywords {
        file: PathBuf,
        #[arg(long, default_value_t = 0.35)]
        top_percentage: f64,
        #[arg(long, default_value_t = 3)]
        min_word_length: usize,
    },
    /// Run a connection test against a registered model
    Test { model: String },
    /// Generate text with a registered model
    Generate { model: String, prompt: String },
    /// Analyze a JSON file of literature items
    Analyze {
        model: String,
        file: PathBuf,
        #[arg(long, default_value = "zh")]
        language: String,
    },
    /// Print the seeded stopword list
    Stopwords,
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PUBMED_INSIGHT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Accepts either `[LiteratureItem]` or `[String]`.
fn read_documents(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    if let Ok(items) = serde_json::from_str::<Vec<LiteratureItem>>(&raw) {
        if items.iter().any(|item| !item.to_document().is_empty()) {
            return Ok(items.iter().map(LiteratureItem::to_document).collect());
        }
    }
    serde_json::from_str::<Vec<String>>(&raw)
        .with_context(|| format!("{} is neither a list of items nor of strings", path.display()))
}

fn read_items(path: &Path) -> Result<Vec<LiteratureItem>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid literature items in {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();

    let settings = ServiceSettings::from_env()?;
    info!("Starting pubmed-insight");

    match cli.command {
        Command::Keywords {
            file,
            top_percentage,
            min_word_length,
        } => {
            let documents = read_documents(&file)?;
            let options = ExtractionOptions {
                top_percentage,
                min_word_length,
                ..ExtractionOptions::default()
            };
            let engine = build_keyword_engine(&settings);
            let keywords = engine.extract_keywords(&documents, &options)?;
            let stats = engine.corpus_stats(&documents, &options);
            print_json(&json!({ "keywords": keywords, "stats": stats }))?;
        }
        Command::Test { model } => {
            let manager = build_manager(&settings).await;
            let result = manager.test_model_connection(&model, None).await;
            print_json(&result)?;
            if !result.success {
                bail!("connection test failed");
            }
        }
        Command::Generate { model, prompt } => {
            let manager = build_manager(&settings).await;
            ensure_available(&manager, &model).await?;
            let result = manager
                .generate_text(&prompt, &GenerationOptions::for_model(&model))
                .await?;
            print_json(&result)?;
        }
        Command::Analyze {
            model,
            file,
            language,
        } => {
            let language: Language = language.parse().map_err(anyhow::Error::msg)?;
            let items = read_items(&file)?;
            let manager = build_manager(&settings).await;
            ensure_available(&manager, &model).await?;
            let result = manager
                .batch_analyze(&items, &AnalysisOptions::for_model(&model, language))
                .await?;
            print_json(&result)?;
        }
        Command::Stopwords => {
            let engine = build_keyword_engine(&settings);
            print_json(&engine.stopwords())?;
        }
    }
    Ok(())
}

/// Models start unavailable; a one-shot CLI call tests the connection first.
async fn ensure_available(
    manager: &pubmed_insight_core::AiServiceManager,
    model: &str,
) -> Result<()> {
    let result = manager.test_model_connection(model, None).await;
    if !result.success {
        bail!("{}", result.message);
    }
    Ok(())
}
