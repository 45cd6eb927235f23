//! # DocChat CLI (`docchat`)
//!
//! Command-line interface for the document-chat engine. Covers database
//! setup, local ingestion, chat and summaries, account administration, and
//! starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite database and run schema migrations |
//! | `docchat ingest <file>` | Ingest a local document |
//! | `docchat ask <doc-id> "<question>"` | Ask a question about a document |
//! | `docchat summarize <doc-id>` | Summarize a document |
//! | `docchat account create <user>` | Create an account |
//! | `docchat credits grant <user> <amount>` | Add credits to an account |
//! | `docchat credits show <user>` | Show plan and balance |
//! | `docchat serve` | Start the HTTP server |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docchat::cache::SummaryCache;
use docchat::chat;
use docchat::completion::select_provider;
use docchat::config::{self, Config};
use docchat::db;
use docchat::embedding::create_embedder;
use docchat::ingest::{self, IngestDeps, Upload};
use docchat::ledger::{self, Plan};
use docchat::migrate;
use docchat::ocr::HttpOcrClient;
use docchat::server;

/// DocChat — chat with your documents.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "DocChat — upload documents and chat with them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Ingest a local document.
    ///
    /// Runs the full pipeline: format detection, extraction (with OCR
    /// fallback for scanned PDFs), chunking, and embedding. Prints the
    /// document id on success.
    Ingest {
        /// Path to the document file.
        file: PathBuf,

        /// Account to ingest under. Created with the free plan if missing.
        #[arg(long, default_value = "local")]
        user: String,

        /// Override the content type; by default it is guessed from the
        /// file extension.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Ask a question about an ingested document.
    Ask {
        /// Document id.
        document_id: String,

        /// The question.
        question: String,

        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Summarize an ingested document.
    Summarize {
        /// Document id.
        document_id: String,

        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Manage accounts.
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Manage credit balances.
    Credits {
        #[command(subcommand)]
        action: CreditsAction,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum AccountAction {
    /// Create an account (no-op if it already exists).
    Create {
        user: String,

        /// Plan: free, basic, pro, or elite.
        #[arg(long, default_value = "free")]
        plan: String,
    },

    /// Change an account's plan.
    SetPlan { user: String, plan: String },

    /// Set the account's API bearer token.
    SetToken { user: String, token: String },
}

#[derive(Subcommand)]
enum CreditsAction {
    /// Add credits to an account.
    Grant { user: String, amount: i64 },

    /// Show an account's plan and balance.
    Show { user: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            user,
            content_type,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            ledger::ensure_account(&pool, &user, Plan::Free).await?;

            let bytes = std::fs::read(&file)?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let content_type = content_type.unwrap_or_default();

            let deps = build_deps(&cfg)?;
            let doc = ingest::ingest_document(
                &pool,
                &cfg,
                &deps,
                Upload {
                    user_id: user,
                    filename,
                    content_type,
                    bytes,
                },
            )
            .await?;
            println!(
                "Ingested {} ({} pages{}): {}",
                doc.title,
                doc.page_count,
                if doc.used_ocr { ", OCR" } else { "" },
                doc.id
            );
        }
        Commands::Ask {
            document_id,
            question,
            user,
        } => {
            let pool = db::connect(&cfg).await?;
            let embedder = create_embedder(&cfg.embedding)?;
            let provider = select_provider(&cfg.completion)?;

            let answer = chat::ask(
                &pool,
                &cfg,
                embedder.as_ref(),
                provider,
                &user,
                &document_id,
                &question,
            )
            .await?;
            println!("{}", answer.text);
        }
        Commands::Summarize { document_id, user } => {
            let pool = db::connect(&cfg).await?;
            let provider = select_provider(&cfg.completion)?;
            let cache = SummaryCache::new(
                cfg.cache.capacity,
                std::time::Duration::from_secs(cfg.cache.ttl_secs),
            );

            let summary =
                chat::summarize(&pool, &cfg, provider, &cache, &user, &document_id).await?;
            println!("{}", summary.text);
        }
        Commands::Account { action } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            match action {
                AccountAction::Create { user, plan } => {
                    let plan = parse_plan(&plan)?;
                    ledger::ensure_account(&pool, &user, plan).await?;
                    println!("Account '{}' ready ({} plan).", user, plan.as_str());
                }
                AccountAction::SetPlan { user, plan } => {
                    let plan = parse_plan(&plan)?;
                    ledger::set_plan(&pool, &user, plan).await?;
                    println!("Account '{}' moved to {} plan.", user, plan.as_str());
                }
                AccountAction::SetToken { user, token } => {
                    ledger::set_api_token(&pool, &user, &token).await?;
                    println!("Token set for '{}'.", user);
                }
            }
        }
        Commands::Credits { action } => {
            let pool = db::connect(&cfg).await?;
            match action {
                CreditsAction::Grant { user, amount } => {
                    let balance = ledger::grant_credits(&pool, &user, amount).await?;
                    println!("Granted {} credits to '{}'; balance is {}.", amount, user, balance);
                }
                CreditsAction::Show { user } => match ledger::get_account(&pool, &user).await? {
                    Some(account) => println!(
                        "{}: {} plan, {} credits",
                        account.user_id,
                        account.plan.as_str(),
                        account.credits
                    ),
                    None => println!("No account named '{}'.", user),
                },
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

fn build_deps(cfg: &Config) -> anyhow::Result<IngestDeps> {
    let embedder = if cfg.embedding.is_enabled() {
        Some(create_embedder(&cfg.embedding)?)
    } else {
        None
    };
    let ocr = HttpOcrClient::from_config(&cfg.ocr)
        .ok()
        .map(|c| Arc::new(c) as Arc<dyn docchat::ocr::OcrClient>);
    Ok(IngestDeps { embedder, ocr })
}

fn parse_plan(s: &str) -> anyhow::Result<Plan> {
    Plan::parse(s).ok_or_else(|| anyhow::anyhow!("unknown plan '{}'; use free, basic, pro, or elite", s))
}
