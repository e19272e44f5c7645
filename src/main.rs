//! Membank CLI - record, search, and maintain interaction memory

use clap::{Parser, Subcommand};
use membank::{MemoryStore, NewEntry, StoreConfig};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "membank")]
#[command(version = "0.1.0")]
#[command(about = "Configurable interaction memory store")]
#[command(long_about = r#"
Membank records agent/task/response interactions and serves them back:
  • Ranked free-text retrieval over past interactions
  • Conversation thread reconstruction via parent links
  • Rolling per-model performance analytics
  • PostgreSQL backend with a flat-file fallback

Example usage:
  membank add --agent GPT-4 --task "Analyze Q3 sales data" --response "Revenue grew 12%" --rating 5
  membank query --text "Q3 sales" --limit 5
  membank stats
"#)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = "membank.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one interaction
    Add {
        /// Agent that produced the interaction
        #[arg(short, long)]
        agent: String,

        /// The task the agent was given
        #[arg(short, long)]
        task: String,

        /// The agent's response
        #[arg(short, long)]
        response: String,

        /// Success rating from 1 (failure) to 5 (success)
        #[arg(short = 'R', long)]
        rating: u8,

        /// Model that produced the response
        #[arg(short, long)]
        model: Option<String>,

        /// Tokens consumed by the interaction
        #[arg(long, default_value = "0")]
        tokens: u32,

        /// Id of the entry this one replies to
        #[arg(short, long)]
        parent: Option<i64>,
    },

    /// Search past interactions
    Query {
        /// Free-text query
        #[arg(short, long)]
        text: String,

        /// Maximum number of results
        #[arg(short, long, default_value = "5")]
        limit: usize,

        /// Drop results scoring below this relevance
        #[arg(short, long, default_value = "0.1")]
        min_relevance: f64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show store statistics
    Stats,

    /// Show per-model performance analytics
    Models,

    /// Reconstruct the conversation thread containing an entry
    Thread {
        /// Entry id to start from
        #[arg(short, long)]
        id: i64,

        /// Maximum thread length
        #[arg(short, long, default_value = "10")]
        depth: usize,
    },

    /// Remove entries that are both old and poorly rated
    Cleanup {
        /// Only entries older than this many days qualify
        #[arg(long, default_value = "90")]
        days_old: u32,

        /// Only entries rated below this qualify
        #[arg(long, default_value = "2")]
        min_rating: u8,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = if cli.config.exists() {
        StoreConfig::from_file(&cli.config)?
    } else {
        StoreConfig::default()
    };

    let store = MemoryStore::open(config).await?;
    if store.is_degraded() {
        println!("⚠️  Relational backend unreachable, using the fallback store");
    }

    match cli.command {
        Commands::Add {
            agent,
            task,
            response,
            rating,
            model,
            tokens,
            parent,
        } => {
            let mut new = NewEntry::new(agent, task, response, rating).with_tokens(tokens);
            if let Some(model) = model {
                new = new.with_model(model);
            }
            if let Some(parent) = parent {
                new = new.with_parent(parent);
            }
            let id = store.add_entry(new).await?;
            println!("✅ Recorded entry {}", id);
        }

        Commands::Query {
            text,
            limit,
            min_relevance,
            format,
        } => {
            let results = store.query(&text, limit, min_relevance).await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("🔍 {} result(s) for \"{}\"", results.len(), text);
                for scored in &results {
                    println!(
                        "  [{:.3}] #{} {}: {}",
                        scored.relevance, scored.entry.id, scored.entry.task, scored.entry.response
                    );
                }
            }
        }

        Commands::Stats => {
            let snapshot = store.stats().await?;
            println!("📊 Entries: {}", snapshot.total_entries);
            println!("⭐ Average rating: {:.2}", snapshot.avg_success_rating);
            println!("🔢 Tokens used: {}", snapshot.total_tokens_used);
            println!(
                "🏆 Top model: {}",
                snapshot.top_model.as_deref().unwrap_or("none")
            );
            for model in &snapshot.per_model {
                println!(
                    "   {}: {} entries, {:.2} avg rating, {} tokens",
                    model.model, model.entries, model.avg_rating, model.tokens_used
                );
            }
            if let (Some(oldest), Some(newest)) = (snapshot.oldest, snapshot.newest) {
                println!(
                    "🗓  Range: {} to {}",
                    oldest.format("%Y-%m-%d"),
                    newest.format("%Y-%m-%d")
                );
            }
        }

        Commands::Models => {
            let perf = store.model_performance().await?;
            println!("🤖 Models seen: {}", perf.total_models);
            println!(
                "🏆 Top model: {}",
                perf.top_model.as_deref().unwrap_or("none")
            );
            println!("⭐ Average rating: {:.2}", perf.avg_rating);
            println!("📈 Total interactions: {}", perf.total_usage);
        }

        Commands::Thread { id, depth } => {
            let thread = store.thread(id, depth).await?;
            if thread.is_empty() {
                println!("🧵 No thread found for entry {}", id);
            } else {
                println!("🧵 Thread of {} entr{}", thread.len(), plural(thread.len() as u64));
                for entry in &thread {
                    println!("  #{} [{}] {}", entry.id, entry.agent_name, entry.task);
                }
            }
        }

        Commands::Cleanup {
            days_old,
            min_rating,
        } => {
            let removed = store.cleanup(days_old, min_rating).await?;
            println!("🧹 Removed {} entr{}", removed, plural(removed));
        }
    }

    Ok(())
}

fn plural(count: u64) -> &'static str {
    if count == 1 { "y" } else { "ies" }
}
