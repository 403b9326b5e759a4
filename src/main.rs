//! Memoria chat loop
//!
//! Reads user turns from stdin and prints replies. Logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memoria_lib::config::{ENV_API_KEY, ENV_FALLBACK_API_KEY};
use memoria_lib::{
    estimator_for, AppConfig, ChatClient, CompactionOutcome, JsonFileStore, KnowledgeRecord, SessionController, SessionId,
};

const HELP: &str = "\
Commands:
  /new       start a new session
  /context   show what the next request would carry
  /compact   summarize old history now
  /knowledge show facts collected from replies
  /help      show this help
  exit, quit leave";

#[derive(Parser)]
#[command(name = "memoria")]
#[command(about = "Chat with a token-budgeted memory", long_about = None)]
struct Args {
    /// Resume a session (with or without the sess_ prefix)
    #[arg(long)]
    session: Option<String>,
    /// Print replies only once complete
    #[arg(long)]
    no_stream: bool,
    /// Token budget for this run
    #[arg(long)]
    budget: Option<u32>,
}

fn describe(outcome: &CompactionOutcome) -> String {
    match outcome {
        CompactionOutcome::Skipped => "Nothing to compact".to_string(),
        CompactionOutcome::Compacted { removed, freed_tokens, .. } => {
            format!("Summarized {} messages, freed {} tokens", removed.len(), freed_tokens)
        }
        CompactionOutcome::Failed { reason } => format!("Compaction failed: {}", reason),
    }
}

fn describe_knowledge(record: Option<KnowledgeRecord>) -> String {
    match record {
        Some(record) if !record.is_empty() => format!(
            "Entities: {}\nKeywords: {}\nSummary: {}",
            record.entities.join(", "),
            record.keywords.join(", "),
            record.summary
        ),
        _ => "Nothing collected yet".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "memoria=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load().context("Failed to load configuration")?;
    if let Some(budget) = args.budget {
        config.memory.budget = budget;
        config.memory.validate()?;
    }
    if config.remote.api_key.is_none() {
        warn!("No API key set; export {} or {}", ENV_API_KEY, ENV_FALLBACK_API_KEY);
    }

    let store = Arc::new(JsonFileStore::open(config.sessions_root()?)?);
    let model = Arc::new(ChatClient::new(&config.remote)?);
    let estimator = estimator_for(config.memory.estimator);
    let controller = SessionController::new(config.memory.clone(), store, model, estimator);

    let mut session_id = match &args.session {
        Some(raw) => {
            let id = SessionId::parse(raw)?;
            let session = controller.resume_session(&id)?;
            println!("Resumed \"{}\" ({})", session.title, id);
            id
        }
        None => {
            let id = controller.start_session("")?;
            println!("New session {}", id);
            id
        }
    };
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            "" => continue,
            "exit" | "quit" => break,
            "/help" => println!("{}", HELP),
            "/new" => {
                controller.end_session(&session_id)?;
                session_id = controller.start_session("")?;
                println!("New session {}", session_id);
            }
            "/context" => {
                let context = controller.preview_context(&session_id, None)?;
                let status = context.status();
                println!(
                    "{}/{} tokens ({}%), {} messages, {} dropped, {} pinned tokens, status {:?}",
                    status.used,
                    status.budget,
                    status.usage_percentage,
                    status.messages,
                    status.dropped,
                    status.important_used,
                    status.threshold_status
                );
            }
            "/knowledge" => match controller.store().get_knowledge(&session_id) {
                Ok(record) => println!("{}", describe_knowledge(record)),
                Err(e) => eprintln!("Error: {}", e),
            },
            "/compact" => match controller.compact_now(&session_id).await {
                Ok(outcome) => println!("{}", describe(&outcome)),
                Err(e) => eprintln!("Error: {}", e),
            },
            text => {
                let result = if args.no_stream {
                    controller.submit_turn(&session_id, text).await.map(|outcome| {
                        println!("{}", outcome.reply());
                        outcome
                    })
                } else {
                    let result = controller
                        .submit_turn_streaming(&session_id, text, |delta| {
                            print!("{}", delta);
                            let _ = std::io::stdout().flush();
                        })
                        .await;
                    println!();
                    result
                };
                if let Err(e) = result {
                    eprintln!("Error: {}", e);
                }
            }
        }
    }

    controller.end_session(&session_id)?;
    Ok(())
}
