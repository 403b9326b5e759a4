//! Memoria CLI
//!
//! Inspection commands for stored sessions, context assembly and token
//! counting. Every command prints one JSON document on stdout.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memoria_lib::{
    estimator_for, AppConfig, ChatClient, ContextPreview, JsonFileStore, KnowledgeRecord, Message, MessageQuery,
    SessionController, SessionId, StyleRecord, TokenEstimator,
};

#[derive(Parser)]
#[command(name = "memoria-cli")]
#[command(about = "Memoria CLI - inspect sessions and context budgets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Session inspection commands
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Context assembly commands
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },
    /// Token counting commands
    Tokens {
        #[command(subcommand)]
        action: TokensAction,
    },
    /// Compaction commands
    Compress {
        #[command(subcommand)]
        action: CompressAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List all sessions
    List,
    /// Show a session with its messages, style records and knowledge
    Show {
        /// Session ID (with or without sess_ prefix)
        session_id: String,
    },
}

#[derive(Subcommand)]
enum ContextAction {
    /// Show the context the next turn would send
    Preview {
        /// Session ID (with or without sess_ prefix)
        session_id: String,
        /// Token budget (default: configured budget)
        #[arg(short, long)]
        budget: Option<u32>,
    },
}

#[derive(Subcommand)]
enum TokensAction {
    /// Count tokens in text
    Count {
        /// Text to count (or - to read from stdin)
        text: String,
    },
}

#[derive(Subcommand)]
enum CompressAction {
    /// List what the next compaction would summarize
    Suggest {
        /// Session ID (with or without sess_ prefix)
        session_id: String,
    },
}

// ============ Output Types ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionListItem {
    id: String,
    title: String,
    created: String,
    messages: usize,
    important: usize,
}

#[derive(Serialize)]
struct SessionShowOutput {
    id: String,
    title: String,
    created: String,
    messages: Vec<Message>,
    styles: Vec<StyleRecord>,
    knowledge: Option<KnowledgeRecord>,
}

#[derive(Serialize)]
struct TokenCountOutput {
    tokens: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompressSuggestOutput {
    candidates: Vec<u64>,
    tokens_freeable: u32,
    needs_compaction: bool,
    budget_status: String,
}

#[derive(Serialize)]
struct ErrorOutput {
    error: String,
}

type CliResult = Result<String, Box<dyn std::error::Error>>;

// ============ Main ============

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "memoria=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = open().and_then(|(controller, estimator)| match cli.command {
        Commands::Session { action } => handle_session(&controller, action),
        Commands::Context { action } => handle_context(&controller, action),
        Commands::Tokens { action } => handle_tokens(estimator.as_ref(), action),
        Commands::Compress { action } => handle_compress(&controller, estimator.as_ref(), action),
    });

    match result {
        Ok(json) => println!("{}", json),
        Err(e) => {
            let error = ErrorOutput { error: e.to_string() };
            match serde_json::to_string(&error) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{{\"error\": \"unknown\"}}"),
            }
            std::process::exit(1);
        }
    }
}

fn open() -> Result<(SessionController, Arc<dyn TokenEstimator>), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let store = Arc::new(JsonFileStore::open(config.sessions_root()?)?);
    let model = Arc::new(ChatClient::new(&config.remote)?);
    let estimator = estimator_for(config.memory.estimator);
    let controller = SessionController::new(config.memory, store, model, estimator.clone());
    Ok((controller, estimator))
}

// ============ Handlers ============

fn handle_session(controller: &SessionController, action: SessionAction) -> CliResult {
    let store = controller.store();
    match action {
        SessionAction::List => {
            let sessions = store.list_sessions()?;

            let mut items = Vec::with_capacity(sessions.len());
            for s in sessions {
                items.push(SessionListItem {
                    messages: store.count_messages(&s.id, &MessageQuery::all())?,
                    important: store.count_messages(&s.id, &MessageQuery::important())?,
                    id: s.id.to_string(),
                    title: s.title,
                    created: s.created_at.to_rfc3339(),
                });
            }

            Ok(serde_json::to_string(&items)?)
        }

        SessionAction::Show { session_id } => {
            let id = SessionId::parse(&session_id)?;
            let session = store.get_session(&id)?;
            let messages = store.list_messages(&id, &MessageQuery::all())?;

            let mut styles = Vec::new();
            for message in &messages {
                if let Some(style) = store.get_style(&id, message.id)? {
                    styles.push(style);
                }
            }

            let output = SessionShowOutput {
                id: session.id.to_string(),
                title: session.title,
                created: session.created_at.to_rfc3339(),
                messages,
                styles,
                knowledge: store.get_knowledge(&id)?,
            };

            Ok(serde_json::to_string(&output)?)
        }
    }
}

fn handle_context(controller: &SessionController, action: ContextAction) -> CliResult {
    match action {
        ContextAction::Preview { session_id, budget } => {
            let id = SessionId::parse(&session_id)?;
            let context = controller.preview_context(&id, budget)?;
            Ok(serde_json::to_string(&ContextPreview::new(id, context))?)
        }
    }
}

fn handle_tokens(estimator: &dyn TokenEstimator, action: TokensAction) -> CliResult {
    match action {
        TokensAction::Count { text } => {
            let input = if text == "-" {
                // Read from stdin
                use std::io::Read;
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer
            } else {
                text
            };

            let output = TokenCountOutput {
                tokens: estimator.estimate(&input),
            };

            Ok(serde_json::to_string(&output)?)
        }
    }
}

fn handle_compress(controller: &SessionController, estimator: &dyn TokenEstimator, action: CompressAction) -> CliResult {
    match action {
        CompressAction::Suggest { session_id } => {
            let id = SessionId::parse(&session_id)?;
            let context = controller.preview_context(&id, None)?;
            let candidates = controller.compaction_candidates(&id)?;

            let output = CompressSuggestOutput {
                tokens_freeable: candidates.iter().map(|m| estimator.estimate(&m.content)).sum(),
                candidates: candidates.iter().map(|m| m.id).collect(),
                needs_compaction: context.needs_compaction(),
                budget_status: format!("{:?}", context.threshold_status()).to_lowercase(),
            };

            Ok(serde_json::to_string(&output)?)
        }
    }
}
