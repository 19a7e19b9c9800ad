mod interactive;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use shrimp_config::AppConfig;
use shrimp_llm::{LlmClient, OpenAiClient};
use shrimp_runtime::{Runtime, TurnRequest};
use shrimp_shell::ShellPool;
use shrimp_store::{SqliteStore, Store, TriggerKind};
use shrimp_tools::{build_registry, ToolContext, ToolRegistry};

/// Backing file for `update_system_prompt_memory` et al.
const MEMORY_FILE_PATH: &str = "data/system-prompt-memory.json";

#[derive(Debug, Parser)]
#[command(name = "shrimp", version, about = "A local, single-user computer-use assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start an interactive chat session (default when no subcommand is given).
    Chat {
        /// Resume an existing conversation instead of starting a new one.
        #[arg(long)]
        conversation_id: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Run a single message non-interactively and print the resulting bubbles.
    Run {
        message: String,
        #[arg(long)]
        conversation_id: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Run one trigger: a one-shot, non-streaming turn that extracts a
    /// machine-readable `<final_result>`.
    Trigger {
        message: String,
        #[arg(long, default_value = "api")]
        trigger: String,
        #[arg(long)]
        model: Option<String>,
        /// JSON payload appended to the synthesized run message.
        #[arg(long)]
        payload: Option<String>,
    },
    /// Inspect stored conversations.
    Conversations {
        #[command(subcommand)]
        command: ConversationCommand,
    },
    /// Inspect or manage persistent system-prompt memory.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Start the Telegram long-poll front channel.
    Telegram,
}

#[derive(Debug, Subcommand)]
enum ConversationCommand {
    List,
    Show { id: String },
    Rename { id: String, title: String },
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    List,
    Update { text: String },
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::load();
    init_tracing(&config);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Chat { conversation_id: None, model: None }) {
        Command::Chat { conversation_id, model } => {
            let runtime = build_runtime(&config).await?;
            interactive::run_interactive_session(runtime, conversation_id, model).await
        }
        Command::Run { message, conversation_id, model } => {
            let runtime = build_runtime(&config).await?;
            let result = runtime
                .run_turn_silent(TurnRequest { conversation_id, message, model, ..Default::default() })
                .await?;
            println!("conversation: {}", result.conversation_id);
            for bubble in &result.bubbles {
                println!("{bubble}");
            }
            Ok(())
        }
        Command::Trigger { message, trigger, model, payload } => {
            let runtime = build_runtime(&config).await?;
            let trigger_kind = parse_trigger_kind(&trigger)?;
            let payload_value = payload
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("payload must be valid JSON")?;
            let outcome = runtime.run_trigger(trigger_kind, &message, model.as_deref(), payload_value).await?;
            println!("run: {}", outcome.run.id);
            println!("status: {}", outcome.run.status.as_str());
            println!("conversation: {}", outcome.conversation_id);
            if let Some(final_result) = &outcome.final_result {
                println!("final_result: {final_result}");
            }
            println!("---");
            println!("{}", outcome.result_preview);
            Ok(())
        }
        Command::Conversations { command } => {
            let store = build_store(&config).await?;
            run_conversations_command(store.as_ref(), command).await
        }
        Command::Memory { command } => {
            let tools = build_tool_registry(&config);
            run_memory_command(&tools, command).await
        }
        Command::Telegram => {
            let runtime = build_runtime(&config).await?;
            shrimp_telegram::start_bot(runtime).await
        }
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.telemetry.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shrimp.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // Leaked deliberately: the guard must outlive the subscriber, and
            // this binary's subscriber lives for the whole process.
            Box::leak(Box::new(guard));
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn Store>> {
    let store = SqliteStore::connect(&config.storage.db_path)
        .await
        .with_context(|| format!("failed to open storage at {}", config.storage.db_path))?;
    Ok(Arc::new(store))
}

fn build_tool_registry(config: &AppConfig) -> Arc<ToolRegistry> {
    let shell = ShellPool::new(config.shell);
    shell.spawn_sweeper();
    let workspace_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let ctx = ToolContext::new(shell, workspace_root, PathBuf::from(MEMORY_FILE_PATH));
    Arc::new(build_registry(ctx))
}

async fn build_runtime(config: &AppConfig) -> Result<Arc<Runtime>> {
    let store = build_store(config).await?;
    let tools = build_tool_registry(config);
    let api_key = config
        .llm
        .api_key
        .clone()
        .context("OPENAI_API_KEY is not set; export it or add it to a .env file")?;
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(api_key, config.llm.base_url.clone()));
    Ok(Arc::new(Runtime::new(config.clone(), store, llm, tools)))
}

fn parse_trigger_kind(raw: &str) -> Result<TriggerKind> {
    raw.parse::<TriggerKind>().map_err(|e| anyhow::anyhow!(e))
}

async fn run_conversations_command(store: &dyn Store, command: ConversationCommand) -> Result<()> {
    match command {
        ConversationCommand::List => {
            let conversations = store.list_conversations().await?;
            if conversations.is_empty() {
                println!("(no conversations)");
            }
            for c in conversations {
                println!("{}\t{}\t{}\t{}", c.id, c.model, c.title, c.updated_at);
            }
        }
        ConversationCommand::Show { id } => {
            let Some(conversation) = store.get_conversation(&id).await? else {
                bail!("no such conversation: {id}");
            };
            println!("{} — {} ({})", conversation.title, conversation.model, conversation.id);
            for message in store.list_messages(&id).await? {
                println!("[{}] {}: {}", message.created_at, message.role.as_str(), message.content);
            }
        }
        ConversationCommand::Rename { id, title } => {
            if store.rename_conversation(&id, &title).await?.is_none() {
                bail!("no such conversation: {id}");
            }
            println!("renamed");
        }
        ConversationCommand::Delete { id } => {
            if !store.delete_conversation(&id).await? {
                bail!("no such conversation: {id}");
            }
            println!("deleted");
        }
    }
    Ok(())
}

async fn run_memory_command(tools: &ToolRegistry, command: MemoryCommand) -> Result<()> {
    let result = match command {
        MemoryCommand::List => tools.dispatch("list_system_prompt_memory", serde_json::json!({})).await,
        MemoryCommand::Update { text } => {
            tools.dispatch("update_system_prompt_memory", serde_json::json!({ "memory": text })).await
        }
        MemoryCommand::Clear => tools.dispatch("clear_system_prompt_memory", serde_json::json!({})).await,
    };
    if !result.success {
        bail!("memory command failed: {}", result.output);
    }
    print_memory_items(&result.output);
    Ok(())
}

fn print_memory_items(output: &Value) {
    let items = output.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
    if items.is_empty() {
        println!("(no memory items)");
        return;
    }
    for (i, item) in items.iter().enumerate() {
        println!("{}. {}", i + 1, item.as_str().unwrap_or_default());
    }
}
