// main.rs — boots background, content and popup contexts in one process and
// streams a single answer to stdout.
use anyhow::anyhow;
use clap::Parser;
use reader_bridge::chat::provider::DEFAULT_PROVIDER;
use reader_bridge::chat::{ChatOptions, ChatService, ProviderRegistry};
use reader_bridge::settings::{JsonFileSettingsStore, MemorySettingsStore, SettingsStore};
use reader_bridge::{ContentBridge, LocalRuntime, MessageRouter, PopupBridge, SharedSubstrate, StreamUpdate};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "reader-bridge")]
#[command(about = "Ask the reading assistant about a passage", long_about = None)]
struct Args {
    /// Passage or question
    text: Vec<String>,

    /// Provider id (default: currentProvider from settings, else qianwen)
    #[arg(short, long)]
    provider: Option<String>,

    /// explain | digest | analyze | chat
    #[arg(short, long, default_value = "chat")]
    action: String,

    #[arg(long)]
    book: Option<String>,

    #[arg(long)]
    author: Option<String>,

    /// JSON settings file (apiKeys, models, temperatures, currentProvider)
    #[arg(long, env = "READER_BRIDGE_SETTINGS")]
    settings: Option<String>,

    /// Only check that the configured key works
    #[arg(long)]
    test_key: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings: Arc<dyn SettingsStore> = match &args.settings {
        Some(path) => Arc::new(JsonFileSettingsStore::open(path).await?),
        None => Arc::new(MemorySettingsStore::new()),
    };

    let runtime: SharedSubstrate = LocalRuntime::new();
    let chat = Arc::new(ChatService::new(settings.clone(), ProviderRegistry::builtin())?);
    let router = MessageRouter::new(runtime.clone(), chat)?;
    let content = ContentBridge::new(runtime.clone(), settings, args.book.clone(), args.author.clone());

    if args.test_key {
        let popup = PopupBridge::new(runtime);
        let provider = args.provider.as_deref().unwrap_or(DEFAULT_PROVIDER);
        let result = popup.test_api_connection(provider, None, None).await;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return if result.success { Ok(()) } else { Err(anyhow!(result.message)) };
    }

    let text = args.text.join(" ");
    if text.trim().is_empty() {
        anyhow::bail!("nothing to ask: pass a passage or question");
    }
    let mut options = ChatOptions::new(text).action(&args.action);
    if let Some(provider) = &args.provider {
        options = options.provider(provider);
    }

    let (tx, mut updates) = mpsc::unbounded_channel();
    let request_id = content.chat().send_stream_message(options, tx)?;
    let mut stdout = std::io::stdout();

    let result = loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(StreamUpdate::Started(start)) => {
                    log::info!("{} ({}) is answering", start.provider, start.model);
                }
                Some(StreamUpdate::Chunk(text)) => {
                    print!("{}", text);
                    stdout.flush()?;
                }
                Some(StreamUpdate::Completed(_)) => {
                    println!();
                    break Ok(());
                }
                Some(StreamUpdate::Failed(e)) => break Err(anyhow!(e)),
                None => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                content.chat().cancel_stream_request(&request_id);
                eprintln!();
                log::info!("cancelled by user");
                break Ok(());
            }
        }
    };

    content.destroy();
    router.destroy();
    result
}
