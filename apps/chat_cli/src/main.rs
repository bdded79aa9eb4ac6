use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    destinations, BusEvent, ChatApi, ConnectionHandle, Credentials, EventBus, HttpChatApi,
    MessageWindow, OfflineOutbox, SendOutcome, Settings, Topic, TopicRouter,
};
use shared::{domain::ConversationId, protocol::TopicPayload};
use storage::{PendingMessageStore, Storage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Defaults to ./client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bearer token; falls back to APP__ACCESS_TOKEN.
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, follow one conversation and send stdin lines to it.
    Chat { conversation_id: i64 },
    /// List messages waiting in the offline queue.
    Pending,
    /// Deliver the offline queue once and exit.
    Sync,
}

/// Stdin prefix that swaps in a new access token without restarting.
const TOKEN_COMMAND: &str = "/token ";

fn access_token(cli: &Cli) -> Result<String> {
    cli.token
        .clone()
        .or_else(|| std::env::var("APP__ACCESS_TOKEN").ok())
        .context("no access token; pass --token or set APP__ACCESS_TOKEN")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let store = Arc::new(Storage::new(&settings.database_url).await?);

    match cli.command {
        Command::Pending => {
            for pending in store.list_pending_messages().await? {
                println!(
                    "{} conversation={} status={} {:?}",
                    pending.id,
                    pending.conversation_id,
                    pending.status.as_str(),
                    pending.message_text
                );
            }
        }
        Command::Sync => {
            let api = Arc::new(HttpChatApi::new(&settings.server_url, access_token(&cli)?));
            let outbox = OfflineOutbox::new(store, api, EventBus::new());
            let report = outbox.sync().await?;
            println!(
                "attempted={} sent={} failed={}",
                report.attempted, report.sent, report.failed
            );
        }
        Command::Chat { conversation_id } => {
            let token = access_token(&cli)?;
            run_chat(settings, store, token, ConversationId(conversation_id)).await?;
        }
    }
    Ok(())
}

async fn run_chat(
    settings: Settings,
    store: Arc<Storage>,
    token: String,
    conversation_id: ConversationId,
) -> Result<()> {
    let bus = EventBus::new();
    let http_api = Arc::new(HttpChatApi::new(&settings.server_url, token.clone()));
    let api: Arc<dyn ChatApi> = http_api.clone();
    let outbox = Arc::new(OfflineOutbox::new(store, api.clone(), bus.clone()));
    let connection =
        ConnectionHandle::spawn(settings.connection_config(), TopicRouter::new(bus.clone()));
    let (_observer, mut events) = bus.channel();

    for topic in Topic::ALL {
        connection
            .subscribe(&destinations::user_queue(topic), settings.device_type)
            .await?;
    }
    let sync_task = outbox.spawn_sync_on_reconnect(connection.watch_state());
    connection.connect(Credentials::bearer(token)).await?;

    let mut window = MessageWindow::new(conversation_id, api, settings.page_size);
    match window.load_latest().await {
        Ok(()) => {
            for message in window.messages().collect::<Vec<_>>().into_iter().rev() {
                println!("[{}] {}: {}", message.id, message.sender_id, message.message_text);
            }
        }
        Err(err) => warn!(error = %err, "history unavailable, showing live messages only"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if let Some(fresh) = text.strip_prefix(TOKEN_COMMAND) {
                    let fresh = fresh.trim().to_string();
                    http_api.set_access_token(fresh.clone()).await;
                    match connection.connect(Credentials::bearer(fresh)).await {
                        Ok(()) => info!("access token replaced"),
                        Err(err) => warn!(error = %err, "replacement token rejected"),
                    }
                    continue;
                }
                let online = connection.snapshot().is_connected();
                match outbox.send_or_enqueue(conversation_id, text, None, online).await? {
                    SendOutcome::Sent(message) => info!(message_id = message.id.0, "sent"),
                    SendOutcome::Queued(pending) => info!(client_id = %pending.id, "queued for later"),
                }
            }
            Some(event) = events.recv() => {
                if window.apply_event(&event) {
                    if let BusEvent::Topic(TopicPayload::NewMessage(message)) = &event {
                        println!("[{}] {}: {}", message.id, message.sender_id, message.message_text);
                    }
                }
                match event {
                    BusEvent::ConnectionStatusChanged(status) => info!(?status, "connection"),
                    BusEvent::AuthenticationRequired => {
                        warn!("access token expired; enter `{TOKEN_COMMAND}<jwt>` to continue");
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    connection.disconnect(true).await?;
    sync_task.abort();
    Ok(())
}
