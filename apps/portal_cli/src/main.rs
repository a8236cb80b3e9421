use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::{ConversationId, MessageId, NotificationId, NotificationKind, UserId};
use sync_core::{
    config::{load_settings_from, DEFAULT_CONFIG_FILE},
    NotificationDraft, SyncClient, SyncEvent, SyncSession,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Overrides `api_base_url` from the settings file.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    identity: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current state, then follow live updates until Ctrl-C.
    Watch,
    Conversations,
    Send {
        #[arg(long)]
        to: String,
        content: String,
    },
    Read {
        conversation_id: String,
        #[arg(long)]
        message_id: Option<String>,
    },
    Notify {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
        #[arg(long, default_value = "info")]
        kind: String,
    },
    Notifications {
        #[arg(long)]
        mark_all_read: bool,
        #[arg(long)]
        remove: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings_from(&cli.config, |key| std::env::var(key).ok());
    if let Some(api_url) = cli.api_url {
        settings.api_base_url = api_url;
    }
    let client = SyncClient::new(settings)?;
    let session = client
        .set_identity(Some(UserId::new(cli.identity)))
        .await?
        .context("no session started")?;

    let outcome = run(&session, cli.command).await;
    client.sign_out().await;
    outcome
}

async fn run(session: &Arc<SyncSession>, command: Command) -> Result<()> {
    match command {
        Command::Watch => watch(session).await?,
        Command::Conversations => print_conversations(session).await,
        Command::Send { to, content } => {
            let message = session.send_message(&UserId::new(to), &content).await?;
            println!(
                "sent message_id={} conversation_id={}",
                message.id, message.conversation_id
            );
        }
        Command::Read {
            conversation_id,
            message_id,
        } => {
            let conversation_id = ConversationId::new(conversation_id);
            session
                .mark_conversation_read(&conversation_id, message_id.map(MessageId::new))
                .await?;
            println!(
                "conversation {conversation_id} unread={}",
                session.conversation_unread(&conversation_id).await
            );
        }
        Command::Notify { title, body, kind } => {
            let kind = parse_kind(&kind)?;
            let notification = session
                .create_notification(NotificationDraft::new(title, body, kind))
                .await?;
            println!("created notification_id={}", notification.id);
        }
        Command::Notifications {
            mark_all_read,
            remove,
        } => {
            if let Some(notification_id) = remove {
                session
                    .remove_notification(&NotificationId::new(notification_id))
                    .await?;
            }
            if mark_all_read {
                session.mark_all_notifications_read().await?;
            }
            print_notifications(session).await;
        }
    }
    Ok(())
}

fn parse_kind(raw: &str) -> Result<NotificationKind> {
    let kind: NotificationKind =
        serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))?;
    if kind == NotificationKind::Other {
        bail!("unknown notification kind '{raw}'");
    }
    Ok(kind)
}

async fn print_conversations(session: &SyncSession) {
    let local = session.identity().clone();
    for conversation in session.conversations().await {
        let counterpart = conversation
            .counterpart(&local)
            .map(|details| details.name.clone())
            .unwrap_or_default();
        println!(
            "{} [{}] unread={} last={}",
            conversation.id,
            counterpart,
            conversation.unread_count,
            conversation.last_message.as_deref().unwrap_or("-")
        );
    }
    println!("total unread={}", session.total_unread_messages().await);
}

async fn print_notifications(session: &SyncSession) {
    for notification in session.notifications().await {
        let marker = if notification.read { " " } else { "*" };
        println!(
            "{marker} {} {:?} {} - {}",
            notification.id, notification.kind, notification.title, notification.body
        );
    }
    println!("unread notifications={}", session.unread_notifications().await);
}

async fn watch(session: &SyncSession) -> Result<()> {
    let mut events = session.subscribe_events();
    print_conversations(session).await;
    print_notifications(session).await;
    info!(identity = %session.identity(), "watching live updates");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SyncEvent::ConversationUpdated { conversation_id }) => {
                let messages = session.messages(&conversation_id).await;
                if let Some(latest) = messages.iter().max_by_key(|message| message.created_at) {
                    println!(
                        "[{conversation_id}] {}: {}",
                        latest.sender_name, latest.content
                    );
                }
                println!("total unread={}", session.total_unread_messages().await);
            }
            Ok(SyncEvent::NotificationsUpdated) => {
                if let Some(latest) = session.notifications().await.first() {
                    println!("notification: {} - {}", latest.title, latest.body);
                }
                println!("unread notifications={}", session.unread_notifications().await);
            }
            Ok(SyncEvent::ChannelStateChanged { kind, state }) => {
                println!("{} channel: {state:?}", kind.path_segment());
            }
            Ok(SyncEvent::Error(message)) => eprintln!("error: {message}"),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                eprintln!("missed {skipped} updates; state below is current");
                print_conversations(session).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
    Ok(())
}
