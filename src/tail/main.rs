/**
 * chatsync-tail
 *
 * Follows one channel: prints messages as they arrive and the live
 * presence roster as it changes, until Ctrl-C.
 *
 * Usage: chatsync-tail <channel-id> [config.toml]
 * The channel can also come from CHATSYNC_CHANNEL_ID.
 */
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chatsync::client::http::{RestClient, SseTransport};
use chatsync::client::presence::live_roster;
use chatsync::client::{QueryView, SessionProvider, StaticSession, SyncEngine};
use chatsync::logging;
use chatsync::shared::{QueryKey, SyncConfig, Topic};

fn print_new_messages(view: &QueryView, seen: &mut HashSet<String>) {
    let Some(rows) = view.data() else {
        return;
    };
    for message in rows.iter().filter_map(|row| row.as_message()) {
        if seen.insert(message.id.clone()) {
            println!(
                "[{}] {}: {}",
                message.created_at.format("%H:%M:%S"),
                message.author_id,
                message.content
            );
        }
    }
    if let Some(error) = view.error() {
        eprintln!("(stale: {})", error);
    }
}

fn print_roster(view: &QueryView, window: chrono::Duration) {
    let Some(rows) = view.data() else {
        return;
    };
    let roster = live_roster(&rows, chrono::Utc::now(), window);
    let names: Vec<String> = roster
        .iter()
        .map(|record| {
            record
                .profile
                .as_ref()
                .map(|p| p.username.clone())
                .unwrap_or_else(|| record.user_id.clone())
        })
        .collect();
    println!("-- online: {}", names.join(", "));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::init();

    let mut args = std::env::args().skip(1);
    let channel_id = match args.next().or_else(|| std::env::var("CHATSYNC_CHANNEL_ID").ok()) {
        Some(id) => id,
        None => {
            eprintln!("usage: chatsync-tail <channel-id> [config.toml]");
            std::process::exit(2);
        }
    };
    let config_path = args.next().map(PathBuf::from);
    let config = SyncConfig::load(config_path.as_deref())?;
    tracing::info!("[Tail] Following channel {} on {}", channel_id, config.api_url);

    let rest = Arc::new(RestClient::new(&config)?);
    let feed = Arc::new(SseTransport::new(&config)?);
    let session: Arc<dyn SessionProvider> = match config.user_id.clone() {
        Some(user_id) => Arc::new(StaticSession::new(user_id)),
        None => Arc::new(StaticSession::anonymous()),
    };
    let window = config.presence_window();
    let engine = SyncEngine::new(config, rest.clone(), rest, feed);

    let messages_sub = engine.subscribe(Topic::channel_messages(&channel_id)).await;
    let presence_sub = engine.subscribe(Topic::presence()).await;
    let mut messages = engine.use_query(QueryKey::messages(&channel_id)).await;
    let mut roster = engine.use_query(QueryKey::Presence).await;

    let presence = if session.current_user_id().is_some() {
        let tracker = engine.presence(session.clone());
        tracker.start().await?;
        Some(tracker)
    } else {
        tracing::info!("[Tail] No CHATSYNC_USER_ID, watching without announcing presence");
        None
    };

    let mut seen = HashSet::new();
    print_new_messages(&messages, &mut seen);
    print_roster(&roster, window);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            alive = messages.changed() => {
                if !alive {
                    break;
                }
                print_new_messages(&messages, &mut seen);
            }
            alive = roster.changed() => {
                if !alive {
                    break;
                }
                print_roster(&roster, window);
            }
        }
    }

    tracing::info!("[Tail] Shutting down");
    if let Some(presence) = presence {
        presence.stop().await;
    }
    drop(messages);
    drop(roster);
    messages_sub.release().await;
    presence_sub.release().await;
    engine.shutdown().await;
    Ok(())
}
