//! Terminal front end for a textsync participant
//! Lines typed on stdin are appended to the shared buffer; `/` commands control the session

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use textsync::{
    CollabConfig, HeadlessSurface, JsonFileStore, Participant, PeerTransport, RoomId, SyncEngine,
    TextSurface, WsConnector, WsSignaling,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "textsync-peer")]
#[command(about = "Share a text buffer with the other peers of a room")]
#[command(version)]
struct Args {
    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Room to join (overrides the settings file)
    #[arg(short, long)]
    room: Option<String>,

    /// Signaling relay URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
    signal: String,

    /// Address peers dial to reach this participant
    #[arg(short, long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// Where the buffer is persisted
    #[arg(long, default_value = "textsync-store.json")]
    store: PathBuf,
}

#[derive(Debug, PartialEq)]
enum Command {
    Append(String),
    Show,
    Clear,
    Room(Option<String>),
    Cursor(usize),
    Peers,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Append(line.to_string());
        };

        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("show"), _) => Command::Show,
            (Some("clear"), _) => Command::Clear,
            (Some("room"), room) => Command::Room(room.map(str::to_string)),
            (Some("cursor"), Some(pos)) => match pos.parse() {
                Ok(pos) => Command::Cursor(pos),
                Err(_) => Command::Unknown(line.to_string()),
            },
            (Some("peers"), _) => Command::Peers,
            (Some("quit"), _) => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("textsync_peer=info,textsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CollabConfig::load(path).await?,
        None => CollabConfig::default(),
    };
    if let Some(room) = args.room {
        config.room_id = RoomId::from(room.as_str());
    }
    config.validate()?;

    let me = Participant::generate();
    info!("Participant {} ({})", me.id, me.color.as_str());

    let connector = WsConnector::bind(me.id.clone(), args.listen).await?;
    let signaling = Arc::new(WsSignaling::new(args.signal));
    let transport = PeerTransport::new(me, &config, connector, signaling);

    let surface = Arc::new(HeadlessSurface::new());
    transport.set_status_view(surface.clone());

    let store = Arc::new(JsonFileStore::new(&args.store));
    let engine = SyncEngine::new(transport.clone(), store, surface.clone(), config);

    match engine.load_from_storage().await {
        Ok(true) => println!("Restored buffer from {}", args.store.display()),
        Ok(false) => {}
        Err(e) => warn!("Could not restore buffer: {}", e),
    }
    transport.discover_peers().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(Command::parse(&line), &engine, &surface).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    transport.disconnect().await;
    engine.flush_persistence().await;
    Ok(())
}

/// Returns false when the session should end
async fn run_command(
    command: Command,
    engine: &Arc<SyncEngine>,
    surface: &Arc<HeadlessSurface>,
) -> bool {
    match command {
        Command::Append(line) => {
            let mut text = surface.content();
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&line);
            surface.type_text(&text, text.encode_utf16().count());
            engine.handle_local_edit();
            engine.handle_cursor_change();
        }
        Command::Show => {
            println!("--- {} | {} user(s) online", surface.status(), surface.participant_count());
            println!("{}", engine.text());
            for indicator in engine.render_remote_cursors() {
                println!(
                    "  {} at line {}, column {}",
                    indicator.label,
                    indicator.line + 1,
                    indicator.column + 1
                );
            }
        }
        Command::Clear => match engine.clear_text() {
            Ok(count) => println!("Cleared for {} peer(s)", count),
            Err(e) => warn!("Clear failed: {}", e),
        },
        Command::Room(room) => {
            let room = room.as_deref().map(RoomId::from);
            match engine.transport().set_room_id(room).await {
                Ok(count) => println!(
                    "Now in {} ({} peer(s) notified)",
                    engine.transport().room(),
                    count
                ),
                Err(e) => warn!("Room change failed: {}", e),
            }
        }
        Command::Cursor(position) => {
            surface.set_cursor(position);
            engine.handle_cursor_change();
        }
        Command::Peers => {
            for peer in engine.transport().connected_peers() {
                println!("  {}", peer);
            }
        }
        Command::Quit => return false,
        Command::Unknown(line) => println!("Unknown command: {}", line),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("hello"), Command::Append("hello".to_string()));
        assert_eq!(Command::parse("/show"), Command::Show);
        assert_eq!(Command::parse("/room"), Command::Room(None));
        assert_eq!(
            Command::parse("/room team"),
            Command::Room(Some("team".to_string()))
        );
        assert_eq!(Command::parse("/cursor 4"), Command::Cursor(4));
        assert_eq!(
            Command::parse("/cursor x"),
            Command::Unknown("/cursor x".to_string())
        );
        assert_eq!(Command::parse("/quit"), Command::Quit);
    }
}
