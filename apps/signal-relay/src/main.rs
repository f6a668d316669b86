//! Signaling relay for textsync peers
//! Introduces the members of a room and forwards their negotiation blobs

mod rooms;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use rooms::{send_frame, Rooms, Tx};
use std::net::SocketAddr;
use textsync::{ParticipantId, RoomId, SignalFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "signal-relay")]
#[command(about = "Rendezvous server that pairs textsync peers per room")]
#[command(version)]
struct Args {
    /// Address to accept WebSocket clients on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("signal_relay=debug,textsync=debug")),
        )
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(args.listen).await?;
    info!("Signaling relay listening on: {}", listener.local_addr()?);

    serve(listener, Rooms::default()).await;
    Ok(())
}

async fn serve(listener: TcpListener, rooms: Rooms) {
    while let Ok((stream, addr)) = listener.accept().await {
        info!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, addr, rooms.clone()));
    }
}

/// Room membership of one client connection
#[derive(Default)]
struct Membership {
    room: Option<RoomId>,
    participant: Option<ParticipantId>,
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, rooms: Rooms) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let mut membership = Membership::default();

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("Error receiving from {}: {}", addr, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = handle_frame(&text, &rooms, &tx, &mut membership).await {
                    warn!("Rejected frame from {}: {}", addr, e);
                    send_frame(
                        &tx,
                        &SignalFrame::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let (Some(room), Some(participant)) = (membership.room, membership.participant) {
        rooms.leave(&room, &participant).await;
    }

    send_task.abort();
    info!("Connection closed: {}", addr);
}

async fn handle_frame(
    text: &str,
    rooms: &Rooms,
    tx: &Tx,
    membership: &mut Membership,
) -> anyhow::Result<()> {
    let frame: SignalFrame = serde_json::from_str(text)?;

    match frame {
        SignalFrame::Join {
            room_id,
            participant_id,
        } => {
            if membership.room.is_some() {
                anyhow::bail!("already joined, leave first");
            }
            rooms.join(&room_id, &participant_id, tx.clone()).await?;
            membership.room = Some(room_id);
            membership.participant = Some(participant_id);
        }

        SignalFrame::Signal { to, payload, .. } => {
            let (Some(room), Some(from)) = (&membership.room, &membership.participant) else {
                anyhow::bail!("not joined to any room");
            };
            rooms.forward(room, from, &to, payload).await?;
        }

        SignalFrame::Leave => {
            if let (Some(room), Some(participant)) =
                (membership.room.take(), membership.participant.take())
            {
                rooms.leave(&room, &participant).await;
            }
        }

        other => {
            warn!("Unexpected frame from client: {:?}", other);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use textsync::{SignalEvent, Signaling, WsSignaling};

    async fn start_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Rooms::default()));
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_relay_pairs_clients() {
        let url = start_relay().await;
        let room = RoomId::default();
        let a = ParticipantId::from("user_a_1");
        let b = ParticipantId::from("user_b_2");

        let a_sig = WsSignaling::new(url.clone());
        let mut a_events = a_sig.join(&room, &a).await.unwrap();
        assert_eq!(
            a_events.recv().await,
            Some(SignalEvent::Roster { peers: vec![] })
        );

        let b_sig = WsSignaling::new(url);
        let mut b_events = b_sig.join(&room, &b).await.unwrap();
        assert_eq!(
            b_events.recv().await,
            Some(SignalEvent::Roster {
                peers: vec![a.clone()]
            })
        );
        assert_eq!(
            a_events.recv().await,
            Some(SignalEvent::PeerJoined {
                participant_id: b.clone()
            })
        );

        b_sig
            .send(&a, serde_json::json!({"kind": "offer", "addr": "127.0.0.1:1"}))
            .await
            .unwrap();
        match a_events.recv().await {
            Some(SignalEvent::Negotiation { from, payload }) => {
                assert_eq!(from, b);
                assert_eq!(payload["kind"], "offer");
            }
            other => panic!("expected negotiation, got {:?}", other),
        }

        b_sig.leave().await.unwrap();
        assert_eq!(
            a_events.recv().await,
            Some(SignalEvent::PeerLeft { participant_id: b })
        );
    }
}
