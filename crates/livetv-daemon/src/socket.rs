use crate::core::ChannelEvent;
use crate::BroadcastMessage;
use livetv_proto::protocol::{Broadcast, Command, FrameError, Message, PROTOCOL_VERSION};
use livetv_proto::state::StateManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Accept host UI connections.  Each client gets a `Hello` snapshot, then a
/// `State` frame on every change.  `GetState` is answered here with the
/// current snapshot; every other command goes to the core, whose resulting
/// change arrives as a `State` broadcast.
pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<ChannelEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, state_manager, event_tx, broadcast_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<ChannelEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let connected = Arc::new(AtomicUsize::new(0));
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                let count = connected.fetch_add(1, Ordering::SeqCst) + 1;
                info!("Client {} connected from {} ({} connected)", id, peer, count);

                let sm = state_manager.clone();
                let evt_tx = event_tx.clone();
                let bcast_rx = broadcast_tx.subscribe();
                let connected = connected.clone();

                tokio::spawn(async move {
                    handle_client(stream, sm, id, evt_tx, bcast_rx).await;
                    let count = connected.fetch_sub(1, Ordering::SeqCst) - 1;
                    info!("Client {} disconnected ({} connected)", id, count);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<ChannelEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        while read_buf.len() >= 4 {
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(Command::GetState), consumed)) => {
                                    read_buf.drain(..consumed);
                                    if let Ok(encoded) = encode_state(&state_manager).await {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(ChannelEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("ChannelEvent channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(FrameError::Incomplete) => break,
                                Err(FrameError::Malformed { len, source }) => {
                                    warn!("Client {} sent a bad frame, skipping it: {}", client_id, source);
                                    read_buf.drain(..4 + len);
                                }
                                Err(e @ FrameError::TooLarge(_)) => {
                                    warn!("Client {}: {}, disconnecting", client_id, e);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let frame = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&state_manager).await,
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Ok(BroadcastMessage::Error(message)) => {
                        Message::Broadcast(Broadcast::Error { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&state_manager).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = frame {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        rev: state.rev,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
