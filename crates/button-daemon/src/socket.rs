use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use button_proto::protocol::{Broadcast, Command, Message, MAX_FRAME_LEN, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::PlaybackClient;
use crate::coordinator::PressCoordinator;
use crate::core::DaemonEvent;
use crate::BroadcastMessage;

/// Everything a connection handler needs.
pub struct SocketContext<C> {
    pub coordinator: Arc<PressCoordinator<C>>,
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub broadcast_tx: broadcast::Sender<BroadcastMessage>,
    pub shutdown: CancellationToken,
}

impl<C> Clone for SocketContext<C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            event_tx: self.event_tx.clone(),
            broadcast_tx: self.broadcast_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

pub fn start_server<C: PlaybackClient + 'static>(
    bind_address: String,
    port: u16,
    ctx: SocketContext<C>,
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

        info!("TCP control socket listening at {}", addr);
        serve(listener, ctx).await;
    })
}

/// Accept connections until the shutdown token fires.
pub async fn serve<C: PlaybackClient + 'static>(listener: TcpListener, ctx: SocketContext<C>) {
    let client_id = AtomicUsize::new(0);

    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let id = client_id.fetch_add(1, Ordering::Relaxed) + 1;
                info!("Client {} connected from {}", id, peer);

                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_client(stream, id, ctx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
    info!("TCP control socket closed");
}

async fn handle_client<C: PlaybackClient>(
    stream: TcpStream,
    client_id: usize,
    ctx: SocketContext<C>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut broadcast_rx = ctx.broadcast_tx.subscribe();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    if let Ok(encoded) = encode_hello(&ctx.coordinator) {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,

            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            if read_buf.len() < 4 { break; }
                            if Message::is_oversized(&read_buf) {
                                warn!(
                                    "Client {} announced a frame over {} bytes, disconnecting",
                                    client_id, MAX_FRAME_LEN
                                );
                                let message = format!("frame exceeds {} bytes", MAX_FRAME_LEN);
                                let _ = send_error(&mut write_half, message).await;
                                return;
                            }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    let event = match cmd {
                                        Command::Press { pin } => DaemonEvent::Press {
                                            pin,
                                            source: "socket",
                                        },
                                        Command::StopAll => DaemonEvent::StopAll,
                                        Command::GetState => {
                                            if let Ok(encoded) = encode_state(&ctx.coordinator) {
                                                if write_half.write_all(&encoded).await.is_err() {
                                                    return;
                                                }
                                            }
                                            continue;
                                        }
                                    };

                                    if ctx.event_tx.send(event).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => {
                                    // only a complete frame can be malformed
                                    match Message::frame_len(&read_buf) {
                                        Some(len) if read_buf.len() >= len => {
                                            read_buf.drain(..len);
                                            warn!(client_id, "Malformed frame: {}", e);
                                            let message = format!("malformed frame: {}", e);
                                            if send_error(&mut write_half, message).await.is_err() {
                                                return;
                                            }
                                        }
                                        _ => break,
                                    }
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
                match msg {
                    Ok(BroadcastMessage::StateUpdated) => {
                        if let Ok(encoded) = encode_state(&ctx.coordinator) {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        let broadcast = Broadcast::Log { message };
                        if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        if let Ok(encoded) = encode_state(&ctx.coordinator) {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

async fn send_error(write_half: &mut OwnedWriteHalf, message: String) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(Broadcast::Error { message }).encode()?;
    write_half.write_all(&encoded).await?;
    Ok(())
}

fn encode_hello<C: PlaybackClient>(coordinator: &PressCoordinator<C>) -> anyhow::Result<Vec<u8>> {
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state: coordinator.snapshot(),
    })
    .encode()
}

fn encode_state<C: PlaybackClient>(coordinator: &PressCoordinator<C>) -> anyhow::Result<Vec<u8>> {
    Message::Broadcast(Broadcast::State {
        data: coordinator.snapshot(),
    })
    .encode()
}
