//! Collaborative report editing WebSocket server

use clap::Parser;
use collaboration::*;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Real-time collaborative report editing server",
    long_about = None
)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "COLLAB_ADDR", default_value = "127.0.0.1:8080")]
    addr: SocketAddr,
    /// Log filter directives (overridden by RUST_LOG)
    #[arg(
        long,
        env = "COLLAB_LOG",
        default_value = "collab_server=info,collaboration=info,audit=info"
    )]
    log_filter: String,
    /// Quiet period before an auto-save snapshot, in milliseconds
    #[arg(long, env = "COLLAB_AUTOSAVE_DEBOUNCE_MS")]
    autosave_debounce_ms: Option<u64>,
    /// Presence messages buffered per connection before the oldest are dropped
    #[arg(long, env = "COLLAB_OUTBOUND_CAPACITY")]
    outbound_capacity: Option<usize>,
    /// Default conflict strategy for new sessions (last_writer_wins, merge, manual)
    #[arg(long, env = "COLLAB_CONFLICT_RESOLUTION")]
    conflict_resolution: Option<ResolutionStrategy>,
}

impl Args {
    fn config(&self) -> CollabConfig {
        let mut config = CollabConfig::default();
        if let Some(ms) = self.autosave_debounce_ms {
            config.autosave_debounce_ms = ms;
        }
        if let Some(capacity) = self.outbound_capacity {
            config.outbound_capacity = capacity;
        }
        if let Some(strategy) = self.conflict_resolution {
            config.default_settings.conflict_resolution = strategy;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.config();
    let service = CollaborationService::init(config, ServiceDeps::default());

    let listener = TcpListener::bind(args.addr).await?;
    info!("Collaboration server listening on: {}", args.addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New connection from: {}", addr);
                    tokio::spawn(handle_connection(stream, addr, service.clone()));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, service: CollaborationService) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let outbox = OutboundQueue::new(service.config().outbound_capacity);
    let mut conn = Connection::new(outbox.clone());

    // Drains the outbound queue to the socket until the queue closes
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize {}: {}", message.type_name(), e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                debug!("Failed to send message: {}", e);
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(frame) = ws_receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Error receiving from {}: {}", addr, e);
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    conn.outbox.send(ServerMessage::error(
                        &CollaborationError::ValidationFailure("binary frame is not UTF-8".into()),
                    ));
                    continue;
                }
            },
            Message::Close(_) => {
                info!("Client {} requested close", addr);
                break;
            }
            // tungstenite queues pong replies itself
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let result = match ClientMessage::from_json(&text) {
            Ok(message) => service.handle_message(&mut conn, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!("Request from {} failed: {}", addr, e);
            conn.outbox.send(ServerMessage::error(&e));
        }
        if conn.outbox.is_closed() {
            // Session ended or participant swept idle
            break;
        }
    }

    service.disconnect(&mut conn).await;
    if let Err(e) = send_task.await {
        warn!("Send task for {} failed: {}", addr, e);
    }
    info!("Connection closed: {}", addr);
}
