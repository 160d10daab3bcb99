//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted connection carries JSON text frames in both directions.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use termhost_core::protocol::MAX_FRAME_SIZE;
use termhost_core::{encode_server, ServerMessage, TermError, TermResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
pub type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> TermResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TermError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| TermError::Transport(format!("WS local addr: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    // Typically EMFILE; retrying at once would spin.
                    error!(error = %e, "TCP accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send one server frame as a text message.
pub async fn send_message(sink: &mut WsSink, msg: &ServerMessage) -> TermResult<()> {
    let json = encode_server(msg)?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| TermError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next text frame.
///
/// Returns `None` once the connection is closed. Binary and control frames
/// are skipped; frames over 1 MiB are rejected.
pub async fn recv_text(source: &mut WsSource) -> TermResult<Option<String>> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_SIZE {
                    return Err(TermError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                        text.len()
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            // Pongs are queued by tungstenite and flushed on the next send.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(TermError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
