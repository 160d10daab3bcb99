//! Core server: accepts WebSocket connections and dispatches JSON requests
//! to the session registry.
//!
//! Every connection holds one event subscription and a set of watched
//! execution ids. Sessions spawned or attached over a connection are watched
//! automatically; events for other sessions are dropped for that connection.

use crate::config::ServerConfig;
use crate::session::SessionManager;
use crate::transport::websocket::{self, WebSocketConnection};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use termhost_core::{
    decode_client, ClientMessage, Request, Response, ServerMessage, TermError, TermResult,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The termhost server instance.
pub struct TermServer {
    config: ServerConfig,
    sessions: SessionManager,
}

impl TermServer {
    pub fn new(config: ServerConfig) -> Self {
        let sessions = SessionManager::new(config.sessions.clone());
        Self { config, sessions }
    }

    /// Shared handle to the session registry.
    pub fn sessions(&self) -> SessionManager {
        self.sessions.clone()
    }

    /// Bind the configured address and serve until the listener closes.
    pub async fn run(self) -> TermResult<()> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let (local_addr, conns) = websocket::start_listener(addr).await?;
        info!(
            addr = %local_addr,
            max_sessions = self.config.sessions.max_sessions,
            "termhost-server ready"
        );
        self.serve(conns).await;
        Ok(())
    }

    /// Accept loop over already-established connections.
    pub async fn serve(self, mut conns: mpsc::Receiver<WebSocketConnection>) {
        let server = Arc::new(self);
        while let Some(conn) = conns.recv().await {
            let srv = server.clone();
            tokio::spawn(async move {
                let remote = conn.remote_addr;
                if let Err(e) = srv.handle_websocket(conn).await {
                    warn!(remote = %remote, error = %e, "WebSocket connection error");
                }
            });
        }
        info!("listener closed, no longer accepting connections");
    }

    async fn handle_websocket(&self, conn: WebSocketConnection) -> TermResult<()> {
        let remote = conn.remote_addr;
        info!(remote = %remote, "client connected");

        let (mut sink, mut source) = conn.ws_stream.split();
        let mut subscription = self.sessions.subscribe();
        let mut watched: HashSet<String> = HashSet::new();

        let result = loop {
            tokio::select! {
                Some(event) = subscription.events.recv() => {
                    if !watched.contains(event.execution_id()) {
                        continue;
                    }
                    if let Err(e) = websocket::send_message(&mut sink, &ServerMessage::event(event)).await {
                        break Err(e);
                    }
                }

                frame = websocket::recv_text(&mut source) => {
                    let reply = match frame {
                        Ok(Some(text)) => match decode_client(&text) {
                            Ok(msg) => dispatch(&self.sessions, &mut watched, msg).await,
                            Err(e) => {
                                debug!(remote = %remote, error = %e, "rejected client frame");
                                ServerMessage::error(None, &e)
                            }
                        },
                        Ok(None) => {
                            debug!(remote = %remote, "peer closed");
                            break Ok(());
                        }
                        Err(e @ TermError::InvalidMessage(_)) => ServerMessage::error(None, &e),
                        Err(e) => {
                            debug!(remote = %remote, error = %e, "connection ended");
                            break Ok(());
                        }
                    };
                    if let Err(e) = websocket::send_message(&mut sink, &reply).await {
                        break Err(e);
                    }
                }
            }
        };

        self.sessions.unsubscribe(subscription.id);
        info!(remote = %remote, watched = watched.len(), "client disconnected");
        result
    }
}

/// Execute one client request against the registry.
///
/// `watched` is the calling connection's event filter; spawn and attach add
/// to it, detach removes from it.
pub async fn dispatch(
    sessions: &SessionManager,
    watched: &mut HashSet<String>,
    msg: ClientMessage,
) -> ServerMessage {
    let request_id = msg.request_id;
    let result: TermResult<Response> = match msg.request {
        Request::Spawn(request) => {
            // Watch before spawning so no early output is filtered away.
            let execution_id = request.execution_id.clone();
            let newly_watched = watched.insert(execution_id.clone());
            match sessions.spawn(request).await {
                Ok(session) => Ok(Response::Spawned { session }),
                Err(e) => {
                    if newly_watched {
                        watched.remove(&execution_id);
                    }
                    Err(e)
                }
            }
        }
        Request::Write { execution_id, data } => Ok(Response::Written {
            ok: sessions.write(&execution_id, &data).await,
        }),
        Request::Resize {
            execution_id,
            cols,
            rows,
        } => sessions
            .resize(&execution_id, cols, rows)
            .await
            .map(|()| Response::Resized { execution_id }),
        Request::GetSession { execution_id } => Ok(Response::Session {
            session: sessions.get_session(&execution_id).await,
        }),
        Request::GetBuffer { execution_id } => {
            let lines = sessions.get_buffer(&execution_id).await;
            Ok(Response::Buffer {
                execution_id,
                lines,
            })
        }
        Request::Kill { execution_id } => {
            let killed = sessions.kill(&execution_id).await;
            Ok(Response::Killed {
                execution_id,
                killed,
            })
        }
        Request::List => Ok(Response::Sessions {
            execution_ids: sessions.active_session_ids().await,
        }),
        Request::Attach { execution_id } => match sessions.get_session(&execution_id).await {
            Some(session) => {
                watched.insert(execution_id);
                Ok(Response::Attached { session })
            }
            None => Err(TermError::NotFound(execution_id)),
        },
        Request::Detach { execution_id } => {
            watched.remove(&execution_id);
            Ok(Response::Detached { execution_id })
        }
    };

    match result {
        Ok(body) => ServerMessage::reply(request_id, body),
        Err(e) => {
            debug!(error = %e, "request failed");
            ServerMessage::error(request_id, &e)
        }
    }
}
