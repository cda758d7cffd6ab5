//! Realtime endpoint.
//!
//! One TCP listener serves both the HTTP API and the station WebSocket
//! upgrade. Inbound text frames go to the [`EventRouter`] and hub events are
//! written back out. One task per station connection.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use protocol::Envelope;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{self, AppState};
use crate::hub::StationHandle;

/// Listening endpoint for stations and HTTP clients.
pub struct RealtimeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RealtimeServer {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Realtime server listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve HTTP and WebSocket traffic until `shutdown` is cancelled.
    ///
    /// Open station sockets watch `state.shutdown` and close on their own.
    pub async fn serve(self, state: AppState, shutdown: CancellationToken) {
        let app = api::routes(state).into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        match result {
            Ok(()) => info!("Realtime server stopped"),
            Err(e) => warn!(error = %e, "Realtime server stopped with error"),
        }
    }
}

/// Drive one upgraded station socket until either side closes.
pub(crate) async fn run_station(ws: WebSocket, peer: SocketAddr, state: AppState) {
    let StationHandle { id, mut events } = match state.hub.connect(Some(peer)) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rejecting station connection");
            return;
        }
    };

    let shutdown = state.shutdown.child_token();
    let (mut sink, mut inbound) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outbound = events.recv() => match outbound {
                Some(envelope) => match envelope.to_json() {
                    Ok(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            debug!(connection_id = %id, error = %e, "Write failed");
                            break;
                        }
                    }
                    Err(e) => warn!(connection_id = %id, error = %e, "Failed to encode event"),
                },
                // The hub dropped this connection.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = inbound.next() => match frame {
                Some(Ok(Message::Text(text))) => match Envelope::from_json(text.as_str()) {
                    Ok(envelope) => state.router.handle(&id, envelope),
                    Err(e) => debug!(connection_id = %id, error = %e, "Dropping malformed frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered on the next flush.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %id, error = %e, "Read failed");
                    break;
                }
            },
        }
    }

    state.router.on_disconnect(&id);
}
