//! VNC Bridge Controller: an in-process WebSocket-to-TCP relay in front of each VM's VNC port.
//!
//! Each bridge is its own supervised tokio task running a small axum router, tracked by a
//! `JoinHandle` so it can be torn down deterministically rather than left to drift as an
//! untracked background process.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vps_common::{Error, Result};

#[derive(Clone)]
struct BridgeState {
    vnc_port: u16,
}

struct Bridge {
    ws_port: u16,
    handle: JoinHandle<()>,
}

/// Tracks the set of running bridges, keyed by the VNC port they front.
#[derive(Clone, Default)]
pub struct VncBridgeController {
    bridges: Arc<Mutex<HashMap<u16, Bridge>>>,
}

impl VncBridgeController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a bridge listening on `vnc_port + WS_PORT_OFFSET` that forwards WebSocket frames
    /// to and from `localhost:vnc_port`. If a bridge for this port already exists, it is stopped
    /// first so a restart never leaves two listeners racing for the same port.
    pub async fn start(&self, vnc_port: u16) -> Result<()> {
        self.stop(vnc_port).await;

        let ws_port = vnc_port + vps_common::config::WS_PORT_OFFSET;
        let state = BridgeState { vnc_port };
        let app = Router::new()
            .route("/", get(shell))
            .route("/ws", get(ws_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", ws_port))
            .await
            .map_err(|e| Error::ExternalTool(format!("bind {ws_port}: {e}")))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(ws_port, error = %e, "vnc bridge server exited");
            }
        });

        if !self.verify_listening(ws_port).await {
            handle.abort();
            return Err(Error::Preflight(format!(
                "vnc bridge on {ws_port} did not come up"
            )));
        }

        self.bridges.lock().insert(vnc_port, Bridge { ws_port, handle });
        info!(vnc_port, ws_port, "vnc bridge started");
        Ok(())
    }

    async fn verify_listening(&self, ws_port: u16) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if TcpStream::connect(("127.0.0.1", ws_port)).await.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Stops the bridge for `vnc_port`, if one is running. Idempotent.
    pub async fn stop(&self, vnc_port: u16) {
        if let Some(bridge) = self.bridges.lock().remove(&vnc_port) {
            bridge.handle.abort();
            info!(vnc_port, ws_port = bridge.ws_port, "vnc bridge stopped");
        }
    }

    pub fn ws_port_for(&self, vnc_port: u16) -> Option<u16> {
        self.bridges.lock().get(&vnc_port).map(|b| b.ws_port)
    }
}

async fn shell() -> Html<&'static str> {
    Html(include_str!("vnc_shell.html"))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<BridgeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge(socket, state.vnc_port))
}

async fn bridge(ws: WebSocket, vnc_port: u16) {
    let tcp = match TcpStream::connect(("127.0.0.1", vnc_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(vnc_port, error = %e, "vnc bridge could not reach vnc server");
            return;
        }
    };

    let (tcp_read, tcp_write) = tcp.into_split();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let to_vnc = forward_ws_to_vnc(&mut ws_rx, tcp_write);
    let to_ws = forward_vnc_to_ws(tcp_read, &mut ws_tx);

    tokio::select! {
        _ = to_vnc => {}
        _ = to_ws => {}
    }
}

async fn forward_ws_to_vnc(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    mut tcp_write: tokio::net::tcp::OwnedWriteHalf,
) {
    use tokio::io::AsyncWriteExt;
    while let Some(Ok(msg)) = ws_rx.next().await {
        let bytes = match msg {
            Message::Binary(b) => b,
            Message::Text(t) => t.into_bytes(),
            Message::Close(_) => break,
            _ => continue,
        };
        if tcp_write.write_all(&bytes).await.is_err() {
            break;
        }
    }
}

async fn forward_vnc_to_ws(
    mut tcp_read: tokio::net::tcp::OwnedReadHalf,
    ws_tx: &mut futures::stream::SplitSink<WebSocket, Message>,
) {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match tcp_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if ws_tx.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_on_unknown_port_is_a_no_op() {
        let controller = VncBridgeController::new();
        controller.stop(5900).await;
        assert_eq!(controller.ws_port_for(5900), None);
    }
}
