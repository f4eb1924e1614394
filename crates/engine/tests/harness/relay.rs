//! Minimal WebSocket relay and viewer client
//!
//! The relay accepts one host (first frame `register-host`) and any number
//! of viewers (first frame `{"type":"join","peerId":..}`). Viewer frames are
//! stamped with the viewer's id and forwarded to the host; host frames
//! carrying a `peerId` go to that viewer. Join and disconnect become
//! `peer-joined` / `peer-left` for the host.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

#[derive(Default)]
struct Peers {
    host: Option<mpsc::UnboundedSender<String>>,
    viewers: HashMap<String, mpsc::UnboundedSender<String>>,
}

/// Relay server on 127.0.0.1 with a random port
pub struct Relay {
    addr: SocketAddr,
    peers: Arc<Mutex<Peers>>,
    task: JoinHandle<()>,
}

impl Relay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay address");
        let peers = Arc::new(Mutex::new(Peers::default()));

        let accept_peers = peers.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, remote)) = listener.accept().await {
                debug!("Relay accepted {}", remote);
                tokio::spawn(serve(stream, accept_peers.clone()));
            }
        });

        info!("Relay listening on {}", addr);
        Self { addr, peers, task }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn has_host(&self) -> bool {
        self.peers.lock().host.is_some()
    }

    pub fn viewer_count(&self) -> usize {
        self.peers.lock().viewers.len()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, peers: Arc<Mutex<Peers>>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut role: Option<Option<String>> = None;

    while let Some(Ok(frame)) = source.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(mut value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        let kind = value["type"].as_str().map(str::to_string);
        match (role.clone(), kind.as_deref()) {
            (None, Some("register-host")) => {
                peers.lock().host = Some(tx.clone());
                let _ = tx.send(json!({"type": "registered", "role": "host"}).to_string());
                role = Some(None);
            }
            (None, Some("join")) => {
                let Some(peer_id) = value["peerId"].as_str().map(str::to_string) else {
                    continue;
                };
                let host = {
                    let mut peers = peers.lock();
                    peers.viewers.insert(peer_id.clone(), tx.clone());
                    peers.host.clone()
                };
                if let Some(host) = host {
                    let _ = host.send(json!({"type": "peer-joined", "peerId": peer_id}).to_string());
                }
                role = Some(Some(peer_id));
            }
            (Some(None), Some("ping")) => {
                let _ = tx.send(json!({"type": "pong"}).to_string());
            }
            (Some(None), _) => {
                let target = value["peerId"]
                    .as_str()
                    .and_then(|peer| peers.lock().viewers.get(peer).cloned());
                if let Some(viewer) = target {
                    let _ = viewer.send(text);
                }
            }
            (Some(Some(peer_id)), _) => {
                value["peerId"] = json!(peer_id);
                let host = peers.lock().host.clone();
                if let Some(host) = host {
                    let _ = host.send(value.to_string());
                }
            }
            (None, _) => {}
        }
    }

    match role {
        Some(Some(peer_id)) => {
            let host = {
                let mut peers = peers.lock();
                peers.viewers.remove(&peer_id);
                peers.host.clone()
            };
            if let Some(host) = host {
                let _ = host.send(json!({"type": "peer-left", "peerId": peer_id}).to_string());
            }
        }
        Some(None) => {
            let viewers: Vec<_> = {
                let mut peers = peers.lock();
                peers.host = None;
                peers.viewers.values().cloned().collect()
            };
            for viewer in viewers {
                let _ = viewer.send(json!({"type": "host-disconnected"}).to_string());
            }
        }
        None => {}
    }

    drop(tx);
    let _ = writer.await;
}

/// Browser-side viewer speaking to the relay
pub struct Viewer {
    pub peer_id: String,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Viewer {
    pub async fn join(url: &str, peer_id: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("viewer connect");
        let (mut sink, mut source) = ws.split();

        let (tx, mut outgoing) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = outgoing.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (incoming, rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = source.next().await {
                if let Message::Text(text) = frame {
                    if incoming.send(text).is_err() {
                        break;
                    }
                }
            }
        });

        let viewer = Self {
            peer_id: peer_id.to_string(),
            tx,
            rx,
        };
        viewer.send(json!({"type": "join", "peerId": peer_id}));
        viewer
    }

    pub fn send(&self, message: Value) {
        let _ = self.tx.send(message.to_string());
    }

    /// Next message of the given `type`, skipping others
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let text = self.rx.recv().await.expect("relay closed");
                let value: Value = serde_json::from_str(&text).expect("relay sent invalid JSON");
                if value["type"] == kind {
                    return value;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("viewer {} got no {} message", self.peer_id, kind))
    }

    /// Close the connection
    pub fn leave(self) {
        drop(self.tx);
    }
}
