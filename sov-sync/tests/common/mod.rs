//! Scripted WebSocket server for driving the client end to end.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use sov_sync::config::ClientConfig;
use sov_sync::scheduler::BackoffPolicy;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(3);

/// One accepted client connection.
pub struct Peer {
    frames: mpsc::UnboundedReceiver<Value>,
    out: mpsc::UnboundedSender<Message>,
}

impl Peer {
    /// Next JSON frame sent by the client.
    pub async fn recv(&mut self) -> Value {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client connection closed")
    }

    /// Next frame whose `type` is not `ping`.
    pub async fn recv_non_ping(&mut self) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["type"] != "ping" {
                return frame;
            }
        }
    }

    /// True if the client sends nothing within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        timeout(wait, self.frames.recv()).await.is_err()
    }

    pub fn push(&self, value: Value) {
        self.push_raw(value.to_string());
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        let text: String = text.into();
        let _ = self.out.send(Message::Text(text.into()));
    }

    /// Send a close frame and drop the connection.
    pub fn close(&self) {
        let _ = self.out.send(Message::Close(None));
    }
}

pub struct MockServer {
    pub port: u16,
    peers: mpsc::UnboundedReceiver<Peer>,
}

impl MockServer {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Peer {
        timeout(WAIT, self.peers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped")
    }

    /// Client config pointing at this server with fast reconnects.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&format!("http://127.0.0.1:{}", self.port)).unwrap();
        config.backoff = BackoffPolicy {
            base: Duration::from_millis(20),
            ceiling: Duration::from_millis(200),
            floor: Duration::from_millis(10),
            jitter: 0.0,
        };
        config.connect_timeout = Duration::from_secs(2);
        config
    }
}

/// Start a server on a free port.
pub async fn start_test_server() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (peers_tx, peers) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let peers_tx = peers_tx.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut stream) = ws.split();
                let (frames_tx, frames) = mpsc::unbounded_channel();
                let (out, mut out_rx) = mpsc::unbounded_channel();
                if peers_tx.send(Peer { frames, out }).is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        msg = stream.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(value) = serde_json::from_str(text.as_str()) {
                                    let _ = frames_tx.send(value);
                                }
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        },
                        out = out_rx.recv() => match out {
                            Some(Message::Close(frame)) => {
                                let _ = sink.send(Message::Close(frame)).await;
                                break;
                            }
                            Some(msg) => {
                                if sink.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
    });

    MockServer { port, peers }
}
