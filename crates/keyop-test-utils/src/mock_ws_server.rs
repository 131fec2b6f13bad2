// A mock WebSocket server for testing keyop-ws-bridge clients.
//
// Accepts plaintext (non-TLS) connections on ws://127.0.0.1:<port>,
// echoes back an `ack` for every `message` frame it receives, and lets
// the test harness push `message` frames to the connected client on
// demand.

use futures_util::{SinkExt, StreamExt};
use keyop_protocol::WsFrame;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock WebSocket server for integration testing of bridge clients.
///
/// Binds to port 0 (random) and exposes the actual bound port. Each
/// test spins up its own isolated instance; connections are handled
/// one tokio task per connection, same as the real server.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Frames received from clients, across all connections.
    pub received: mpsc::UnboundedReceiver<WsFrame>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockWsServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            Self::accept_loop(listener, tx).await;
        });

        Ok(Self {
            addr,
            received: rx,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<WsFrame>) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _ = Self::handle_connection(stream, tx).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        tx: mpsc::UnboundedSender<WsFrame>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        while let Some(msg_result) = read.next().await {
            let msg = msg_result?;
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                Message::Ping(data) => {
                    write.send(Message::Pong(data)).await?;
                    continue;
                }
                _ => continue,
            };

            let frame: WsFrame = serde_json::from_str(&text)?;
            match &frame {
                WsFrame::Message(_) => {
                    let ack = WsFrame::ack().to_json()?;
                    write.send(Message::Text(ack.into())).await?;
                }
                _ => {}
            }
            let _ = tx.send(frame);
        }

        Ok(())
    }
}
