use futures_util::{SinkExt, StreamExt};
use keyop_core::KeyopError;
use keyop_messenger::Messenger;
use keyop_messenger::cursor::ReaderCursor;
use keyop_protocol::{Resume, Subscribe, WsFrame};
use keyop_state::StateStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls::ClientConfig;
use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct WsBridgeClientConfig {
    pub server_url: String,
    pub cert_dir: PathBuf,
    pub channels: Vec<String>,
    /// Hint host: an incoming envelope whose route already contains this
    /// host is dropped rather than re-published locally (loop suppression).
    pub route_loop_skip_host: Option<String>,
}

fn cursor_key(channel: &str) -> String {
    format!("remote_{channel}")
}

/// Connects to a WebSocket bridge server and keeps the connection alive,
/// reconnecting with backoff, until `cancel` fires. Every `message` frame
/// received is appended to the local bus and, absent a loop, acked;
/// remote cursor position is persisted through `cursor_store` so a
/// reconnect resumes rather than replays from the start.
pub async fn run_client(
    cfg: WsBridgeClientConfig,
    messenger: Arc<Messenger>,
    cursor_store: StateStore,
    cancel: CancellationToken,
) -> Result<(), KeyopError> {
    let tls_cfg = Arc::new(keyop_core::tls::client_config(&cfg.cert_dir)?);

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match run_one_connection(&cfg, &messenger, &cursor_store, tls_cfg.clone(), &cancel).await {
            Ok(()) => info!("ws bridge connection closed cleanly"),
            Err(e) => warn!(error = %e, "ws bridge connection failed, will retry"),
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            () = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn run_one_connection(
    cfg: &WsBridgeClientConfig,
    messenger: &Arc<Messenger>,
    cursor_store: &StateStore,
    tls_cfg: Arc<ClientConfig>,
    cancel: &CancellationToken,
) -> Result<(), KeyopError> {
    let connector = Connector::Rustls(tls_cfg);
    let (ws_stream, _resp) = tokio_tungstenite::connect_async_tls_with_config(
        &cfg.server_url,
        None,
        false,
        Some(connector),
    )
    .await
    .map_err(|e| KeyopError::Transient(format!("connecting to {}: {e}", cfg.server_url)))?;

    drive_connection(ws_stream, cfg, messenger, cursor_store, cancel).await
}

/// The handshake and read/ack loop for an already-established
/// connection, independent of how it was set up (TLS in production,
/// plain TCP in tests).
async fn drive_connection<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    cfg: &WsBridgeClientConfig,
    messenger: &Arc<Messenger>,
    cursor_store: &StateStore,
    cancel: &CancellationToken,
) -> Result<(), KeyopError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    for channel in &cfg.channels {
        if let Ok(cursor) = cursor_store.load::<ReaderCursor>(&cursor_key(channel)).await {
            let frame = WsFrame::Resume(Resume {
                queue: channel.clone(),
                file_name: cursor.file_name,
                offset: cursor.offset,
            });
            send_frame(&mut write, &frame).await?;
        }
    }
    send_frame(
        &mut write,
        &WsFrame::Subscribe(Subscribe {
            channels: cfg.channels.clone(),
        }),
    )
    .await?;

    loop {
        tokio::select! {
            frame = read.next() => {
                let Some(frame) = frame else { return Ok(()) };
                let frame = frame.map_err(|e| KeyopError::Transient(e.to_string()))?;
                let text = match frame {
                    TungsteniteMessage::Text(t) => t,
                    TungsteniteMessage::Close(_) => return Ok(()),
                    TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => continue,
                    _ => continue,
                };
                let Ok(parsed) = WsFrame::from_json(&text) else {
                    warn!("dropping unparseable ws frame");
                    continue;
                };
                let WsFrame::Message(msg) = parsed else {
                    continue;
                };

                let is_loop = cfg
                    .route_loop_skip_host
                    .as_deref()
                    .is_some_and(|host| msg.payload.route_contains_host(host));

                if is_loop {
                    debug!(uuid = %msg.payload.uuid, "loop guard: not re-publishing locally");
                } else if let Err(e) = messenger.send(msg.payload).await {
                    warn!(error = %e, "failed to publish envelope received over ws bridge");
                    return Err(e);
                }

                cursor_store
                    .save(
                        &cursor_key(&msg.queue),
                        &ReaderCursor {
                            file_name: msg.file_name,
                            offset: msg.offset,
                        },
                    )
                    .await?;

                send_frame(&mut write, &WsFrame::ack()).await?;
            }
            () = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn send_frame<S>(
    write: &mut futures_util::stream::SplitSink<S, TungsteniteMessage>,
    frame: &WsFrame,
) -> Result<(), KeyopError>
where
    S: futures_util::Sink<TungsteniteMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = frame.to_json()?;
    write
        .send(TungsteniteMessage::Text(json.into()))
        .await
        .map_err(|e| KeyopError::Transient(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyop_core::{Envelope, RealClock, RealOs};
    use keyop_protocol::Message as WireMessage;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn new_messenger(dir: &TempDir) -> Arc<Messenger> {
        Arc::new(
            Messenger::new(dir.path(), Arc::new(RealOs), Arc::new(RealClock), "wsc", "test").unwrap(),
        )
    }

    fn base_cfg(channels: &[&str]) -> WsBridgeClientConfig {
        WsBridgeClientConfig {
            server_url: String::new(),
            cert_dir: PathBuf::new(),
            channels: channels.iter().map(|s| s.to_string()).collect(),
            route_loop_skip_host: Some("thishost".to_string()),
        }
    }

    #[tokio::test]
    async fn subscribes_then_publishes_pushed_message_and_acks() {
        let local_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let messenger = new_messenger(&local_dir);
        let cursor_store = StateStore::new(state_dir.path());
        let cfg = base_cfg(&["events"]);
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut write, mut read) = ws.split();

            // subscribe frame, no resume for a fresh reader
            let frame = read.next().await.unwrap().unwrap();
            let TungsteniteMessage::Text(text) = frame else {
                panic!("expected text")
            };
            let WsFrame::Subscribe(sub) = WsFrame::from_json(&text).unwrap() else {
                panic!("expected subscribe first")
            };
            assert_eq!(sub.channels, vec!["events".to_string()]);

            let mut env = Envelope::new("events");
            env.text = "pushed".into();
            let msg = WsFrame::Message(WireMessage {
                queue: "events".to_string(),
                file_name: "20260728.jsonl".to_string(),
                offset: 99,
                payload: env,
            });
            write
                .send(TungsteniteMessage::Text(msg.to_json().unwrap().into()))
                .await
                .unwrap();

            let ack_frame = read.next().await.unwrap().unwrap();
            let TungsteniteMessage::Text(ack_text) = ack_frame else {
                panic!("expected text")
            };
            assert!(matches!(
                WsFrame::from_json(&ack_text).unwrap(),
                WsFrame::Ack(_)
            ));
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (ws_stream, _resp) = tokio_tungstenite::client_async(format!("ws://{addr}"), stream)
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            drive_connection(ws_stream, &cfg, &messenger, &cursor_store, &cancel),
        )
        .await
        .ok();

        server_task.await.unwrap();

        let cursor: ReaderCursor = cursor_store.load("remote_events").await.unwrap();
        assert_eq!(cursor.offset, 99);

        // the pushed envelope should now be on the local bus
        let events_dir = local_dir.path().join("events");
        let file_name = std::fs::read_dir(&events_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.path().extension().and_then(|s| s.to_str()) == Some("jsonl"))
            .unwrap()
            .file_name()
            .to_string_lossy()
            .into_owned();
        let contents = std::fs::read_to_string(events_dir.join(file_name)).unwrap();
        assert!(contents.contains("pushed"));
    }

    #[tokio::test]
    async fn loop_guarded_message_is_acked_but_not_republished() {
        let local_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let messenger = new_messenger(&local_dir);
        let cursor_store = StateStore::new(state_dir.path());
        let cfg = base_cfg(&["events"]);
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut write, mut read) = ws.split();
            let _subscribe = read.next().await.unwrap().unwrap();

            let mut env = Envelope::new("events");
            env.text = "looped".into();
            env.append_route_stamp("thishost:wss:main".to_string());
            let msg = WsFrame::Message(WireMessage {
                queue: "events".to_string(),
                file_name: "20260728.jsonl".to_string(),
                offset: 1,
                payload: env,
            });
            write
                .send(TungsteniteMessage::Text(msg.to_json().unwrap().into()))
                .await
                .unwrap();
            let _ack = read.next().await.unwrap().unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (ws_stream, _resp) = tokio_tungstenite::client_async(format!("ws://{addr}"), stream)
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            drive_connection(ws_stream, &cfg, &messenger, &cursor_store, &cancel),
        )
        .await
        .ok();
        server_task.await.unwrap();

        let events_dir = local_dir.path().join("events");
        assert!(
            !events_dir.exists(),
            "a looped envelope must never be republished locally"
        );
    }
}
