use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use keyop_core::{Envelope, KeyopError};
use keyop_messenger::Messenger;
use keyop_protocol::{Message as WireMessage, WsFrame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const ACK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct WsBridgeServerConfig {
    pub bind: SocketAddr,
    pub cert_dir: PathBuf,
    /// Channels this server is configured to serve, keyed by name, with
    /// the subscriber max-age to apply when a client first subscribes.
    pub served_channels: HashMap<String, Option<chrono::Duration>>,
}

type WriteHalf<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, TungsteniteMessage>>>;

/// Runs the mTLS WebSocket bridge server until `cancel` fires. One task
/// per accepted connection.
pub async fn run_server(
    cfg: WsBridgeServerConfig,
    messenger: Arc<Messenger>,
    cancel: CancellationToken,
) -> Result<(), KeyopError> {
    let tls_cfg = keyop_core::tls::server_config(&cfg.cert_dir)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_cfg));
    let listener = TcpListener::bind(cfg.bind)
        .await
        .map_err(KeyopError::StorageIo)?;
    info!(bind = %cfg.bind, "ws bridge server listening");

    let served: Arc<HashMap<String, Option<chrono::Duration>>> = Arc::new(cfg.served_channels);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => { warn!(error = %e, "accept failed"); continue; }
                };
                let acceptor = acceptor.clone();
                let messenger = messenger.clone();
                let served = served.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => { warn!(%peer, error = %e, "tls handshake failed"); return; }
                    };
                    let ws_stream = match tokio_tungstenite::accept_async(tls_stream).await {
                        Ok(s) => s,
                        Err(e) => { warn!(%peer, error = %e, "ws handshake failed"); return; }
                    };
                    handle_connection(ws_stream, messenger, served, conn_cancel).await;
                });
            }
            () = cancel.cancelled() => {
                info!("ws bridge server shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection<S>(
    ws_stream: WebSocketStream<S>,
    messenger: Arc<Messenger>,
    served_channels: Arc<HashMap<String, Option<chrono::Duration>>>,
    cancel: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (write, mut read) = ws_stream.split();
    let write: WriteHalf<S> = Arc::new(Mutex::new(write));
    let ack_notify = Arc::new(Notify::new());
    // Serializes message delivery across every subscribed channel on
    // this connection: at most one outstanding, un-acked `message`
    // frame at a time (see the ACK-pairing decision in DESIGN.md).
    let send_gate = Arc::new(Mutex::new(()));

    let mut pending_resumes: HashMap<String, (String, u64)> = HashMap::new();
    let mut active: HashMap<String, keyop_messenger::Subscription> = HashMap::new();

    let ping_write = write.clone();
    let ping_cancel = cancel.clone();
    let ping_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut w = ping_write.lock().await;
                    if w.send(TungsteniteMessage::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
                () = ping_cancel.cancelled() => return,
            }
        }
    });

    loop {
        tokio::select! {
            frame = read.next() => {
                let Some(frame) = frame else { break };
                let Ok(frame) = frame else { break };
                let text = match frame {
                    TungsteniteMessage::Text(t) => t,
                    TungsteniteMessage::Close(_) => break,
                    TungsteniteMessage::Pong(_) | TungsteniteMessage::Ping(_) => continue,
                    _ => continue,
                };
                let Ok(parsed) = WsFrame::from_json(&text) else {
                    warn!("dropping unparseable ws frame");
                    continue;
                };
                match parsed {
                    WsFrame::Resume(r) => {
                        pending_resumes.insert(r.queue.clone(), (r.file_name, r.offset));
                    }
                    WsFrame::Subscribe(sub) => {
                        reconcile_subscriptions(
                            &sub.channels,
                            &served_channels,
                            &messenger,
                            &mut pending_resumes,
                            &mut active,
                            write.clone(),
                            send_gate.clone(),
                            ack_notify.clone(),
                        ).await;
                    }
                    WsFrame::Ack(_) => {
                        ack_notify.notify_one();
                    }
                    WsFrame::Message(_) => {
                        warn!("client sent a message frame, which is server-to-client only");
                    }
                }
            }
            () = cancel.cancelled() => break,
        }
    }

    ping_task.abort();
    for (_, sub) in active {
        sub.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_subscriptions<S>(
    wanted: &[String],
    served_channels: &HashMap<String, Option<chrono::Duration>>,
    messenger: &Arc<Messenger>,
    pending_resumes: &mut HashMap<String, (String, u64)>,
    active: &mut HashMap<String, keyop_messenger::Subscription>,
    write: WriteHalf<S>,
    send_gate: Arc<Mutex<()>>,
    ack_notify: Arc<Notify>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let effective: Vec<&String> = wanted
        .iter()
        .filter(|c| served_channels.contains_key(c.as_str()))
        .collect();

    for removed in active.keys().cloned().collect::<Vec<_>>() {
        if !effective.iter().any(|c| **c == removed) {
            if let Some(sub) = active.remove(&removed) {
                sub.cancel();
            }
        }
    }

    for channel in effective {
        if active.contains_key(channel) {
            continue;
        }
        let reader_name = format!("ws_{}", Uuid::new_v4());
        if let Some((file_name, offset)) = pending_resumes.remove(channel) {
            if let Err(e) = messenger
                .set_reader_state(channel, &reader_name, file_name, offset)
                .await
            {
                warn!(channel, error = %e, "failed to apply resume cursor");
            }
        } else if let Err(e) = messenger.seek_to_end(channel, &reader_name).await {
            warn!(channel, error = %e, "failed to seek new subscriber to end");
        }

        let channel_name = channel.clone();
        let write = write.clone();
        let send_gate = send_gate.clone();
        let ack_notify = ack_notify.clone();
        let handler: keyop_messenger::EnvelopeHandler = Arc::new(move |envelope, file_name, offset| {
            let channel_name = channel_name.clone();
            let write = write.clone();
            let send_gate = send_gate.clone();
            let ack_notify = ack_notify.clone();
            Box::pin(async move {
                deliver_one(channel_name, write, send_gate, ack_notify, envelope, file_name, offset).await
            })
        });

        let max_age = served_channels.get(channel.as_str()).copied().flatten();
        match messenger
            .subscribe_extended(reader_name, channel.clone(), max_age, handler)
            .await
        {
            Ok(sub) => {
                active.insert(channel.clone(), sub);
            }
            Err(e) => warn!(channel, error = %e, "failed to subscribe to channel"),
        }
    }
}

async fn deliver_one<S>(
    queue: String,
    write: WriteHalf<S>,
    send_gate: Arc<Mutex<()>>,
    ack_notify: Arc<Notify>,
    payload: Envelope,
    file_name: String,
    offset: u64,
) -> Result<(), KeyopError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let _permit = send_gate.lock().await;
    let frame = WsFrame::Message(WireMessage {
        queue,
        file_name,
        offset,
        payload,
    });
    let json = frame
        .to_json()
        .map_err(|e| KeyopError::HandlerFailed(e.to_string()))?;

    {
        let mut w = write.lock().await;
        w.send(TungsteniteMessage::Text(json.into()))
            .await
            .map_err(|e| KeyopError::Transient(e.to_string()))?;
    }

    tokio::time::timeout(ACK_TIMEOUT, ack_notify.notified())
        .await
        .map_err(|_| KeyopError::AckTimeout(ACK_TIMEOUT))
}
