//! The in-process, file-backed, multi-reader publish/subscribe bus.
//!
//! Channels are directories of day-rotated `YYYYMMDD.jsonl` files under
//! a configured data directory; each reader's position within a
//! channel is a small cursor file persisted through [`keyop_state`].
//! Tailing is signaled by an in-process [`tokio::sync::Notify`] with a
//! short poll fallback so a missed wakeup never stalls a reader for
//! longer than that.

pub mod cursor;
mod files;
pub mod stats;

use chrono::{DateTime, Utc};
use cursor::{CursorStore, ReaderCursor};
use futures_util::future::BoxFuture;
use keyop_core::{Clock, Envelope, KeyopError, Os};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use stats::{MessengerStats, StatsSnapshot};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const TAIL_POLL_FALLBACK: StdDuration = StdDuration::from_secs(1);
const HANDLER_RETRY_BACKOFF: StdDuration = StdDuration::from_millis(250);

/// A subscriber's handler: given a delivered envelope and the (day
/// file, next-offset) it was read from, returns whether it was handled.
/// An `Err` leaves the cursor unmoved, so the Messenger redelivers the
/// same line after a short backoff.
pub type EnvelopeHandler =
    Arc<dyn Fn(Envelope, String, u64) -> BoxFuture<'static, Result<(), KeyopError>> + Send + Sync>;

struct ChannelHandle {
    dir: PathBuf,
    /// Guards both the append itself and the per-channel monotonic
    /// timestamp invariant (`timestamp = max(now, last_published)`).
    write_gate: Mutex<DateTime<Utc>>,
    notify: Notify,
}

/// A running tail; drop or call [`Subscription::cancel`] to stop it.
pub struct Subscription {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the tail task to actually exit after cancellation.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

pub struct Messenger {
    data_dir: PathBuf,
    os: Arc<dyn Os>,
    clock: Arc<dyn Clock>,
    hostname: String,
    service_type: String,
    service_name: String,
    channels: RwLock<HashMap<String, Arc<ChannelHandle>>>,
    stats: Arc<MessengerStats>,
}

impl Messenger {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        os: Arc<dyn Os>,
        clock: Arc<dyn Clock>,
        service_type: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Result<Self, KeyopError> {
        let hostname = keyop_core::envelope::short_hostname(&os.hostname()?);
        Ok(Messenger {
            data_dir: data_dir.into(),
            os,
            clock,
            hostname,
            service_type: service_type.into(),
            service_name: service_name.into(),
            channels: RwLock::new(HashMap::new()),
            stats: Arc::new(MessengerStats::default()),
        })
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn local_route_stamp(&self) -> String {
        Envelope::route_stamp(&self.hostname, &self.service_type, &self.service_name)
    }

    async fn channel_handle(&self, channel_name: &str) -> Result<Arc<ChannelHandle>, KeyopError> {
        if let Some(h) = self.channels.read().await.get(channel_name) {
            return Ok(h.clone());
        }
        let mut channels = self.channels.write().await;
        if let Some(h) = channels.get(channel_name) {
            return Ok(h.clone());
        }
        let dir = self.data_dir.join(channel_name);
        self.os.mkdir_all(&dir)?;
        let handle = Arc::new(ChannelHandle {
            dir,
            write_gate: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
            notify: Notify::new(),
        });
        channels.insert(channel_name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Appends `envelope` to its channel, enriching it and stamping
    /// the local route hop, then wakes any tailers waiting on that
    /// channel.
    pub async fn send(&self, mut envelope: Envelope) -> Result<(), KeyopError> {
        if envelope.channel_name.is_empty() {
            return Err(KeyopError::InvalidArgument(
                "envelope.channel_name must be non-empty".into(),
            ));
        }
        let channel = self.channel_handle(&envelope.channel_name).await?;
        let mut last_published = channel.write_gate.lock().await;

        let now = self.clock.now();
        envelope.enrich(&self.hostname, now, *last_published);
        envelope.append_route_stamp(self.local_route_stamp());

        let day = envelope.timestamp.date_naive();
        let file_name = files::day_file_name(day);
        let path = channel.dir.join(&file_name);

        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        self.os.append_file(&path, &line)?;

        *last_published = envelope.timestamp;
        drop(last_published);

        self.stats.record_send();
        channel.notify.notify_waiters();
        debug!(channel = %envelope.channel_name, uuid = %envelope.uuid, "envelope sent");
        Ok(())
    }

    /// Shorthand for [`Messenger::subscribe_extended`] for handlers that
    /// don't need the source (file, offset).
    pub async fn subscribe(
        &self,
        reader_name: impl Into<String>,
        channel_name: impl Into<String>,
        max_age: Option<chrono::Duration>,
        handler: impl Fn(Envelope) -> BoxFuture<'static, Result<(), KeyopError>> + Send + Sync + 'static,
    ) -> Result<Subscription, KeyopError> {
        let handler = Arc::new(handler);
        self.subscribe_extended(
            reader_name,
            channel_name,
            max_age,
            Arc::new(move |env, _file, _offset| handler(env)),
        )
        .await
    }

    pub async fn subscribe_extended(
        &self,
        reader_name: impl Into<String>,
        channel_name: impl Into<String>,
        max_age: Option<chrono::Duration>,
        handler: EnvelopeHandler,
    ) -> Result<Subscription, KeyopError> {
        let reader_name = reader_name.into();
        let channel_name = channel_name.into();
        if channel_name.is_empty() {
            return Err(KeyopError::InvalidArgument("channel_name empty".into()));
        }
        let channel = self.channel_handle(&channel_name).await?;
        let cursor_store = CursorStore::new(&channel.dir);

        let cursor = match cursor_store.load(&reader_name).await {
            Ok(c) => c,
            Err(KeyopError::NotFound(_)) => {
                self.initial_cursor(&channel, max_age).await?
            }
            Err(e) => return Err(e),
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(tail_loop(TailCtx {
            os: self.os.clone(),
            clock: self.clock.clone(),
            channel,
            cursor_store,
            reader_name,
            max_age,
            handler,
            cancel: cancel.clone(),
            initial_cursor: cursor,
        }));

        Ok(Subscription { cancel, task })
    }

    async fn initial_cursor(
        &self,
        channel: &ChannelHandle,
        max_age: Option<chrono::Duration>,
    ) -> Result<ReaderCursor, KeyopError> {
        let now = self.clock.now();
        let file_name = match max_age {
            Some(age) if age > chrono::Duration::zero() => {
                files::oldest_file_within_max_age(self.os.as_ref(), &channel.dir, age, now)
                    .unwrap_or_else(|| files::day_file_name(now.date_naive()))
            }
            _ => files::day_file_name(now.date_naive()),
        };
        Ok(ReaderCursor {
            file_name,
            offset: 0,
        })
    }

    /// Atomically sets a reader's cursor, used by the WebSocket server
    /// when a client resumes at a remembered position.
    pub async fn set_reader_state(
        &self,
        channel_name: &str,
        reader_name: &str,
        file_name: String,
        offset: u64,
    ) -> Result<(), KeyopError> {
        let channel = self.channel_handle(channel_name).await?;
        let store = CursorStore::new(&channel.dir);
        store
            .save(reader_name, &ReaderCursor { file_name, offset })
            .await
    }

    /// Positions a reader at the end of the most recent day file —
    /// "from now" semantics with no replay.
    pub async fn seek_to_end(&self, channel_name: &str, reader_name: &str) -> Result<(), KeyopError> {
        let channel = self.channel_handle(channel_name).await?;
        let now = self.clock.now();
        let file_name = files::newest_file(self.os.as_ref(), &channel.dir)
            .unwrap_or_else(|| files::day_file_name(now.date_naive()));
        let offset = match self.os.stat(&channel.dir.join(&file_name)) {
            Ok(meta) => meta.len,
            Err(_) => 0,
        };
        let store = CursorStore::new(&channel.dir);
        store
            .save(reader_name, &ReaderCursor { file_name, offset })
            .await
    }
}

struct TailCtx {
    os: Arc<dyn Os>,
    clock: Arc<dyn Clock>,
    channel: Arc<ChannelHandle>,
    cursor_store: CursorStore,
    reader_name: String,
    max_age: Option<chrono::Duration>,
    handler: EnvelopeHandler,
    cancel: CancellationToken,
    initial_cursor: ReaderCursor,
}

async fn tail_loop(ctx: TailCtx) {
    let mut cursor = ctx.initial_cursor.clone();

    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        let path = ctx.channel.dir.join(&cursor.file_name);
        let bytes = ctx.os.read_file(&path).unwrap_or_default();
        let mut offset = cursor.offset.min(bytes.len() as u64);

        loop {
            let rest = &bytes[offset as usize..];
            let Some(newline_rel) = rest.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = &rest[..newline_rel];
            let next_offset = offset + newline_rel as u64 + 1;

            let envelope: Envelope = match serde_json::from_slice(line) {
                Ok(e) => e,
                Err(e) => {
                    warn!(file = %cursor.file_name, error = %e, "corrupt line, skipping");
                    offset = next_offset;
                    cursor.offset = offset;
                    if let Err(e) = ctx.cursor_store.save(&ctx.reader_name, &cursor).await {
                        warn!(error = %e, "failed to persist cursor past corrupt line");
                    }
                    continue;
                }
            };

            let skip_for_age = match ctx.max_age {
                Some(age) if age > chrono::Duration::zero() => {
                    ctx.clock.now() - envelope.timestamp > age
                }
                _ => false,
            };

            if skip_for_age {
                offset = next_offset;
                cursor.offset = offset;
                if let Err(e) = ctx.cursor_store.save(&ctx.reader_name, &cursor).await {
                    warn!(error = %e, "failed to persist cursor past aged-out line");
                }
                continue;
            }

            match (ctx.handler)(envelope, cursor.file_name.clone(), next_offset).await {
                Ok(()) => {
                    offset = next_offset;
                    cursor.offset = offset;
                    if let Err(e) = ctx.cursor_store.save(&ctx.reader_name, &cursor).await {
                        warn!(error = %e, "failed to persist cursor");
                    }
                }
                Err(e) => {
                    warn!(error = %e, reader = %ctx.reader_name, "handler failed, will retry");
                    tokio::select! {
                        _ = tokio::time::sleep(HANDLER_RETRY_BACKOFF) => {}
                        () = ctx.cancel.cancelled() => return,
                    }
                    // retry the same line on the next outer pass
                    break;
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            return;
        }

        if let Some(next) = files::next_file_after(ctx.os.as_ref(), &ctx.channel.dir, &cursor.file_name) {
            cursor.file_name = next;
            cursor.offset = 0;
            continue;
        }

        tokio::select! {
            () = ctx.channel.notify.notified() => {}
            () = tokio::time::sleep(TAIL_POLL_FALLBACK) => {}
            () = ctx.cancel.cancelled() => return,
        }
    }
}

/// Convenience for call sites that want a plain bool-style timeout
/// wrapper around an async op (used by the bridges for ack waits).
pub async fn with_timeout<T>(
    duration: StdDuration,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, KeyopError> {
    timeout(duration, fut)
        .await
        .map_err(|_| KeyopError::AckTimeout(duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyop_core::{RealClock, RealOs};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn new_messenger(dir: &TempDir) -> Messenger {
        Messenger::new(
            dir.path(),
            Arc::new(RealOs),
            Arc::new(RealClock),
            "svc",
            "test",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn local_pub_sub_delivers_enriched_envelope() {
        let dir = TempDir::new().unwrap();
        let m = new_messenger(&dir);

        let mut env = Envelope::new("c");
        env.text = "hello".into();
        m.send(env).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = m
            .subscribe(
                "r",
                "c",
                None,
                move |env| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(env);
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();

        let received = tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .expect("delivered in time")
            .unwrap();
        assert_eq!(received.text, "hello");
        assert!(!received.uuid.is_empty());
        assert!(!received.hostname.is_empty());
        sub.cancel();
        sub.join().await;

        let cursor_path = dir.path().join("c").join(".readers").join("r.json");
        assert!(cursor_path.exists());
    }

    #[tokio::test]
    async fn handler_error_triggers_redelivery_until_success() {
        let dir = TempDir::new().unwrap();
        let m = new_messenger(&dir);

        let mut env = Envelope::new("c");
        env.text = "once".into();
        m.send(env).await.unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let attempts_clone = attempts.clone();
        let sub = m
            .subscribe(
                "r",
                "c",
                None,
                move |env| {
                    let attempts = attempts_clone.clone();
                    let tx = tx.clone();
                    Box::pin(async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 3 {
                            return Err(KeyopError::HandlerFailed("not yet".into()));
                        }
                        let _ = tx.send(env);
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();

        let received = tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
            .await
            .expect("eventually delivered")
            .unwrap();
        assert_eq!(received.text, "once");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        sub.cancel();
        sub.join().await;
    }

    #[tokio::test]
    async fn seek_to_end_skips_prior_history() {
        let dir = TempDir::new().unwrap();
        let m = new_messenger(&dir);

        let mut old = Envelope::new("c");
        old.text = "old".into();
        m.send(old).await.unwrap();

        m.seek_to_end("c", "r").await.unwrap();

        let mut fresh = Envelope::new("c");
        fresh.text = "fresh".into();
        m.send(fresh).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = m
            .subscribe(
                "r",
                "c",
                None,
                move |env| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(env);
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();

        let received = tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .expect("delivered in time")
            .unwrap();
        assert_eq!(received.text, "fresh");
        sub.cancel();
        sub.join().await;
    }

    #[tokio::test]
    async fn send_stamps_local_route_hop() {
        let dir = TempDir::new().unwrap();
        let m = new_messenger(&dir);
        let mut env = Envelope::new("c");
        env.append_route_stamp("otherhost:wsc:main".into());
        m.send(env).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = m
            .subscribe(
                "r",
                "c",
                None,
                move |env| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(env);
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();
        let received = tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            received.route,
            vec!["otherhost:wsc:main".to_string(), m.local_route_stamp()]
        );
        sub.cancel();
        sub.join().await;
    }
}
