//! Remote-client monitor: connects to a remote source, receives the change
//! stream, and applies it through the local syncer.
//!
//! Task layout per session: the receive loop (sole transport reader), the
//! processor (sole queue consumer, performs filesystem effects), an
//! optional interval cron driving full syncs, a shutdown watcher, and the
//! write-coalescer. Auth re-sends are spawned on demand and never retained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::auth::User;
use crate::contract::{param, Action, Message, MonitorMessage};
use crate::eventlog::{Event, EventLog};
use crate::ignore::IgnorePolicy;
use crate::protocol::timeouts;
use crate::queue::MessageQueue;
use crate::retry::Retry;
use crate::session::{ControlSession, Dispatched};
use crate::syncer::{is_not_found, Syncer};
use crate::transport::TranClient;
use crate::vfs::Vfs;

/// Queue depth at which pressure is logged.
const QUEUE_DEPTH_WARN: usize = 1000;

/// Connection lifecycle, tracked for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    Connected,
    Authenticating,
    Ready,
    Broken,
    Closed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Broken => "broken",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// In-flight file materializations, keyed by fetch URL. The processor
/// defers a Write whose predecessor has not settled yet (debounce).
#[derive(Default)]
pub struct WriteTracker {
    entries: parking_lot::Mutex<HashMap<String, WriteEntry>>,
}

struct WriteEntry {
    size: i64,
    updated: Instant,
}

impl WriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_write(&self, path: &str, size: i64) {
        let mut entries = self.entries.lock();
        entries.insert(
            path.to_string(),
            WriteEntry {
                size,
                updated: Instant::now(),
            },
        );
    }

    pub fn remove_write(&self, path: &str) {
        self.entries.lock().remove(path);
    }

    /// True when no write is in flight for `path`, or the last one has been
    /// quiet for at least `window`.
    pub fn settled(&self, path: &str, window: Duration) -> bool {
        self.entries
            .lock()
            .get(path)
            .map(|e| e.updated.elapsed() >= window)
            .unwrap_or(true)
    }

    /// Drop entries quiet for longer than `max_age`; returns how many.
    pub fn prune(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.updated.elapsed() < max_age);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn size_of(&self, path: &str) -> Option<i64> {
        self.entries.lock().get(path).map(|e| e.size)
    }
}

/// Handle returned by [`RemoteClientMonitor::start`]; resolves when the
/// monitor has shut down.
pub struct Wait {
    rx: mpsc::Receiver<Result<()>>,
}

impl Wait {
    pub async fn wait(mut self) -> Result<()> {
        self.rx.recv().await.unwrap_or(Ok(()))
    }
}

#[derive(Clone)]
struct Done {
    tx: mpsc::Sender<Result<()>>,
}

impl Done {
    fn done(&self) {
        let _ = self.tx.try_send(Ok(()));
    }

    fn done_with_error(&self, err: anyhow::Error) {
        let _ = self.tx.try_send(Err(err));
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    /// Run one full sync, then shut down.
    pub sync_once: bool,
    /// Periodically trigger full syncs.
    pub sync_interval: Option<Duration>,
    /// Debounce window for in-flight writes; `None` processes as soon as
    /// the queue is non-empty.
    pub settle_window: Option<Duration>,
}

pub struct RemoteClientMonitor {
    session: Arc<ControlSession>,
    syncer: Arc<dyn Syncer>,
    retry: Retry,
    config: MonitorConfig,
    ignore: Arc<dyn IgnorePolicy>,
    event_log: Arc<EventLog>,
    queue: Arc<MessageQueue>,
    writes: Arc<WriteTracker>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    state: parking_lot::Mutex<ConnState>,
}

impl RemoteClientMonitor {
    pub fn new(
        source: &Vfs,
        syncer: Arc<dyn Syncer>,
        retry: Retry,
        config: MonitorConfig,
        users: Vec<User>,
        event_log: EventLog,
        ignore: Arc<dyn IgnorePolicy>,
    ) -> Result<Arc<Self>> {
        if !source.is_remote() {
            bail!("monitor source must be a remote location: {}", source.original());
        }
        let client = TranClient::new(source.host(), source.port(), source.tls());
        let session = Arc::new(ControlSession::new(client, users, retry.clone()));
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            session,
            syncer,
            retry,
            config,
            ignore,
            event_log: Arc::new(event_log),
            queue: Arc::new(MessageQueue::new()),
            writes: Arc::new(WriteTracker::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
            state: parking_lot::Mutex::new(ConnState::Init),
        }))
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn set_state(&self, next: ConnState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(from = %*state, to = %next, "monitor state");
            *state = next;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Connect → receive loop → auth → either one-shot sync or the
    /// long-running task set. Returns a handle that resolves on shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<Wait> {
        self.set_state(ConnState::Connecting);
        self.session.client().connect().await?;
        self.set_state(ConnState::Connected);

        let (done_tx, done_rx) = mpsc::channel(1);
        let done = Done { tx: done_tx };
        self.spawn_shutdown_watcher(done.clone());
        self.spawn_receive(done.clone());

        self.set_state(ConnState::Authenticating);
        self.session.auth().await?;
        self.set_state(ConnState::Ready);

        if self.config.sync_once {
            self.sync().await?;
            self.shutdown()?;
            return Ok(Wait { rx: done_rx });
        }

        if let Some(period) = self.config.sync_interval {
            self.spawn_cron(period);
        }
        self.spawn_processor(done.clone());
        self.spawn_coalescer();

        Ok(Wait { rx: done_rx })
    }

    /// Full sync: ask the server for its info, then hand the remote root to
    /// the syncer's SyncOnce.
    pub async fn sync(&self) -> Result<()> {
        let info = self.session.fetch_info().await?;
        let root = format!("{}{}", info.server_addr, info.source_path);
        self.syncer
            .sync_once(&root)
            .await
            .with_context(|| format!("sync once {}", root))
    }

    /// Signal cooperative shutdown; tasks exit on their next iteration.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(true).ok();
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(ConnState::Closed);
        self.session.client().close().await
    }

    fn spawn_shutdown_watcher(self: &Arc<Self>, done: Done) {
        let this = self.clone();
        let mut rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if rx.wait_for(|s| *s).await.is_ok() {
                if let Err(e) = this.close().await {
                    tracing::error!(error = %e, "close remote client monitor error");
                }
                done.done();
            }
        });
    }

    /// The receive loop: sole reader of the transport. Survives disconnects
    /// via reconnect + re-auth; protocol noise is logged and dropped.
    fn spawn_receive(self: &Arc<Self>, done: Done) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut err_count: u64 = 0;
            loop {
                if this.is_closed() {
                    if !this.shutdown_requested() {
                        done.done_with_error(anyhow::anyhow!("remote monitor is closed"));
                    }
                    break;
                }
                match this.session.client().read_all().await {
                    Err(e) => {
                        if this.is_closed() || this.shutdown_requested() {
                            break;
                        }
                        tracing::error!(error = %e, "remote client monitor read data error");
                        if this.session.client().is_closed() {
                            this.handle_disconnect().await;
                            err_count = 0;
                        } else {
                            err_count += 1;
                            let nap = timeouts::adaptive_read_sleep(err_count);
                            if !nap.is_zero() {
                                sleep(nap).await;
                            }
                        }
                    }
                    Ok(frame) => {
                        err_count = 0;
                        match this.session.dispatch(frame) {
                            Dispatched::Sync(msg) => {
                                this.queue.push_back(msg);
                                let depth = this.queue.len();
                                if depth > QUEUE_DEPTH_WARN {
                                    tracing::debug!(depth, "message queue pressure");
                                }
                            }
                            Dispatched::Unauthorized => this.relogin_in_place(),
                            _ => {}
                        }
                    }
                }
            }
        });
    }

    /// Reconnect with backoff, then re-auth if a user is configured.
    async fn handle_disconnect(self: &Arc<Self>) {
        self.session.set_authorized(false);
        self.set_state(ConnState::Broken);
        let client = self.session.client().clone();
        tracing::debug!(
            host = client.host(),
            port = client.port(),
            "try reconnect to server"
        );
        self.set_state(ConnState::Connecting);
        let retry = self
            .retry
            .clone()
            .with_shutdown(self.shutdown_tx.subscribe());
        let label = format!("client reconnect to {}:{}", client.host(), client.port());
        let res = retry
            .do_retry(
                || {
                    let client = client.clone();
                    async move {
                        if client.is_closed() {
                            client.connect().await
                        } else {
                            Ok(())
                        }
                    }
                },
                &label,
            )
            .await;
        if res.is_err() || self.shutdown_requested() {
            return;
        }
        self.set_state(ConnState::Connected);
        if self.session.has_user() && !self.session.is_authorized() {
            self.set_state(ConnState::Authenticating);
            let this = self.clone();
            tokio::spawn(async move {
                match this.session.auth().await {
                    Ok(()) => this.set_state(ConnState::Ready),
                    Err(e) => tracing::error!(error = %e, "re-auth after reconnect failed"),
                }
            });
        } else {
            self.set_state(ConnState::Ready);
        }
    }

    /// Auth expiry on a streaming frame: re-login without tearing the
    /// connection down.
    fn relogin_in_place(self: &Arc<Self>) {
        self.session.set_authorized(false);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.session.auth().await {
                tracing::error!(error = %e, "re-login failed");
            }
        });
    }

    /// The processor: sole consumer of the message queue, performs the
    /// filesystem effects. One event's failure never halts the queue; after
    /// close, no further effect is applied regardless of queued messages.
    fn spawn_processor(self: &Arc<Self>, done: Done) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.is_closed() {
                    break;
                }
                if this.shutdown_requested() && this.queue.is_empty() {
                    break;
                }
                let Some(element) = this.queue.front() else {
                    sleep(timeouts::IDLE_QUEUE_POLL).await;
                    continue;
                };
                match this.process_front(&element).await {
                    FrontOutcome::Done => {
                        this.queue.remove_front();
                    }
                    FrontOutcome::Deferred(nap) => sleep(nap).await,
                }
            }
            done.done();
        });
    }

    async fn process_front(&self, element: &Message) -> FrontOutcome {
        let msg: MonitorMessage = match serde_json::from_slice(&element.data) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "client unmarshal data error");
                return FrontOutcome::Done;
            }
        };
        tracing::info!(message = %element.preview(), "client read request");

        if !msg.status.is_success() {
            tracing::error!(
                message = %msg.status.message,
                "remote monitor received the error message"
            );
            return FrontOutcome::Done;
        }
        if self
            .ignore
            .match_path(&msg.file_info.path, "remote client monitor", msg.action.as_str())
        {
            // ignore match: no syncer call, but the element is consumed
            return FrontOutcome::Done;
        }

        let url = build_fetch_url(&msg);

        // debounce: a Write whose predecessor is still materializing waits
        if msg.action == Action::Write {
            if let Some(window) = self.config.settle_window {
                if !self.writes.settled(&url, window) {
                    return FrontOutcome::Deferred(window.min(timeouts::IDLE_QUEUE_POLL));
                }
            }
        }

        // no filesystem effect after close, regardless of queued messages
        if self.is_closed() {
            return FrontOutcome::Done;
        }

        let result = match msg.action {
            Action::Create => self.syncer.create(&url).await,
            Action::Symlink => self.syncer.symlink(&msg.file_info.link_to, &url).await,
            Action::Write => {
                let mut r = self.syncer.create(&url).await;
                if let Err(e) = &r {
                    // a transient out-of-order delivery; the write settles it
                    if is_not_found(e) {
                        r = Ok(());
                    }
                }
                self.writes.add_write(&url, msg.file_info.size);
                r
            }
            Action::Remove => {
                self.writes.remove_write(&url);
                self.syncer.remove(&url).await
            }
            Action::Rename => self.syncer.rename(&url).await,
            Action::Chmod => self.syncer.chmod(&url).await,
        };

        if let Err(e) = self
            .event_log
            .write(Event::new(url.clone(), msg.action.as_str()))
        {
            tracing::error!(error = %e, "write event log error");
        }
        if let Err(e) = result {
            tracing::error!(
                action = msg.action.as_str(),
                url = %url,
                error = %e,
                "action execute error"
            );
        }
        FrontOutcome::Done
    }

    fn spawn_cron(self: &Arc<Self>, period: Duration) {
        let this = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if this.shutdown_requested() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if this.is_closed() {
                            break;
                        }
                        if let Err(e) = this.sync().await {
                            tracing::error!(error = %e, "periodic sync error");
                        }
                    }
                }
            }
        });
    }

    /// Prunes long-settled write entries so the tracker cannot grow without
    /// bound across a long session.
    fn spawn_coalescer(self: &Arc<Self>) {
        let Some(window) = self.config.settle_window else {
            return;
        };
        let this = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let tick = window.min(timeouts::IDLE_QUEUE_POLL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if this.shutdown_requested() {
                            break;
                        }
                    }
                    _ = sleep(tick) => {
                        let pruned = this.writes.prune(window.saturating_mul(8));
                        if pruned > 0 {
                            tracing::debug!(pruned, "settled writes pruned");
                        }
                    }
                }
            }
        });
    }
}

enum FrontOutcome {
    Done,
    Deferred(Duration),
}

/// Canonical fetch URL for a monitor message: base + escaped path + query.
/// Question marks inside the path are `%3F`-encoded before the query
/// separator, so downstream URL parsing is unambiguous.
pub fn build_fetch_url(msg: &MonitorMessage) -> String {
    let fi = &msg.file_info;
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    ser.append_pair(param::ATIME, &fi.a_time.to_string());
    ser.append_pair(param::CTIME, &fi.c_time.to_string());
    ser.append_pair(param::DIR, fi.is_dir.as_query_value());
    ser.append_pair(param::HASH, &fi.hash);
    if !fi.hash_values.is_empty() {
        ser.append_pair(
            param::HASH_VALUES,
            &serde_json::to_string(&fi.hash_values).unwrap_or_default(),
        );
    }
    ser.append_pair(param::MTIME, &fi.m_time.to_string());
    ser.append_pair(param::SIZE, &fi.size.to_string());
    format!(
        "{}{}?{}",
        msg.base_url,
        fi.path.replace('?', "%3F"),
        ser.finish()
    )
}
