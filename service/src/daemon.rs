//! The long-running half of the service.
//!
//! One listener accepts control-channel clients and spawns a [`DaemonSession`] for each.
//! Sessions only share state through the [`Dispatcher`].

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use bin_shared::known_dirs;
use bin_shared::signals::Terminate;
use futures::future::poll_fn;
use futures::task::{Context, Poll};
use parking_lot::Mutex;
use ringbuffer::{AllocRingBuffer, RingBuffer as _};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::ipc::{self, SocketId};
use crate::protocol::{
    LogEntry, LogLevel, Request, Response, ResponseBody, ServerMessage, ServiceStatus,
    TunnelStatus,
};
use crate::settings::Settings;

pub use session::{DaemonSession, SessionOk};

pub mod session;
mod tunnels;

/// Pushes a session may have queued before it counts as fallen behind.
pub const PUSH_QUEUE_LEN: usize = 256;

/// How long sessions get to say goodbye once we are terminating.
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the state every session shares.
///
/// Cheap to clone. All access to the log buffer, the tunnel table and the push
/// subscribers goes through one lock so pushes are published in the same order
/// as the changes they describe.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<DaemonState>,
    settings: Settings,
    install_dir: PathBuf,
    started_at: Instant,
}

struct DaemonState {
    logs: AllocRingBuffer<LogEntry>,
    tunnels: BTreeMap<u32, tunnels::TunnelRecord>,
    subscribers: BTreeMap<u64, mpsc::Sender<ServerMessage>>,
    next_session_id: u64,
}

/// Keeps a session subscribed to pushes. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    dispatcher: Dispatcher,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.inner.state.lock().subscribers.remove(&self.id);
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Dispatcher {
    pub fn new(settings: Settings, install_dir: PathBuf) -> Self {
        let state = DaemonState {
            logs: AllocRingBuffer::new(settings.log_capacity),
            tunnels: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            next_session_id: 0,
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                settings,
                install_dir,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn install_dir(&self) -> &Path {
        &self.inner.install_dir
    }

    /// Subscribes a new session to pushes.
    pub fn subscribe(&self) -> (Subscription, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(PUSH_QUEUE_LEN);
        let mut state = self.inner.state.lock();
        let id = state.next_session_id;
        state.next_session_id += 1;
        state.subscribers.insert(id, tx);

        (
            Subscription {
                id,
                dispatcher: self.clone(),
            },
            rx,
        )
    }

    /// Records a log line and pushes it to every session.
    pub fn append_log(&self, source: impl Into<String>, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            source: source.into(),
            level,
            time: unix_millis(),
            message: message.into(),
        };
        let mut state = self.inner.state.lock();
        state.logs.enqueue(entry.clone());
        state.publish(ServerMessage::LogAppend(vec![entry]));
    }

    /// Answers one request. Never fails, errors become `success: false` responses.
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::StatusQuery => Response::ok(ResponseBody::Status(self.status())),
            Request::LogGet => {
                let state = self.inner.state.lock();

                Response::ok(ResponseBody::Logs(state.logs.iter().cloned().collect()))
            }
            Request::LogClear => {
                self.inner.state.lock().logs.clear();

                Response::done("Log cleared")
            }
            Request::TunnelList => {
                let state = self.inner.state.lock();
                let tunnels = state
                    .tunnels
                    .iter()
                    .map(|(id, record)| record.status(*id))
                    .collect();

                Response::ok(ResponseBody::Tunnels(tunnels))
            }
            Request::TunnelStart { id } => tunnels::start(self, id),
            Request::TunnelStop { id } => tunnels::stop(self, id),
        }
    }

    fn status(&self) -> ServiceStatus {
        let state = self.inner.state.lock();

        ServiceStatus {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            uptime_secs: self.inner.started_at.elapsed().as_secs(),
            running_tunnels: state.tunnels.values().filter(|t| t.is_running()).count(),
            buffered_log_lines: state.logs.len(),
            sessions: state.subscribers.len(),
        }
    }

    /// Kills every tunnel client. Their exits are still published as they happen.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        let mut killed = 0;

        for record in state.tunnels.values_mut() {
            if record.kill() {
                killed += 1;
            }
        }

        tracing::info!(%killed, "Stopping tunnel clients");
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DaemonState) -> R) -> R {
        f(&mut self.inner.state.lock())
    }
}

impl DaemonState {
    /// Queues `message` for every session, dropping sessions whose queue is full.
    fn publish(&mut self, message: ServerMessage) {
        self.subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session = id, "Session fell behind on pushes, dropping it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn set_tunnel(&mut self, id: u32, record: tunnels::TunnelRecord) {
        let status: TunnelStatus = record.status(id);
        self.tunnels.insert(id, record);
        self.publish(ServerMessage::TunnelStatus(status));
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Routes this process' logs to a new file in `log_dir`, and to stdout if asked.
///
/// Keep the returned handle for as long as the process logs.
pub fn setup_logging(log_dir: &Path, directives: &str, stdout: bool) -> Result<logging::file::Handle> {
    let (layer, handle) = logging::file::layer(log_dir, "service");
    logging::setup_global_subscriber(directives, layer, stdout)
        .context("Failed to set up logging")?;
    tracing::info!(
        arch = std::env::consts::ARCH,
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %log_dir.display(),
        "Daemon logging started"
    );

    Ok(handle)
}

/// Builds a runtime and serves until the [`Terminate`] from `signals` fires.
pub fn block_on(dispatcher: Dispatcher, signals: impl FnOnce() -> Result<Terminate>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("daemon")
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let result = {
        // Signal handlers need a runtime to register with.
        let _guard = rt.enter();
        signals().and_then(|mut signals| rt.block_on(run(dispatcher, &mut signals)))
    };

    rt.shutdown_timeout(Duration::from_secs(1)); // Ensure we don't block forever on a task in the blocking pool.

    result
}

/// Binds the control channel and serves clients until `signals` fires.
///
/// The caller must already hold the instance lock.
pub async fn run(dispatcher: Dispatcher, signals: &mut Terminate) -> Result<()> {
    let logs = known_dirs::logs(dispatcher.install_dir());
    let freed = logging::cleanup::enforce_size_cap(&logs, dispatcher.settings().max_log_dir_bytes);
    if freed > 0 {
        tracing::info!(%freed, "Deleted old log files");
    }

    let server = ipc::Server::new(SocketId::Control).context("Failed to bind the control channel")?;

    #[cfg(target_os = "linux")]
    if let Err(error) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        tracing::debug!("Couldn't notify systemd: {error}");
    }

    dispatcher.append_log("service", LogLevel::Info, "Service started");

    serve(server, dispatcher, signals).await
}

enum Event {
    Accepted(Result<ipc::ServerStream>),
    SessionEnded,
    Terminate,
}

/// The listener loop, split out so tests can run it against a test socket.
pub async fn serve(
    mut server: ipc::Server,
    dispatcher: Dispatcher,
    signals: &mut Terminate,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut sessions = JoinSet::new();

    loop {
        let event = {
            // `next_client` is cancel-safe, so dropping it after another event loses nothing.
            let mut accept = pin!(server.next_client());

            poll_fn(|cx| next_event(cx, signals, &mut sessions, accept.as_mut())).await
        };

        match event {
            Event::Accepted(Ok(stream)) => {
                let session = DaemonSession::new(stream, dispatcher.clone(), cancel.child_token());
                tracing::debug!(id = session.id(), "Client connected");
                sessions.spawn(session.run());
            }
            Event::Accepted(Err(error)) => {
                tracing::warn!("Failed to accept a client: {error:#}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Event::SessionEnded => {}
            Event::Terminate => {
                tracing::info!("Caught SIGINT / SIGTERM / Ctrl+C / Stop, shutting down");
                break;
            }
        }
    }

    // Stop accepting before saying goodbye.
    drop(server);
    cancel.cancel();
    dispatcher.shutdown();

    if tokio::time::timeout(SESSION_SHUTDOWN_TIMEOUT, async {
        while sessions.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        tracing::warn!("Some sessions didn't end in time");
        sessions.abort_all();
    }

    Ok(())
}

fn next_event(
    cx: &mut Context<'_>,
    signals: &mut Terminate,
    sessions: &mut JoinSet<SessionOk>,
    accept: Pin<&mut impl Future<Output = Result<ipc::ServerStream>>>,
) -> Poll<Event> {
    if let Poll::Ready(()) = signals.poll_recv(cx) {
        return Poll::Ready(Event::Terminate);
    }
    if let Poll::Ready(Some(result)) = sessions.poll_join_next(cx) {
        match result {
            Ok(outcome) => tracing::debug!(?outcome, "Session ended"),
            Err(error) => tracing::error!("Session task failed: {error}"),
        }
        return Poll::Ready(Event::SessionEnded);
    }
    if let Poll::Ready(result) = accept.poll(cx) {
        return Poll::Ready(Event::Accepted(result));
    }

    Poll::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TunnelState;

    fn dispatcher(capacity: usize) -> Dispatcher {
        let settings = Settings {
            log_capacity: capacity,
            ..Settings::default()
        };

        Dispatcher::new(settings, std::env::temp_dir())
    }

    #[test]
    fn log_buffer_keeps_the_newest_lines() {
        let dispatcher = dispatcher(2);

        dispatcher.append_log("service", LogLevel::Info, "one");
        dispatcher.append_log("service", LogLevel::Warn, "two");
        dispatcher.append_log("tunnel:1", LogLevel::Error, "three");

        let response = dispatcher.handle(Request::LogGet);
        let ResponseBody::Logs(entries) = response.body else {
            panic!("Expected logs, got {response:?}");
        };
        let messages = entries.iter().map(|e| e.message.as_str()).collect::<Vec<_>>();
        assert_eq!(messages, ["two", "three"]);
        assert_eq!(entries[1].source, "tunnel:1");
    }

    #[test]
    fn log_clear_empties_the_buffer() {
        let dispatcher = dispatcher(8);
        dispatcher.append_log("service", LogLevel::Info, "one");

        assert!(dispatcher.handle(Request::LogClear).success);

        assert_eq!(
            dispatcher.handle(Request::LogGet).body,
            ResponseBody::Logs(vec![])
        );
    }

    #[test]
    fn status_counts_sessions_and_lines() {
        let dispatcher = dispatcher(8);
        let (_first, _rx1) = dispatcher.subscribe();
        let (second, _rx2) = dispatcher.subscribe();
        dispatcher.append_log("service", LogLevel::Info, "one");
        drop(second);

        let ResponseBody::Status(status) = dispatcher.handle(Request::StatusQuery).body else {
            panic!("Expected a status body");
        };
        assert_eq!(status.sessions, 1);
        assert_eq!(status.buffered_log_lines, 1);
        assert_eq!(status.running_tunnels, 0);
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn pushes_reach_every_subscriber() {
        let dispatcher = dispatcher(8);
        let (_a, mut rx_a) = dispatcher.subscribe();
        let (_b, mut rx_b) = dispatcher.subscribe();

        dispatcher.append_log("service", LogLevel::Info, "hello");

        for rx in [&mut rx_a, &mut rx_b] {
            let Ok(ServerMessage::LogAppend(entries)) = rx.try_recv() else {
                panic!("Expected a log push");
            };
            assert_eq!(entries[0].message, "hello");
        }
    }

    #[test]
    fn slow_subscriber_is_dropped() {
        let dispatcher = dispatcher(8);
        let (_slow, mut slow_rx) = dispatcher.subscribe();

        for i in 0..=PUSH_QUEUE_LEN {
            dispatcher.append_log("service", LogLevel::Info, format!("line {i}"));
        }

        let mut received = 0;
        while slow_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, PUSH_QUEUE_LEN);
        assert!(
            matches!(
                slow_rx.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            ),
            "The sender should be gone once the queue overflowed"
        );
        assert_eq!(dispatcher.with_state(|s| s.subscribers.len()), 0);
    }

    #[test]
    fn unknown_tunnels_cannot_be_stopped() {
        let dispatcher = dispatcher(8);

        let response = dispatcher.handle(Request::TunnelStop { id: 4 });

        assert!(!response.success);
        assert_eq!(
            dispatcher.handle(Request::TunnelList).body,
            ResponseBody::Tunnels(vec![])
        );
    }

    #[test]
    fn tunnel_changes_are_published() {
        let dispatcher = dispatcher(8);
        let (_sub, mut rx) = dispatcher.subscribe();

        dispatcher.with_state(|s| {
            s.set_tunnel(
                3,
                tunnels::TunnelRecord::Stopped {
                    exit_code: Some(0),
                },
            );
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::TunnelStatus(TunnelStatus {
                id: 3,
                state: TunnelState::Stopped { exit_code: Some(0) },
            })
        );
    }
}
