//! The connection manager: one session owns the event loop, every
//! connection driver, the deferred-init queue, signal handling, and the
//! loop metrics.
//!
//! Connections are never registered from a user call-path: `ws` only
//! queues, and the loop drains the queue on its own thread. The session's
//! state (connection list, init queue, status) is mutated exclusively from
//! `run`, which is the sole blocking call exposed to the application.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use super::connection::{drive, DataCallback, RetryPolicy, WebSocketConnection};
use super::url::normalize_url;
use crate::errors::ConfigError;

/// Terminal state of a session. Transitions are monotonic:
/// Ok -> GracefulShutdown -> ForcedShutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ok,
    GracefulShutdown,
    ForcedShutdown,
}

pub(crate) enum ConnEvent {
    Established { url: String },
    RetriesExhausted { url: String },
    Finished { url: String },
}

/// Counters sampled once per loop iteration and dumped on request.
#[derive(Debug, Default, Clone)]
pub struct LoopMetrics {
    pub iterations: u64,
    pub events_dispatched: u64,
    pub connections_opened: u64,
    pub idle: Duration,
}

impl LoopMetrics {
    fn log_summary(&self) {
        info!(
            target: "main",
            iterations = self.iterations,
            events = self.events_dispatched,
            connections_opened = self.connections_opened,
            idle_ms = self.idle.as_millis() as u64,
            "session loop metrics"
        );
    }
}

pub struct Session {
    to_init: VecDeque<Arc<WebSocketConnection>>,
    connections: Vec<Arc<WebSocketConnection>>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    init_wakeup: Notify,
    retry_policy: RetryPolicy,
    status: SessionStatus,
    interrupted: bool,
    active: usize,
    metrics: LoopMetrics,
}

impl Session {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            to_init: VecDeque::new(),
            connections: Vec::new(),
            events_tx,
            events_rx,
            init_wakeup: Notify::new(),
            retry_policy: RetryPolicy::default(),
            status: SessionStatus::Ok,
            interrupted: false,
            active: 0,
            metrics: LoopMetrics::default(),
        }
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry_policy = policy;
    }

    /// Open a websocket connection to `url`, delivering every complete
    /// message to `on_data`. The connection is queued and initialized
    /// inside the loop on the next iteration; the returned handle can be
    /// held by user code alongside the session's own reference.
    pub fn ws(
        &mut self,
        url: &str,
        on_data: DataCallback,
    ) -> Result<Arc<WebSocketConnection>, ConfigError> {
        let normalized = normalize_url(url)?;
        info!(target: "web", url = %normalized, "creating websocket connection");

        let conn = WebSocketConnection::new(normalized, on_data);
        self.to_init.push_back(Arc::clone(&conn));
        self.init_wakeup.notify_one();
        Ok(conn)
    }

    /// A snapshot of the initialized connections. Callers get a copy, not
    /// a handle onto the session's own list.
    pub fn connections(&self) -> Vec<Arc<WebSocketConnection>> {
        self.connections.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Set when any connection exhausts its retries.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    /// Run the session to completion: drain the init queue, pump connection
    /// events, react to signals. Returns the terminal status, which the
    /// application should check before deciding its exit.
    pub async fn run(&mut self) -> SessionStatus {
        info!(target: "web", "starting web session");

        let mut interrupts = interrupt_stream();
        let mut stat_requests = stat_request_stream();

        self.run_initializations();

        loop {
            if self.active == 0 && self.to_init.is_empty() {
                break;
            }

            let wait_started = Instant::now();

            tokio::select! {
                _ = interrupts.recv() => {
                    self.metrics.idle += wait_started.elapsed();
                    if self.handle_interrupt() {
                        break;
                    }
                }
                _ = stat_requests.recv() => {
                    self.metrics.idle += wait_started.elapsed();
                    self.metrics.log_summary();
                }
                _ = self.init_wakeup.notified() => {
                    self.metrics.idle += wait_started.elapsed();
                    self.run_initializations();
                }
                event = self.events_rx.recv() => {
                    self.metrics.idle += wait_started.elapsed();
                    let Some(event) = event else {
                        break;
                    };
                    self.handle_event(event);
                }
            }

            self.metrics.iterations += 1;
        }

        self.metrics.log_summary();
        info!(target: "web", status = ?self.status, "web session finished");
        self.status
    }

    /// Drain the deferred-init queue: mark each connection ready and spawn
    /// its driver. Runs only on the loop thread.
    fn run_initializations(&mut self) {
        while let Some(conn) = self.to_init.pop_front() {
            info!(target: "web", url = %conn.url(), "opening connection");

            let Some(parts) = conn.take_driver_parts() else {
                // A connection can only be initialized once; anything else
                // is an unrecoverable bookkeeping failure.
                error!(target: "web", url = %conn.url(), "connection initialized twice, aborting");
                std::process::abort();
            };

            conn.set_ready();

            let events = self.events_tx.clone();
            let policy = self.retry_policy.clone();
            tokio::spawn(drive(Arc::clone(&conn), parts, policy, events));

            self.active += 1;
            self.connections.push(conn);
        }
    }

    /// First interrupt closes every open connection and lets the loop
    /// drain; a second one stops the loop outright. Returns true when the
    /// loop should stop.
    fn handle_interrupt(&mut self) -> bool {
        match self.status {
            SessionStatus::Ok => {
                warn!(target: "main", "interrupt received, closing connections");
                for conn in &self.connections {
                    conn.request_shutdown();
                }
                self.status = SessionStatus::GracefulShutdown;
                false
            }
            SessionStatus::GracefulShutdown | SessionStatus::ForcedShutdown => {
                warn!(target: "main", "second interrupt, forcing shutdown");
                self.status = SessionStatus::ForcedShutdown;
                true
            }
        }
    }

    fn handle_event(&mut self, event: ConnEvent) {
        self.metrics.events_dispatched += 1;

        match event {
            ConnEvent::Established { url } => {
                self.metrics.connections_opened += 1;
                debug!(target: "web", %url, "connection reported established");
            }
            ConnEvent::RetriesExhausted { url } => {
                self.interrupted = true;
                error!(target: "web", %url, "connection retries exhausted");
            }
            ConnEvent::Finished { url } => {
                self.active = self.active.saturating_sub(1);
                info!(target: "web", %url, remaining = self.active, "connection finished");
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// SIGINT stream (Ctrl-C elsewhere). Runs as its own task so the loop can
/// select on a plain channel.
fn interrupt_stream() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();

    // The sender must stay alive either way: a closed channel would make
    // the loop's recv branch fire on every iteration.
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::interrupt()) {
                Ok(mut stream) => {
                    while stream.recv().await.is_some() {
                        if tx.send(()).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "main", error = %err, "could not install SIGINT handler");
                }
            }
        }

        #[cfg(not(unix))]
        {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    break;
                }
                if tx.send(()).is_err() {
                    return;
                }
            }
        }

        let _keep_alive = tx;
        std::future::pending::<()>().await;
    });

    rx
}

/// SIGUSR1 requests a metrics dump. Never fires on platforms without it.
fn stat_request_stream() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::user_defined1()) {
                Ok(mut stream) => {
                    while stream.recv().await.is_some() {
                        if tx.send(()).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "main", error = %err, "could not install SIGUSR1 handler");
                }
            }
        }

        let _keep_alive = tx;
        std::future::pending::<()>().await;
    });

    rx
}
