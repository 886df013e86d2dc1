//! Worker supervisor: accepts connections, spawns workers, reaps them.
//!
//! One task owns the listener and all bookkeeping. Each worker runs as its own
//! tokio task and reports a [`WorkerOutcome`] over an unbounded channel when it
//! ends, including when it panics. The supervisor is the only writer of
//! [`ServerState`]; everyone else sees snapshots through a `watch` channel.
//!
//! Phases: `Listening -> ReadingHeader -> Spawning -> Listening ...`, then
//! `Draining -> Stopped` once the iteration bound is hit or shutdown is requested.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::pipeline::Pipeline;
use crate::wire::{ProtocolError, TransferCodec, TransferRequest, read_request};
use crate::worker::{Worker, WorkerConfig, WorkerId, WorkerOutcome, WorkerStatus};

/// Default cap on concurrently running workers.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Default cap on a declared payload size.
pub const DEFAULT_MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Default time a client gets to deliver its request header.
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SupervisorPhase {
    #[default]
    Starting,
    Listening,
    ReadingHeader,
    Spawning,
    Draining,
    Stopped,
}

/// Supervisor bookkeeping.
///
/// `active` only moves by +1 on spawn and -1 on reap, so it never exceeds the
/// number of spawned-but-unreaped workers and is 0 once `Stopped`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerState {
    pub phase: SupervisorPhase,
    /// Accept attempts so far, successful or not.
    pub iterations: u64,
    pub active: usize,
    pub spawned: u64,
    pub reaped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub crashed: u64,
    /// Connections closed because of a bad or missing header.
    pub rejected: u64,
    pub accept_errors: u64,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Stop accepting after this many accept attempts. `None` runs until shutdown.
    pub max_connections: Option<u64>,
    /// Accepting pauses while this many workers are active.
    pub max_workers: usize,
    pub max_payload: u64,
    /// `None` waits for a header indefinitely. Finished workers are not reaped
    /// while a header read is pending, so `active` can lag by up to this long.
    pub header_timeout: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            max_workers: DEFAULT_MAX_WORKERS,
            max_payload: DEFAULT_MAX_PAYLOAD,
            header_timeout: Some(DEFAULT_HEADER_TIMEOUT),
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    worker_config: Arc<WorkerConfig>,
    pipeline: Arc<dyn Pipeline>,
    state: ServerState,
    state_tx: watch::Sender<ServerState>,
    outcome_tx: mpsc::UnboundedSender<WorkerOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<WorkerOutcome>,
    next_id: u64,
}

impl Supervisor {
    /// Create a supervisor. The outcome channel exists from here on, so workers
    /// can always report, even before the loop starts.
    pub fn new(
        config: SupervisorConfig,
        worker_config: WorkerConfig,
        pipeline: Arc<dyn Pipeline>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ServerState::default());
        Self {
            config,
            worker_config: Arc::new(worker_config),
            pipeline,
            state: ServerState::default(),
            state_tx,
            outcome_tx,
            outcome_rx,
            next_id: 0,
        }
    }

    /// Observe state snapshots. Call before [`run`](Self::run).
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    /// Serve until the iteration bound or `shutdown`, then drain and stop.
    ///
    /// Returns the final state; `active` is always 0.
    pub async fn run(mut self, listener: TcpListener, shutdown: CancellationToken) -> ServerState {
        self.set_phase(SupervisorPhase::Listening);

        loop {
            if let Some(limit) = self.config.max_connections
                && self.state.iterations >= limit
            {
                tracing::info!(iterations = self.state.iterations, "Connection limit reached");
                break;
            }

            let has_capacity = self.state.active < self.config.max_workers;

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, no longer accepting");
                    break;
                }

                Some(outcome) = self.outcome_rx.recv() => self.reap(outcome),

                accepted = listener.accept(), if has_capacity => {
                    self.state.iterations += 1;
                    match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer, &shutdown).await,
                        Err(e) => {
                            self.state.accept_errors += 1;
                            tracing::warn!(error = %e, "Accept failed");
                            self.publish();
                        }
                    }
                }
            }
        }

        self.drain().await;
        drop(listener);
        self.set_phase(SupervisorPhase::Stopped);
        tracing::info!(
            spawned = self.state.spawned,
            succeeded = self.state.succeeded,
            failed = self.state.failed,
            crashed = self.state.crashed,
            rejected = self.state.rejected,
            "Supervisor stopped"
        );
        self.state
    }

    /// Read the header synchronously, then hand the connection to a worker.
    async fn admit(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) {
        self.set_phase(SupervisorPhase::ReadingHeader);

        let mut codec = TransferCodec::new(self.config.max_payload);
        let header_timeout = self.config.header_timeout;
        let header = async {
            match header_timeout {
                Some(limit) => tokio::time::timeout(limit, read_request(&mut stream, &mut codec))
                    .await
                    .unwrap_or(Err(ProtocolError::Timeout)),
                None => read_request(&mut stream, &mut codec).await,
            }
        };

        let result = tokio::select! {
            result = header => Some(result),
            _ = shutdown.cancelled() => None,
        };

        match result {
            Some(Ok(request)) => self.spawn_worker(stream, peer, request),
            Some(Err(e)) => {
                self.state.rejected += 1;
                tracing::warn!(%peer, error = %e, "Rejected connection");
            }
            None => {
                self.state.rejected += 1;
                tracing::debug!(%peer, "Dropped connection during shutdown");
            }
        }

        self.set_phase(SupervisorPhase::Listening);
    }

    fn spawn_worker(&mut self, stream: TcpStream, peer: SocketAddr, request: TransferRequest) {
        self.set_phase(SupervisorPhase::Spawning);

        self.next_id += 1;
        let id = WorkerId::new(self.next_id);
        tracing::info!(
            iteration = self.state.iterations,
            worker = %id,
            %peer,
            name = %request.name,
            size = request.size,
            "Spawning worker"
        );

        let worker = Worker::new(
            id,
            stream,
            request,
            Arc::clone(&self.pipeline),
            Arc::clone(&self.worker_config),
        );
        let handle = tokio::spawn(worker.run());

        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => WorkerOutcome::crashed(id, panic_message(e.into_panic())),
                Err(e) => WorkerOutcome::crashed(id, e.to_string()),
            };
            // Receiver lives as long as the supervisor; a send failure means
            // the server is already gone.
            let _ = outcome_tx.send(outcome);
        });

        self.state.active += 1;
        self.state.spawned += 1;
        self.publish();
    }

    fn reap(&mut self, outcome: WorkerOutcome) {
        let Some(active) = self.state.active.checked_sub(1) else {
            tracing::error!(worker = %outcome.id, "Outcome received with no active workers");
            return;
        };
        self.state.active = active;
        self.state.reaped += 1;

        let id = outcome.id;
        let error = outcome.error.as_deref().unwrap_or_default();
        match outcome.status {
            WorkerStatus::Success => {
                self.state.succeeded += 1;
                tracing::info!(worker = %id, active, "Worker succeeded");
            }
            WorkerStatus::Failure => {
                self.state.failed += 1;
                tracing::warn!(worker = %id, active, error, "Worker failed");
            }
            WorkerStatus::Crashed => {
                self.state.crashed += 1;
                tracing::error!(worker = %id, active, error, "Worker crashed");
            }
        }
        self.publish();
    }

    async fn drain(&mut self) {
        self.set_phase(SupervisorPhase::Draining);
        if self.state.active > 0 {
            tracing::info!(active = self.state.active, "Waiting for active workers");
        }
        while self.state.active > 0 {
            match self.outcome_rx.recv().await {
                Some(outcome) => self.reap(outcome),
                // Unreachable while `outcome_tx` is held.
                None => break,
            }
        }
    }

    fn set_phase(&mut self, phase: SupervisorPhase) {
        self.state.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
