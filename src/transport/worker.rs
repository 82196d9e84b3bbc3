use super::protocol::{read_message, write_message, CoordinatorMessage, SubmitOutcome, WorkerMessage};
use super::TransportError;
use crate::analyzer::{analyze, Thresholds};
use crate::config::Config;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A remote worker: registers with the coordinator, pulls work units,
/// analyzes them and submits results until the run completes.
pub struct RemoteWorker {
    worker_id: String,
    coordinator_addr: String,
    call_timeout: Duration,
    poll_interval: Duration,
    max_idle_interval: Duration,
    thresholds: Thresholds,
    cancel: CancellationToken,
}

impl RemoteWorker {
    pub fn new(
        coordinator_addr: String,
        call_timeout: Duration,
        poll_interval: Duration,
        max_idle_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            coordinator_addr,
            call_timeout,
            poll_interval,
            max_idle_interval,
            thresholds: Thresholds::default(),
            cancel,
        }
    }

    pub fn from_config(config: &Config, cancel: CancellationToken) -> Self {
        Self::new(
            config.network.listen_addr(),
            config.network.timeout,
            config.retry.poll_interval,
            config.retry.max_idle_interval,
            cancel,
        )
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until the coordinator reports the run complete. Transport
    /// failures drop the connection and reconnect with backoff.
    pub async fn run(&self) -> Result<(), TransportError> {
        let mut reconnect_delay = self.poll_interval;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.session().await {
                Ok(true) => {
                    info!(worker = %self.worker_id, "Run complete, worker exiting");
                    return Ok(());
                }
                Ok(false) => return Ok(()),
                Err(e) => {
                    warn!(
                        worker = %self.worker_id,
                        error = %e,
                        backoff_ms = reconnect_delay.as_millis() as u64,
                        "Session ended, reconnecting"
                    );
                    sleep(jittered(reconnect_delay)).await;
                    reconnect_delay = (reconnect_delay * 2).min(self.max_idle_interval);
                }
            }
        }
    }

    /// One connection's lifetime. Ok(true) means the run finished;
    /// Ok(false) means we were cancelled locally.
    async fn session(&self) -> Result<bool, TransportError> {
        let stream = timeout(self.call_timeout, TcpStream::connect(&self.coordinator_addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let register = WorkerMessage::Register {
            worker: self.worker_id.clone(),
        };
        match self.call(&mut reader, &mut writer, &register).await? {
            CoordinatorMessage::Registered { .. } => {
                debug!(worker = %self.worker_id, addr = %self.coordinator_addr, "Registered");
            }
            CoordinatorMessage::CapacityExceeded => return Err(TransportError::CapacityExceeded),
            other => {
                return Err(TransportError::Protocol(format!(
                    "unexpected registration reply: {other:?}"
                )))
            }
        }

        let mut idle_backoff = self.poll_interval;
        let mut idle_since_heartbeat = Duration::ZERO;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }

            let request = WorkerMessage::RequestWork {
                worker: self.worker_id.clone(),
            };
            match self.call(&mut reader, &mut writer, &request).await? {
                CoordinatorMessage::WorkUnit {
                    unit_id,
                    attempt,
                    batch,
                } => {
                    idle_backoff = self.poll_interval;
                    idle_since_heartbeat = Duration::ZERO;
                    debug!(
                        worker = %self.worker_id,
                        unit_id,
                        attempt,
                        entries = batch.len(),
                        "Processing work unit"
                    );

                    // Analysis is CPU-bound; keep it off the runtime threads.
                    let thresholds = self.thresholds;
                    let batch = Arc::new(batch);
                    let task_batch = Arc::clone(&batch);
                    let outcome =
                        match tokio::task::spawn_blocking(move || analyze(&task_batch, thresholds))
                            .await
                        {
                            Ok(result) => SubmitOutcome::Success { result },
                            Err(e) => SubmitOutcome::Failure {
                                reason: format!("analysis task panicked: {e}"),
                            },
                        };

                    let submit = WorkerMessage::SubmitResult {
                        worker: self.worker_id.clone(),
                        unit_id,
                        attempt,
                        outcome,
                    };
                    match self.call(&mut reader, &mut writer, &submit).await? {
                        CoordinatorMessage::Ack => {}
                        CoordinatorMessage::Nack { reason } => {
                            return Err(TransportError::Protocol(reason))
                        }
                        other => {
                            return Err(TransportError::Protocol(format!(
                                "unexpected submit reply: {other:?}"
                            )))
                        }
                    }
                }

                CoordinatorMessage::NoWork { run_complete: true } => return Ok(true),

                CoordinatorMessage::NoWork { run_complete: false } => {
                    // Idle: back off with jitter, bounded by the max idle
                    // interval, and keep the session alive with heartbeats.
                    let delay = jittered(idle_backoff);
                    sleep(delay).await;
                    idle_since_heartbeat += delay;
                    idle_backoff = (idle_backoff * 2).min(self.max_idle_interval);

                    if idle_since_heartbeat >= self.call_timeout / 2 {
                        let heartbeat = WorkerMessage::Heartbeat {
                            worker: self.worker_id.clone(),
                        };
                        match self.call(&mut reader, &mut writer, &heartbeat).await? {
                            CoordinatorMessage::Ack => idle_since_heartbeat = Duration::ZERO,
                            other => {
                                return Err(TransportError::Protocol(format!(
                                    "unexpected heartbeat reply: {other:?}"
                                )))
                            }
                        }
                    }
                }

                other => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected reply: {other:?}"
                    )))
                }
            }
        }
    }

    /// One request/response exchange bounded by the call timeout.
    async fn call(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        message: &WorkerMessage,
    ) -> Result<CoordinatorMessage, TransportError> {
        write_message(writer, message).await?;
        match timeout(self.call_timeout, read_message(reader)).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(TransportError::ConnectionClosed),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// Add up to 25% random jitter so idle workers do not poll in lockstep.
fn jittered(base: Duration) -> Duration {
    let jitter_ms = base.as_millis() as u64 / 4;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
