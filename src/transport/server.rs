use super::protocol::{read_message, write_message, CoordinatorMessage, SubmitOutcome, WorkerMessage};
use super::TransportError;
use crate::aggregator::Aggregator;
use crate::events::{EngineEvent, EventBus};
use crate::registry::{DoneOutcome, FailOutcome, WorkUnitRegistry};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A connected worker's session state. Owned by the transport layer;
/// destroyed on disconnect or timeout.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
    pub assignment: Option<u64>,
}

/// Shared state for the coordinator server. One instance per run.
pub struct ServerContext {
    pub registry: Arc<WorkUnitRegistry>,
    pub aggregator: Arc<Aggregator>,
    pub events: EventBus,
    /// Per-call timeout; also bounds how long a silent connection lives.
    pub call_timeout: Duration,
    pub max_connections: usize,
    pub cancel: CancellationToken,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

/// Why a REGISTER was refused.
#[derive(Debug, PartialEq, Eq)]
enum AdmitOutcome {
    Admitted,
    AtCapacity,
    DuplicateId,
}

impl ServerContext {
    pub fn new(
        registry: Arc<WorkUnitRegistry>,
        aggregator: Arc<Aggregator>,
        events: EventBus,
        call_timeout: Duration,
        max_connections: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            aggregator,
            events,
            call_timeout,
            max_connections,
            cancel,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn connected_workers(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Admit a worker if there is a free connection slot. Registration is
    /// also refused once the run is cancelled, and a worker ID already
    /// connected may not be claimed by a second connection.
    fn try_admit(&self, worker_id: &str, addr: SocketAddr) -> AdmitOutcome {
        if self.cancel.is_cancelled() {
            return AdmitOutcome::AtCapacity;
        }
        let mut workers = self.workers.lock().unwrap();
        if workers.contains_key(worker_id) {
            return AdmitOutcome::DuplicateId;
        }
        if workers.len() >= self.max_connections {
            return AdmitOutcome::AtCapacity;
        }
        let now = Instant::now();
        workers.insert(
            worker_id.to_string(),
            WorkerHandle {
                worker_id: worker_id.to_string(),
                addr,
                connected_at: now,
                last_heartbeat: now,
                assignment: None,
            },
        );
        AdmitOutcome::Admitted
    }

    fn touch(&self, worker_id: &str, assignment: Option<Option<u64>>) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(handle) = workers.get_mut(worker_id) {
            handle.last_heartbeat = Instant::now();
            if let Some(assignment) = assignment {
                handle.assignment = assignment;
            }
        }
    }

    fn remove(&self, worker_id: &str) -> bool {
        self.workers.lock().unwrap().remove(worker_id).is_some()
    }
}

/// Accept loop: one independent task per connection, so a slow worker can
/// never starve another's request/response cycle.
pub async fn run_server(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<(), TransportError> {
    info!(addr = ?listener.local_addr().ok(), "Coordinator listening");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                info!("Coordinator server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, ctx).await {
                        debug!(addr = %addr, error = %e, "Connection ended with error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), TransportError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // First exchange must be REGISTER.
    let worker_id = match read_call(&mut reader, &ctx).await? {
        Some(WorkerMessage::Register { worker }) => worker,
        Some(other) => {
            let reply = CoordinatorMessage::Nack {
                reason: format!("expected REGISTER, got {other:?}"),
            };
            write_message(&mut write_half, &reply).await?;
            return Err(TransportError::Protocol("registration required".to_string()));
        }
        None => return Ok(()),
    };

    match ctx.try_admit(&worker_id, addr) {
        AdmitOutcome::Admitted => {}
        AdmitOutcome::AtCapacity => {
            write_message(&mut write_half, &CoordinatorMessage::CapacityExceeded).await?;
            warn!(worker = %worker_id, addr = %addr, "Registration rejected: capacity exceeded");
            return Ok(());
        }
        AdmitOutcome::DuplicateId => {
            let reply = CoordinatorMessage::Nack {
                reason: "worker id already registered".to_string(),
            };
            write_message(&mut write_half, &reply).await?;
            warn!(worker = %worker_id, addr = %addr, "Registration rejected: duplicate worker id");
            return Ok(());
        }
    }

    // The slot is held from here on; every exit path below must reach the
    // cleanup block, including a failed reply write.
    let result = match write_message(
        &mut write_half,
        &CoordinatorMessage::Registered {
            worker: worker_id.clone(),
        },
    )
    .await
    {
        Ok(()) => {
            ctx.events.emit(EngineEvent::WorkerConnected {
                worker: worker_id.clone(),
            });
            info!(worker = %worker_id, addr = %addr, "Worker registered");
            serve_worker(&mut reader, &mut write_half, &worker_id, &ctx).await
        }
        Err(e) => Err(e),
    };

    // Whatever ends the session, reclaim the slot and any in-flight unit.
    if ctx.remove(&worker_id) {
        for (unit_id, outcome) in ctx.registry.release_worker(&worker_id) {
            emit_failure(&ctx, unit_id, &worker_id, "worker disconnected", outcome);
        }
        ctx.events.emit(EngineEvent::WorkerDisconnected {
            worker: worker_id.clone(),
        });
    }

    result
}

async fn serve_worker(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    worker_id: &str,
    ctx: &Arc<ServerContext>,
) -> Result<(), TransportError> {
    loop {
        let message = match read_call(reader, ctx).await {
            Ok(Some(message)) => message,
            // Clean disconnect.
            Ok(None) => return Ok(()),
            // A silent worker past the timeout is dropped; its in-flight
            // unit is reclaimed by the caller.
            Err(e) => return Err(e),
        };

        let reply = match message {
            WorkerMessage::RequestWork { .. } => {
                ctx.touch(worker_id, None);
                if ctx.cancel.is_cancelled() {
                    CoordinatorMessage::NoWork { run_complete: true }
                } else {
                    match ctx.registry.claim_next(worker_id) {
                        Some(assignment) => {
                            ctx.touch(worker_id, Some(Some(assignment.unit_id)));
                            ctx.events.emit(EngineEvent::UnitDispatched {
                                unit_id: assignment.unit_id,
                                worker: worker_id.to_string(),
                                attempt: assignment.attempt,
                            });
                            CoordinatorMessage::WorkUnit {
                                unit_id: assignment.unit_id,
                                attempt: assignment.attempt,
                                batch: (*assignment.batch).clone(),
                            }
                        }
                        None => CoordinatorMessage::NoWork {
                            run_complete: ctx.registry.counts().is_drained(),
                        },
                    }
                }
            }

            WorkerMessage::SubmitResult {
                unit_id, outcome, ..
            } => {
                ctx.touch(worker_id, Some(None));
                match outcome {
                    SubmitOutcome::Success { result } => {
                        match ctx.registry.mark_done(unit_id, worker_id) {
                            DoneOutcome::Accepted => {
                                ctx.aggregator.fold(&result);
                                ctx.events.emit(EngineEvent::UnitDone {
                                    unit_id,
                                    worker: worker_id.to_string(),
                                });
                            }
                            DoneOutcome::Stale => {
                                // Reaped and reassigned elsewhere: idempotent no-op.
                                debug!(worker = %worker_id, unit_id, "Ignoring stale submission");
                            }
                        }
                        CoordinatorMessage::Ack
                    }
                    SubmitOutcome::Failure { reason } => {
                        let outcome = ctx.registry.mark_failed(unit_id, worker_id, &reason);
                        emit_failure(ctx, unit_id, worker_id, &reason, outcome);
                        CoordinatorMessage::Ack
                    }
                }
            }

            WorkerMessage::Heartbeat { .. } => {
                ctx.touch(worker_id, None);
                CoordinatorMessage::Ack
            }

            WorkerMessage::Register { .. } => CoordinatorMessage::Nack {
                reason: "already registered".to_string(),
            },
        };

        write_message(writer, &reply).await?;

        if reply_is_final(&reply) {
            writer.shutdown().await.ok();
            return Ok(());
        }
    }
}

fn reply_is_final(reply: &CoordinatorMessage) -> bool {
    matches!(reply, CoordinatorMessage::NoWork { run_complete: true })
}

/// One framed read bounded by the per-call timeout. Cancellation counts
/// as a clean close, so idle connections wind down with the run instead
/// of sitting out the timeout.
async fn read_call(
    reader: &mut BufReader<OwnedReadHalf>,
    ctx: &Arc<ServerContext>,
) -> Result<Option<WorkerMessage>, TransportError> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Ok(None),
        result = timeout(ctx.call_timeout, read_message(reader)) => match result {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        },
    }
}

fn emit_failure(
    ctx: &Arc<ServerContext>,
    unit_id: u64,
    worker_id: &str,
    reason: &str,
    outcome: FailOutcome,
) {
    match outcome {
        FailOutcome::Requeued { .. } => ctx.events.emit(EngineEvent::UnitFailed {
            unit_id,
            worker: worker_id.to_string(),
            reason: reason.to_string(),
            requeued: true,
        }),
        FailOutcome::Exhausted => ctx.events.emit(EngineEvent::UnitFailed {
            unit_id,
            worker: worker_id.to_string(),
            reason: reason.to_string(),
            requeued: false,
        }),
        FailOutcome::Stale => {}
    }
}
