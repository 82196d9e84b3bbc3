use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

/// Structured engine events for the observability sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    UnitDispatched { unit_id: u64, worker: String, attempt: u32 },
    UnitDone { unit_id: u64, worker: String },
    UnitFailed { unit_id: u64, worker: String, reason: String, requeued: bool },
    WorkerConnected { worker: String },
    WorkerDisconnected { worker: String },
    FileSkipped { path: String, reason: String },
    RunFinalized { total_batches: u64, succeeded: u64, failed: u64 },
}

/// Fire-and-forget event emitter. Backed by an unbounded channel so the
/// critical path never blocks on the sink; a closed sink drops events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Default collector: drain events into the tracing subscriber.
pub async fn drain_to_tracing(mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            EngineEvent::UnitDispatched { unit_id, worker, attempt } => {
                info!(unit_id, worker = %worker, attempt, "Unit dispatched");
            }
            EngineEvent::UnitDone { unit_id, worker } => {
                info!(unit_id, worker = %worker, "Unit done");
            }
            EngineEvent::UnitFailed { unit_id, worker, reason, requeued } => {
                info!(unit_id, worker = %worker, reason = %reason, requeued, "Unit failed");
            }
            EngineEvent::WorkerConnected { worker } => {
                info!(worker = %worker, "Worker connected");
            }
            EngineEvent::WorkerDisconnected { worker } => {
                info!(worker = %worker, "Worker disconnected");
            }
            EngineEvent::FileSkipped { path, reason } => {
                info!(path = %path, reason = %reason, "File skipped");
            }
            EngineEvent::RunFinalized { total_batches, succeeded, failed } => {
                info!(total_batches, succeeded, failed, "Run finalized");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_never_blocks_and_preserves_order() {
        let (bus, mut rx) = EventBus::new();
        for i in 0..100 {
            bus.emit(EngineEvent::UnitDone {
                unit_id: i,
                worker: "w1".to_string(),
            });
        }
        for i in 0..100 {
            match rx.recv().await.unwrap() {
                EngineEvent::UnitDone { unit_id, .. } => assert_eq!(unit_id, i),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn emit_is_a_noop_after_sink_closes() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.emit(EngineEvent::WorkerConnected {
            worker: "w1".to_string(),
        });
    }
}
