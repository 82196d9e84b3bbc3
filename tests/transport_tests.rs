use logfan::aggregator::Aggregator;
use logfan::chunker::{Batch, LogEntry, LogFormat};
use logfan::events::EventBus;
use logfan::registry::WorkUnitRegistry;
use logfan::transport::protocol::{
    read_message, write_message, CoordinatorMessage, SubmitOutcome, WorkerMessage,
};
use logfan::transport::server::{run_server, ServerContext};
use logfan::transport::worker::RemoteWorker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn make_batch(id: u64, entries: usize) -> Batch {
    let source = PathBuf::from("/logs/test.log");
    Batch {
        id,
        source: source.clone(),
        format: LogFormat::Text,
        csv_header: None,
        entries: (0..entries)
            .map(|i| LogEntry {
                raw: format!("2024-01-15 10:00:{:02} | INFO | message {i}", i % 60),
                format: LogFormat::Text,
                source: source.clone(),
                ordinal: i as u64,
            })
            .collect(),
    }
}

struct Coordinator {
    addr: String,
    registry: Arc<WorkUnitRegistry>,
    aggregator: Arc<Aggregator>,
    cancel: CancellationToken,
}

async fn start_coordinator(
    batches: &[Batch],
    max_connections: usize,
    call_timeout: Duration,
) -> Coordinator {
    let registry = Arc::new(WorkUnitRegistry::new(3));
    for batch in batches {
        registry.admit(batch.clone());
    }
    let aggregator = Arc::new(Aggregator::new());
    let (events, _rx) = EventBus::new();
    let cancel = CancellationToken::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let ctx = Arc::new(ServerContext::new(
        Arc::clone(&registry),
        Arc::clone(&aggregator),
        events,
        call_timeout,
        max_connections,
        cancel.clone(),
    ));
    tokio::spawn(run_server(listener, ctx));

    Coordinator {
        addr,
        registry,
        aggregator,
        cancel,
    }
}

/// Raw protocol client for driving individual exchanges.
struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn call(&mut self, message: &WorkerMessage) -> CoordinatorMessage {
        write_message(&mut self.writer, message).await.unwrap();
        read_message(&mut self.reader).await.unwrap().unwrap()
    }

    async fn register(&mut self, worker: &str) -> CoordinatorMessage {
        self.call(&WorkerMessage::Register {
            worker: worker.to_string(),
        })
        .await
    }
}

#[tokio::test]
async fn remote_worker_processes_all_units() {
    let batches: Vec<Batch> = (0..5).map(|id| make_batch(id, 20)).collect();
    let coordinator = start_coordinator(&batches, 4, Duration::from_secs(2)).await;

    let worker = RemoteWorker::new(
        coordinator.addr.clone(),
        Duration::from_secs(2),
        Duration::from_millis(10),
        Duration::from_millis(50),
        CancellationToken::new(),
    );
    worker.run().await.unwrap();

    let counts = coordinator.registry.counts();
    assert_eq!(counts.done, 5);
    assert!(counts.is_drained());

    let report = coordinator.aggregator.snapshot();
    assert_eq!(report.total_entries, 100);
    assert_eq!(report.level_counts["INFO"], 100);
    assert_eq!(report.folded_batches.len(), 5);

    coordinator.cancel.cancel();
}

#[tokio::test]
async fn worker_exits_cleanly_when_there_is_no_work() {
    let coordinator = start_coordinator(&[], 4, Duration::from_secs(2)).await;

    let worker = RemoteWorker::new(
        coordinator.addr.clone(),
        Duration::from_secs(2),
        Duration::from_millis(10),
        Duration::from_millis(50),
        CancellationToken::new(),
    );
    worker.run().await.unwrap();

    coordinator.cancel.cancel();
}

#[tokio::test]
async fn registration_past_capacity_is_rejected_without_harming_others() {
    let batches = vec![make_batch(0, 5)];
    let coordinator = start_coordinator(&batches, 1, Duration::from_secs(2)).await;

    let mut first = TestClient::connect(&coordinator.addr).await;
    assert!(matches!(
        first.register("w1").await,
        CoordinatorMessage::Registered { .. }
    ));

    let mut second = TestClient::connect(&coordinator.addr).await;
    assert!(matches!(
        second.register("w2").await,
        CoordinatorMessage::CapacityExceeded
    ));

    // The admitted worker is unaffected and still gets work.
    let reply = first
        .call(&WorkerMessage::RequestWork {
            worker: "w1".to_string(),
        })
        .await;
    match reply {
        CoordinatorMessage::WorkUnit { unit_id, attempt, .. } => {
            assert_eq!(unit_id, 0);
            assert_eq!(attempt, 1);
        }
        other => panic!("expected WORK_UNIT, got {other:?}"),
    }

    coordinator.cancel.cancel();
}

#[tokio::test]
async fn disconnected_worker_unit_is_redispatched_and_result_matches_clean_run() {
    let batch = make_batch(0, 30);
    let coordinator = start_coordinator(&[batch.clone()], 4, Duration::from_secs(2)).await;

    // First worker claims the unit and vanishes before submitting.
    {
        let mut ghost = TestClient::connect(&coordinator.addr).await;
        assert!(matches!(
            ghost.register("ghost").await,
            CoordinatorMessage::Registered { .. }
        ));
        let reply = ghost
            .call(&WorkerMessage::RequestWork {
                worker: "ghost".to_string(),
            })
            .await;
        assert!(matches!(reply, CoordinatorMessage::WorkUnit { .. }));
        // Dropping the connection simulates a mid-processing crash.
    }

    // Give the server a moment to observe the disconnect and requeue.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.registry.counts().pending, 1);

    // A healthy worker finishes the run.
    let worker = RemoteWorker::new(
        coordinator.addr.clone(),
        Duration::from_secs(2),
        Duration::from_millis(10),
        Duration::from_millis(50),
        CancellationToken::new(),
    );
    worker.run().await.unwrap();

    assert_eq!(coordinator.registry.attempts(0), Some(2));
    assert_eq!(coordinator.registry.counts().done, 1);

    // The redispatched run's report is identical to a clean single-pass run.
    let clean = Aggregator::new();
    clean.fold(&logfan::analyzer::analyze(
        &batch,
        logfan::analyzer::Thresholds::default(),
    ));
    assert_eq!(coordinator.aggregator.snapshot(), clean.snapshot());

    coordinator.cancel.cancel();
}

#[tokio::test]
async fn registration_slot_is_released_when_the_connection_dies_at_the_reply() {
    let batches = vec![make_batch(0, 5)];
    let coordinator = start_coordinator(&batches, 1, Duration::from_secs(2)).await;

    // Register and reset the connection without ever reading the reply, so
    // the server's Registered write can fail mid-registration.
    {
        let stream = TcpStream::connect(&coordinator.addr).await.unwrap();
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        let (_read_half, mut writer) = stream.into_split();
        write_message(
            &mut writer,
            &WorkerMessage::Register {
                worker: "gone".to_string(),
            },
        )
        .await
        .unwrap();
    }

    // The slot must come back; with max_connections = 1 a leaked handle
    // would refuse every further registration for the rest of the run.
    let mut registered = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut client = TestClient::connect(&coordinator.addr).await;
        match client.register("w1").await {
            CoordinatorMessage::Registered { .. } => {
                registered = true;
                break;
            }
            CoordinatorMessage::CapacityExceeded => continue,
            other => panic!("unexpected reply {other:?}"),
        }
    }
    assert!(registered);

    coordinator.cancel.cancel();
}

#[tokio::test]
async fn duplicate_worker_id_is_rejected_with_a_nack() {
    let batches = vec![make_batch(0, 5)];
    let coordinator = start_coordinator(&batches, 4, Duration::from_secs(2)).await;

    let mut first = TestClient::connect(&coordinator.addr).await;
    assert!(matches!(
        first.register("w1").await,
        CoordinatorMessage::Registered { .. }
    ));

    let mut second = TestClient::connect(&coordinator.addr).await;
    assert!(matches!(
        second.register("w1").await,
        CoordinatorMessage::Nack { .. }
    ));

    // The original connection keeps its identity and still gets work.
    let reply = first
        .call(&WorkerMessage::RequestWork {
            worker: "w1".to_string(),
        })
        .await;
    assert!(matches!(reply, CoordinatorMessage::WorkUnit { .. }));

    coordinator.cancel.cancel();
}

#[tokio::test]
async fn cancellation_promptly_closes_idle_connections() {
    let coordinator = start_coordinator(&[make_batch(0, 5)], 4, Duration::from_secs(30)).await;

    let mut client = TestClient::connect(&coordinator.addr).await;
    assert!(matches!(
        client.register("w1").await,
        CoordinatorMessage::Registered { .. }
    ));

    coordinator.cancel.cancel();

    // Well under the 30s call timeout the server must hang up.
    let closed = tokio::time::timeout(
        Duration::from_secs(2),
        read_message::<CoordinatorMessage, _>(&mut client.reader),
    )
    .await
    .expect("server kept the connection open after cancellation")
    .unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn stale_submission_from_reassigned_unit_is_an_idempotent_noop() {
    let batch = make_batch(0, 10);
    let coordinator = start_coordinator(&[batch.clone()], 4, Duration::from_secs(2)).await;

    let mut slow = TestClient::connect(&coordinator.addr).await;
    assert!(matches!(
        slow.register("slow").await,
        CoordinatorMessage::Registered { .. }
    ));
    let reply = slow
        .call(&WorkerMessage::RequestWork {
            worker: "slow".to_string(),
        })
        .await;
    let CoordinatorMessage::WorkUnit { unit_id, attempt, batch: claimed } = reply else {
        panic!("expected WORK_UNIT");
    };

    // The coordinator reaps the stalled dispatch and hands it elsewhere.
    coordinator.registry.reap_stale(Duration::ZERO);
    let reassigned = coordinator.registry.claim_next("fast").unwrap();
    assert_eq!(reassigned.unit_id, unit_id);

    // The original worker's late submission must not be folded.
    let result = logfan::analyzer::analyze(&claimed, logfan::analyzer::Thresholds::default());
    let reply = slow
        .call(&WorkerMessage::SubmitResult {
            worker: "slow".to_string(),
            unit_id,
            attempt,
            outcome: SubmitOutcome::Success { result },
        })
        .await;
    assert!(matches!(reply, CoordinatorMessage::Ack));
    assert_eq!(coordinator.aggregator.snapshot().total_entries, 0);

    // The current holder's submission lands exactly once.
    let result = logfan::analyzer::analyze(&batch, logfan::analyzer::Thresholds::default());
    assert_eq!(
        coordinator.registry.mark_done(unit_id, "fast"),
        logfan::registry::DoneOutcome::Accepted
    );
    coordinator.aggregator.fold(&result);
    assert_eq!(coordinator.aggregator.snapshot().total_entries, 10);

    coordinator.cancel.cancel();
}
