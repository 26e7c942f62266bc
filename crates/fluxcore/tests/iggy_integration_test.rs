//! Integration tests against a live Iggy server. Run with `--ignored` when
//! a broker is listening on 127.0.0.1:8090.

use chrono::Utc;
use fluxcore::events::iggy::{IggyBroker, IggyBrokerConfig};
use fluxcore::{Broker, RunEvent, RunEventKind, RunJob, TenantCtx, Value};
use uuid::Uuid;

/// Helper to check if an Iggy server is available
async fn iggy_available() -> bool {
    tokio::net::TcpStream::connect("127.0.0.1:8090")
        .await
        .is_ok()
}

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn test_config() -> IggyBrokerConfig {
    IggyBrokerConfig {
        stream_name: format!("test_stream_{}", Uuid::new_v4().simple()),
        ..IggyBrokerConfig::default()
    }
}

fn event(run_id: Uuid, seq: u64, kind: RunEventKind) -> RunEvent {
    RunEvent {
        run_id,
        seq,
        kind,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
#[ignore] // Run only when an Iggy server is available
async fn connects_and_provisions_stream() {
    init_tracing();

    if !iggy_available().await {
        println!("Skipping test: Iggy server not available at 127.0.0.1:8090");
        return;
    }

    let broker = IggyBroker::connect(test_config()).await;
    assert!(broker.is_ok(), "should connect: {:?}", broker.err());
}

#[tokio::test]
#[ignore]
async fn published_events_reach_a_subscriber() {
    init_tracing();

    if !iggy_available().await {
        println!("Skipping test: Iggy server not available");
        return;
    }

    let broker = IggyBroker::connect(test_config())
        .await
        .expect("failed to connect broker");
    let mut events = broker.subscribe().await.expect("failed to subscribe");

    let run_id = Uuid::new_v4();
    for seq in 1..=3 {
        let kind = if seq < 3 {
            RunEventKind::Data {
                node_id: Uuid::new_v4(),
                port: "out".to_string(),
                payload: Value::from(format!("payload-{}", seq)),
            }
        } else {
            RunEventKind::End { cancelled: false }
        };
        broker
            .publish(event(run_id, seq, kind))
            .await
            .expect("failed to publish event");
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(tokio::time::Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        received.push(event);
    }

    assert_eq!(received.len(), 3);
    let seqs: Vec<u64> = received.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3], "single partition preserves order");
    assert!(received[2].is_terminal());
}

#[tokio::test]
#[ignore]
async fn enqueued_job_is_delivered_to_a_worker() {
    init_tracing();

    if !iggy_available().await {
        println!("Skipping test: Iggy server not available");
        return;
    }

    let broker = IggyBroker::connect(test_config())
        .await
        .expect("failed to connect broker");

    let job = RunJob {
        run_id: Uuid::new_v4(),
        flow_id: Uuid::new_v4(),
        tenant: TenantCtx::new(Uuid::new_v4(), Uuid::new_v4()),
    };
    broker.enqueue(job.clone()).await.expect("failed to enqueue");

    let received = tokio::time::timeout(
        tokio::time::Duration::from_secs(10),
        broker.next_job(),
    )
    .await
    .expect("timed out waiting for job")
    .expect("job consumer failed");

    assert_eq!(received.run_id, job.run_id);
    assert_eq!(received.flow_id, job.flow_id);
    assert_eq!(
        received.tenant.workspace_id,
        job.tenant.workspace_id
    );
}
