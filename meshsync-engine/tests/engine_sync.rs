//! End-to-end synchronization between two engines over in-memory links.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use meshsync_engine::{EngineConfig, MockConnector, MockHub, SyncEngine, SyncEvent};
use meshsync_types::{Change, HybridTimestamp, MessageId, WireMessage};

fn node_config(peer: &str) -> EngineConfig {
    let mut config = EngineConfig::with_endpoints(vec![peer.to_string()]);
    config.active_links = 1;
    config.backoff_base_ms = 10;
    config.backoff_cap_ms = 40;
    config.backoff_jitter_ms = 0;
    config.refresh_interval_ms = 60_000;
    config.recycle_interval_ms = 600_000;
    config
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start two engines dialing each other through a shared hub.
fn start_pair() -> (
    SyncEngine<MockConnector>,
    mpsc::UnboundedReceiver<SyncEvent>,
    SyncEngine<MockConnector>,
    mpsc::UnboundedReceiver<SyncEvent>,
) {
    init_tracing();
    let hub = MockHub::new();
    let (a, rx_a) = SyncEngine::start(node_config("node-b"), hub.connector("node-a")).unwrap();
    let (b, rx_b) = SyncEngine::start(node_config("node-a"), hub.connector("node-b")).unwrap();
    (a, rx_a, b, rx_b)
}

async fn wait_link_up(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(SyncEvent::LinkUp { .. }) = rx.recv().await {
                break;
            }
        }
    })
    .await
    .expect("link never came up");
}

async fn wait_change_applied(rx: &mut mpsc::UnboundedReceiver<SyncEvent>, key: &str) {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(SyncEvent::ChangeApplied { key: applied, .. }) = rx.recv().await {
                if applied == key {
                    break;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("change to {key} never applied"));
}

/// Poll until both engines report the same value for a key.
async fn wait_converged(a: &SyncEngine<MockConnector>, b: &SyncEngine<MockConnector>, key: &str) {
    timeout(Duration::from_secs(2), async {
        loop {
            let va = a.get(key);
            let vb = b.get(key);
            if va.is_some() && va == vb {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "never converged on {key}: a={:?} b={:?}",
            a.get(key),
            b.get(key)
        )
    });
}

#[tokio::test]
async fn write_propagates_to_peer() {
    let (a, mut rx_a, b, mut rx_b) = start_pair();
    wait_link_up(&mut rx_a).await;
    wait_link_up(&mut rx_b).await;

    let outcome = a.put("color", b"blue".to_vec()).await;
    assert!(outcome.accepted);

    wait_change_applied(&mut rx_b, "color").await;
    assert_eq!(b.get("color").unwrap(), b"blue");
    assert_eq!(b.timestamp("color").unwrap(), outcome.timestamp);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn concurrent_writes_converge_to_one_winner() {
    let (a, mut rx_a, b, mut rx_b) = start_pair();
    wait_link_up(&mut rx_a).await;
    wait_link_up(&mut rx_b).await;

    let wa = a.put("shared", b"from-a".to_vec()).await;
    // Exact cross-node ties reject on both sides, so keep the writes in
    // different wall-clock milliseconds. They still race the delivery.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let wb = b.put("shared", b"from-b".to_vec()).await;

    wait_converged(&a, &b, "shared").await;

    // Exactly one write wins everywhere, picked by timestamp order.
    let winner: &[u8] = if wa.timestamp > wb.timestamp {
        b"from-a"
    } else {
        b"from-b"
    };
    assert_eq!(a.get("shared").unwrap(), winner);
    assert_eq!(b.get("shared").unwrap(), winner);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn writes_after_sync_order_after_remote_writes() {
    let (a, mut rx_a, b, mut rx_b) = start_pair();
    wait_link_up(&mut rx_a).await;
    wait_link_up(&mut rx_b).await;

    let first = a.put("doc", b"v1".to_vec()).await;
    wait_change_applied(&mut rx_b, "doc").await;

    // B saw A's write, so B's next write must defeat it everywhere.
    let second = b.put("doc", b"v2".to_vec()).await;
    assert!(second.timestamp > first.timestamp);

    wait_converged(&a, &b, "doc").await;
    assert_eq!(a.get("doc").unwrap(), b"v2");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn duplicate_delivery_is_applied_once() {
    let (a, mut rx_a, b, mut rx_b) = start_pair();
    wait_link_up(&mut rx_a).await;
    wait_link_up(&mut rx_b).await;

    // Inject the same change twice directly into B's inbound queue.
    let change = WireMessage::Change(Change {
        key: "dup".into(),
        value: b"once".to_vec(),
        timestamp: HybridTimestamp::new(u64::MAX / 2, 1),
    });
    let payload = change.to_bytes().unwrap();
    let conn = b.manager().connector().connection_to("node-a").unwrap();
    for _ in 0..2 {
        let frames = meshsync_core::split_message(MessageId::new(), &payload, 256, 100).unwrap();
        for frame in &frames {
            conn.push_inbound(frame.encode());
        }
    }

    wait_change_applied(&mut rx_b, "dup").await;
    assert_eq!(b.get("dup").unwrap(), b"once");

    // The replay resolves as a tie and is dropped, not re-applied.
    let second = timeout(Duration::from_millis(300), async {
        loop {
            if let Some(SyncEvent::ChangeApplied { key, .. }) = rx_b.recv().await {
                if key == "dup" {
                    break;
                }
            }
        }
    })
    .await;
    assert!(second.is_err(), "duplicate change was applied twice");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn large_values_cross_the_link_in_fragments() {
    let (a, mut rx_a, b, mut rx_b) = start_pair();
    wait_link_up(&mut rx_a).await;
    wait_link_up(&mut rx_b).await;

    // Far larger than one 256-byte transport message.
    let value: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    a.put("blob", value.clone()).await;

    wait_change_applied(&mut rx_b, "blob").await;
    assert_eq!(b.get("blob").unwrap(), value);

    a.shutdown().await;
    b.shutdown().await;
}
