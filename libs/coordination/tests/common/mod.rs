#![allow(dead_code)]

use std::time::Duration;

use config::CoordinationConfig;
use coordination::{Connectivity, CoordinationClient, MemoryCluster, MemoryConnector};

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// A client with its own session on `cluster`, connected and replayed.
pub async fn connected(cluster: &MemoryCluster) -> (MemoryConnector, CoordinationClient) {
    connected_in(cluster, "production").await
}

pub async fn connected_in(cluster: &MemoryCluster, env: &str) -> (MemoryConnector, CoordinationClient) {
    let connector = cluster.connector();
    let client = CoordinationClient::new(CoordinationConfig::new(["zk1", "zk2:2182"]).with_env(env))
        .expect("valid config");
    let mut rx = client.subscribe_connectivity();
    client.connect(&connector).await.expect("connect");
    assert_eq!(rx.recv().await.unwrap(), Connectivity::Restored);
    (connector, client)
}

/// Poll `cond` every 10ms until it holds or [`TIMEOUT`] passes.
pub async fn wait_for<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for the next connectivity event equal to `expected`.
pub async fn expect_connectivity(
    rx: &mut tokio::sync::broadcast::Receiver<Connectivity>,
    expected: Connectivity,
) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if rx.recv().await.unwrap() == expected {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {expected:?} event"));
}
