mod common;

use common::{connected, connected_in, expect_connectivity, wait_for};
use coordination::{
    Connectivity, DirectoryOptions, GlobalStore, MemoryCluster, NodeDirectory, PathResolver,
    Registry, RegistryOptions,
};
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
/// two participants find each other; one comes back with a new address under
/// the same application id and the other follows
async fn test_end_to_end_address_change() {
    let cluster = MemoryCluster::new();
    let (_c1, client_a) = connected(&cluster).await;
    let (connector_b, client_b) = connected(&cluster).await;

    let dir_a = NodeDirectory::spawn(
        client_a,
        DirectoryOptions::new("cell").with_member("node-a", "10.0.0.1"),
    )
    .unwrap();
    let dir_b = NodeDirectory::spawn(
        client_b.clone(),
        DirectoryOptions::new("cell").with_member("node-b", "10.0.0.2"),
    )
    .unwrap();

    wait_for("both directories", || {
        dir_a.nodes() == ["node-a", "node-b"] && dir_b.nodes() == ["node-a", "node-b"]
    })
    .await;
    assert_eq!(dir_a.get("node-b").as_deref(), Some("10.0.0.2"));
    assert_eq!(dir_b.get("node-a").as_deref(), Some("10.0.0.1"));

    let mut conn = client_b.subscribe_connectivity();
    connector_b.disconnect();
    expect_connectivity(&mut conn, Connectivity::Lost).await;
    wait_for("b stale", || dir_b.is_stale()).await;
    dir_b.set("node-b", "10.0.0.3").unwrap();
    connector_b.reconnect();

    wait_for("a sees new address", || {
        dir_a.get("node-b").as_deref() == Some("10.0.0.3")
    })
    .await;
    wait_for("b fresh", || !dir_b.is_stale()).await;
    assert_eq!(dir_a.nodes(), ["node-a", "node-b"]);
    let presence_base = dir_a.presence().base_path().to_owned();
    let cluster_view = cluster.clone();
    wait_for("one node each", move || cluster_view.children(&presence_base).len() == 2).await;
}

#[tokio::test]
/// an expired participant disappears from the others' directories
async fn test_expired_member_leaves() {
    let cluster = MemoryCluster::new();
    let (_c1, client_a) = connected(&cluster).await;
    let (connector_b, client_b) = connected(&cluster).await;
    let dir_a = NodeDirectory::spawn(
        client_a,
        DirectoryOptions::new("cell").with_member("a", "10.0.0.1"),
    )
    .unwrap();
    let _dir_b = NodeDirectory::spawn(
        client_b,
        DirectoryOptions::new("cell").with_member("b", "10.0.0.2"),
    )
    .unwrap();
    wait_for("b joined", || dir_a.get("b").is_some()).await;

    connector_b.expire();
    wait_for("b left", || dir_a.get("b").is_none()).await;
    assert_eq!(dir_a.nodes(), ["a"]);

    connector_b.reconnect();
    wait_for("b back", || dir_a.get("b").as_deref() == Some("10.0.0.2")).await;
}

#[tokio::test]
async fn test_global_store_create_update_clear() {
    let cluster = MemoryCluster::new();
    let (_c, client) = connected_in(&cluster, "staging").await;
    let store = GlobalStore::new(client, &PathResolver::new("staging").unwrap());

    store.set("limit", &10u32).await.unwrap();
    assert_eq!(store.get::<u32>("limit").await.unwrap(), Some(10));
    store.set("limit", &20u32).await.unwrap();
    assert_eq!(store.get::<u32>("limit").await.unwrap(), Some(20));
    store.set("name", "cell").await.unwrap();
    assert_eq!(store.keys().await.unwrap(), ["limit", "name"]);
    assert_eq!(cluster.children("/dcell_global/staging"), ["limit", "name"]);

    store.clear().await.unwrap();
    assert!(store.keys().await.unwrap().is_empty());
    assert!(cluster.data("/dcell_global/staging").is_some());
}

#[tokio::test]
async fn test_registries_share_globals() {
    let cluster = MemoryCluster::new();
    let (_c1, client_a) = connected(&cluster).await;
    let (_c2, client_b) = connected(&cluster).await;
    let a = Registry::start(client_a, RegistryOptions::default().with_member("a", "10.0.0.1")).unwrap();
    let b = Registry::start(client_b, RegistryOptions::default().with_member("b", "10.0.0.2")).unwrap();

    a.set_global("leader", "a").await.unwrap();
    assert_eq!(b.get_global::<String>("leader").await.unwrap().as_deref(), Some("a"));
    wait_for("registries converge", || a.nodes() == ["a", "b"] && b.nodes() == ["a", "b"]).await;
    assert_eq!(b.get_node("a").as_deref(), Some("10.0.0.1"));

    a.shutdown().await;
    wait_for("a left", || b.get_node("a").is_none()).await;
}
