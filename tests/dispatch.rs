//! Master-side dispatch: handles reach workers in round-robin order.

use std::sync::Arc;
use std::time::Duration;

use cluster_http::cluster::{ClusterListener, ClusterView, HandleReceiver, WorkerChannel, WorkerRegistry};
use cluster_http::config::{Role, ServerConfig};
use cluster_http::http::HttpServer;
use cluster_http::net::ErrorKind;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

mod common;
use common::{Client, Event};

fn master(registry: Arc<WorkerRegistry>) -> Arc<HttpServer> {
    Arc::new(HttpServer::with_cluster(
        ServerConfig::default(),
        ClusterView::master(registry),
    ))
}

#[tokio::test]
async fn seven_connections_rotate_over_three_workers() {
    let registry = Arc::new(WorkerRegistry::new());
    let (received_tx, mut received_rx) = mpsc::unbounded_channel();

    let mut receivers = Vec::new();
    for worker in 0..3usize {
        let (master_end, worker_end) = UnixStream::pair().unwrap();
        registry.register(1000 + worker as u32, WorkerChannel::new(master_end));
        let receiver = HandleReceiver::from_stream(worker_end);
        let tx = received_tx.clone();
        receivers.push(tokio::spawn(async move {
            while let Ok(Some(stream)) = receiver.recv_stream().await {
                let peer = stream.peer_addr().unwrap();
                let _ = tx.send((worker, peer));
            }
        }));
    }

    let mut server = common::start(master(Arc::clone(&registry)), "master").await;

    let mut clients = Vec::new();
    for _ in 0..7 {
        let client = Client::connect(server.addr).await;
        let local = client.stream.local_addr().unwrap();
        let (worker, peer) = tokio::time::timeout(Duration::from_secs(2), received_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer, local);
        clients.push((worker, client));
    }

    let order: Vec<usize> = clients.iter().map(|(worker, _)| *worker).collect();
    assert_eq!(order, [0, 1, 2, 0, 1, 2, 0]);

    // The master keeps nothing after a transfer.
    server.wait_for_clients(0).await;
    server.assert_quiet(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn master_without_workers_serves_locally() {
    let registry = Arc::new(WorkerRegistry::new());
    let mut server = common::start(master(registry), "master").await;

    let mut client = Client::connect(server.addr).await;
    client.get("/local").await;
    let response = client.read_response().await.unwrap();
    assert_eq!(response.body, b"master");
    assert_eq!(server.next_event().await, Event::Request("/local".into()));
}

#[tokio::test]
async fn failed_handoff_drops_connection_and_reports() {
    let registry = Arc::new(WorkerRegistry::new());
    let (master_end, worker_end) = UnixStream::pair().unwrap();
    let entry = registry.register(4242, WorkerChannel::new(master_end));
    drop(worker_end);

    let mut server = common::start(master(Arc::clone(&registry)), "master").await;

    let mut client = Client::connect(server.addr).await;
    assert_eq!(server.next_event().await, Event::Error(ErrorKind::Handoff));
    assert!(client.closed_within(Duration::from_secs(2)).await);
    server.wait_for_clients(0).await;
    assert_eq!(registry.snapshot()[0].id(), entry.id());
}

#[tokio::test]
async fn request_is_served_by_registered_worker() {
    let path = common::socket_path("dispatch");
    let registry = Arc::new(WorkerRegistry::new());
    let cluster_listener = ClusterListener::bind(&path, Arc::clone(&registry)).unwrap();
    let (stop_tx, stop_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(cluster_listener.run(stop_rx));

    let mut worker_config = ServerConfig::default();
    worker_config.cluster.role = Role::Worker;
    worker_config.cluster.socket_path = path.clone();
    let worker = Arc::new(HttpServer::new(worker_config));
    let (worker_tx, mut worker_events) = mpsc::unbounded_channel();
    let worker_task = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            worker
                .listen(common::recording_handler(worker_tx, "worker"))
                .await
                .unwrap();
        })
    };
    {
        let registry = Arc::clone(&registry);
        common::wait_until(move || registry.len() == 1).await;
    }

    let mut front = common::start(master(Arc::clone(&registry)), "master").await;
    let mut client = Client::connect(front.addr).await;
    client.get("/via-worker").await;
    let response = client.read_response().await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"worker");

    let event = tokio::time::timeout(Duration::from_secs(2), worker_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, Event::Request("/via-worker".into()));
    front.assert_quiet(Duration::from_millis(100)).await;
    front.wait_for_clients(0).await;
    assert_eq!(worker.clients_connected(), 1);

    drop(client);
    {
        let worker = Arc::clone(&worker);
        common::wait_until(move || worker.clients_connected() == 0).await;
    }

    worker.close();
    tokio::time::timeout(Duration::from_secs(2), worker_task)
        .await
        .unwrap()
        .unwrap();
    let _ = stop_tx.send(());
}

#[tokio::test]
async fn worker_without_master_fails_to_listen() {
    let mut config = ServerConfig::default();
    config.cluster.role = Role::Worker;
    config.cluster.socket_path = common::socket_path("absent");
    let worker = HttpServer::new(config);
    let err = worker
        .listen(|_: cluster_http::http::HandlerInput| {})
        .await
        .unwrap_err();
    assert!(matches!(err, cluster_http::net::listener::BindError::Cluster { .. }));
}
