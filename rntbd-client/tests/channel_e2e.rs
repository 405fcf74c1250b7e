mod common;

use common::{response_body, FakeServer, Mode};
use rntbd_client::{
    Channel, ClientError, LoadBalancingPartition, TransportClient, TransportContext,
    TransportErrorCode, TransportOptions,
};
use rntbd_protocol::{OperationType, RequestMessage, ResourceType};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn read_request(n: usize) -> RequestMessage {
    RequestMessage::new(ResourceType::Document, OperationType::Read)
        .with_resource_address(format!("dbs/db/colls/c/docs/{}", n))
}

fn channel(server: &FakeServer, options: TransportOptions) -> Arc<Channel> {
    Channel::new(server.address.clone(), TransportContext::new(options).unwrap())
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let server = FakeServer::start(Mode::Echo).await;
    let channel = channel(&server, TransportOptions::default());
    channel.open().await.unwrap();

    let mut tasks = Vec::new();
    for n in 0..50 {
        let channel = Arc::clone(&channel);
        let path = server.address.replica_path().to_string();
        tasks.push(tokio::spawn(async move {
            let request = read_request(n);
            let response = channel.request(&request, &path).await.unwrap();
            (request.activity_id, response)
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        let (activity_id, response) = task.await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.activity_id, activity_id);
        let id = response.transport_request_id.unwrap();
        assert_eq!(&response.body[..], response_body(id).as_bytes());
        assert!(ids.insert(id), "request id {} answered twice", id);
    }
    assert_eq!(ids.len(), 50);
    assert_eq!(server.requests(), 50);
    assert_eq!(channel.pending_calls(), 0);
}

#[tokio::test]
async fn test_request_timeout_releases_call() {
    let server = FakeServer::start(Mode::Silent).await;
    let channel = channel(
        &server,
        TransportOptions::default().with_request_timeout(Duration::from_secs(1)),
    );
    channel.open().await.unwrap();

    let request = read_request(0);
    let started = Instant::now();
    let err = channel
        .request(&request, server.address.replica_path())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "unexpected error: {}", err);
    assert_eq!(err.transport_code(), Some(TransportErrorCode::RequestTimeout));
    assert!(err.payload_sent());
    assert!(elapsed >= Duration::from_secs(1), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "returned after {:?}", elapsed);
    assert_eq!(channel.pending_calls(), 0);
    assert!(!channel.healthy());
}

#[tokio::test]
async fn test_connection_fault_fails_every_pending_call() {
    let server = FakeServer::start(Mode::FaultAfter(5)).await;
    let channel = channel(&server, TransportOptions::default());
    channel.open().await.unwrap();

    let mut tasks = Vec::new();
    for n in 0..5 {
        let channel = Arc::clone(&channel);
        let path = server.address.replica_path().to_string();
        tasks.push(tokio::spawn(async move {
            channel.request(&read_request(n), &path).await
        }));
    }

    let started = Instant::now();
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.transport_code(), Some(TransportErrorCode::ConnectionBroken));
        assert!(err.payload_sent());
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(channel.pending_calls(), 0);
    assert!(!channel.healthy());
}

#[tokio::test]
async fn test_close_cancels_pending_calls() {
    let server = FakeServer::start(Mode::Silent).await;
    let channel = channel(&server, TransportOptions::default());
    channel.open().await.unwrap();

    let pending = {
        let channel = Arc::clone(&channel);
        let path = server.address.replica_path().to_string();
        tokio::spawn(async move { channel.request(&read_request(0), &path).await })
    };
    server.wait_for_requests(1).await;

    channel.close();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Cancelled));
}

#[tokio::test]
async fn test_partition_throttles_over_ceiling() {
    let server = FakeServer::start(Mode::Silent).await;
    let context = TransportContext::new(
        TransportOptions::default().with_request_timeout(Duration::from_secs(1)),
    )
    .unwrap();
    let partition = Arc::new(LoadBalancingPartition::new(server.address.clone(), context, 1, 2));

    let mut waiting = Vec::new();
    for n in 0..2 {
        let partition = Arc::clone(&partition);
        let path = server.address.replica_path().to_string();
        waiting.push(tokio::spawn(async move {
            partition.request(&read_request(n), &path).await
        }));
    }
    server.wait_for_requests(2).await;

    let err = partition
        .request(&read_request(2), server.address.replica_path())
        .await
        .unwrap_err();
    assert!(err.is_throttled());
    assert!(!err.payload_sent());

    for task in waiting {
        assert!(task.await.unwrap().unwrap_err().is_timeout());
    }
    assert_eq!(server.requests(), 2);
}

#[tokio::test]
async fn test_transport_client_reuses_channels() {
    let server = FakeServer::start(Mode::Echo).await;
    let client = TransportClient::new(TransportOptions::default()).unwrap();

    for n in 0..3 {
        let response = client.invoke(&server.address, read_request(n)).await.unwrap();
        assert!(response.is_success());
    }
    assert_eq!(client.endpoint_count(), 1);
    assert_eq!(server.connections.load(std::sync::atomic::Ordering::SeqCst), 1);

    client.close();
    let err = client
        .invoke(&server.address, read_request(3))
        .await
        .unwrap_err();
    assert_eq!(err.transport_code(), Some(TransportErrorCode::ChannelClosed));
}

#[tokio::test]
async fn test_invalid_header_rejected_before_send() {
    let server = FakeServer::start(Mode::Echo).await;
    let client = TransportClient::new(TransportOptions::default()).unwrap();

    let request = read_request(0).with_header("x-ms-target-lsn", "latest");
    let err = client.invoke(&server.address, request).await.unwrap_err();
    assert!(err.is_local_validation());
    assert!(!err.payload_sent());
    assert_eq!(server.requests(), 0);
}

#[tokio::test]
async fn test_request_dropped_mid_write_breaks_channel() {
    let server = FakeServer::start(Mode::Stall(Duration::from_millis(800))).await;
    let channel = channel(&server, TransportOptions::default());
    channel.open().await.unwrap();
    assert!(channel.healthy());

    let large = RequestMessage::new(ResourceType::Document, OperationType::Create)
        .with_resource_address("dbs/db/colls/c")
        .with_body(vec![b'x'; 32 * 1024 * 1024]);
    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        channel.request(&large, server.address.replica_path()),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(!channel.healthy());

    // Nothing may follow the partial frame on this connection.
    let err = channel
        .request(&read_request(0), server.address.replica_path())
        .await
        .unwrap_err();
    assert_eq!(err.transport_code(), Some(TransportErrorCode::SendFailed));
    assert!(!err.payload_sent());
    assert_eq!(channel.pending_calls(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(server.requests(), 0);
}

#[tokio::test]
async fn test_transport_client_replaces_broken_channel() {
    let server = FakeServer::start(Mode::FaultFirstAfter(1)).await;
    let client = TransportClient::new(TransportOptions::default()).unwrap();

    let err = client
        .invoke(&server.address, read_request(0))
        .await
        .unwrap_err();
    assert_eq!(err.transport_code(), Some(TransportErrorCode::ConnectionBroken));
    assert_eq!(server.connections(), 1);

    let response = client.invoke(&server.address, read_request(1)).await.unwrap();
    assert!(response.is_success());
    assert_eq!(server.connections(), 2);
    assert_eq!(client.endpoint_count(), 1);

    client.invoke(&server.address, read_request(2)).await.unwrap();
    assert_eq!(server.connections(), 2);
}
