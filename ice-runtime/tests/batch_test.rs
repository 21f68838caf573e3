//! Batched oneway requests.

mod common;

use std::time::Duration;

use ice_runtime::core::protocol::OperationMode;
use ice_runtime::{Identity, RuntimeConfig};

use common::{communicator, communicator_with, proxy_in, start_hello, wait_until};

#[tokio::test]
async fn test_batch_requests_wait_for_flush() {
    let server = communicator();
    let client = communicator();
    let (_adapter, hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let batch = proxy_in(&client, &prx).ice_batch_oneway();

    for _ in 0..3 {
        batch.invoke("count", OperationMode::Normal, &[]).await.unwrap();
    }
    assert_eq!(batch.batch_queue().len(), 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hello.calls(), 0);

    batch.ice_flush_batch_requests().await.unwrap();
    assert!(batch.batch_queue().is_empty());
    assert!(wait_until(Duration::from_secs(5), || hello.calls() == 3).await);

    // Flushing an empty queue is a no-op.
    batch.ice_flush_batch_requests().await.unwrap();

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_batch_auto_flush() {
    let server = communicator();
    let config = RuntimeConfig::builder().batch_auto_flush_size(64).build().unwrap();
    let client = communicator_with(config);
    let (_adapter, hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let batch = proxy_in(&client, &prx).ice_batch_oneway();

    for _ in 0..5 {
        batch.invoke("count", OperationMode::Normal, &[]).await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || hello.calls() >= 2).await);
    assert!(batch.batch_queue().len() < 5);

    batch.ice_flush_batch_requests().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || hello.calls() == 5).await);

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_connection_batch_flushed_by_communicator() {
    let server = communicator();
    let client = communicator();
    let (_adapter, hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let prx = proxy_in(&client, &prx);
    let connection = prx.ice_get_connection().await.unwrap().unwrap();

    let fixed = connection
        .create_proxy(Identity::new("hello", ""))
        .unwrap()
        .ice_batch_oneway();
    fixed.invoke("count", OperationMode::Normal, &[]).await.unwrap();
    fixed.invoke("count", OperationMode::Normal, &[]).await.unwrap();
    assert_eq!(connection.batch_queue().len(), 2);

    client.flush_batch_requests().await.unwrap();
    assert!(connection.batch_queue().is_empty());
    assert!(wait_until(Duration::from_secs(5), || hello.calls() == 2).await);

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_collocated_batch() {
    let communicator = communicator();
    let (_adapter, hello, prx) = start_hello(&communicator, "tcp -h 127.0.0.1 -p 0").await;
    let batch = prx.ice_batch_oneway();

    batch.invoke("count", OperationMode::Normal, &[]).await.unwrap();
    batch.invoke("count", OperationMode::Normal, &[]).await.unwrap();
    assert_eq!(hello.calls(), 0);
    batch.ice_flush_batch_requests().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || hello.calls() == 2).await);

    communicator.destroy().await;
}
