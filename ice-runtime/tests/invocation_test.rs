//! End-to-end invocations over loopback TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ice_runtime::core::protocol::{OperationMode, ENCODING_1_1};
use ice_runtime::core::OutputStream;
use ice_runtime::{IceError, RuntimeConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use common::{communicator, communicator_with, proxy_in, start_hello, wait_until, HELLO_TYPE_ID};

const VALIDATE_CONNECTION: [u8; 14] = [
    0x49, 0x63, 0x65, 0x50, 1, 0, 1, 0, 3, 0, 14, 0, 0, 0,
];

#[tokio::test]
async fn test_twoway_reply_ok_with_empty_encapsulation_from_raw_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&VALIDATE_CONNECTION).await.unwrap();

        let mut header = [0u8; 14];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..4], b"IceP");
        assert_eq!(&header[4..8], &[1, 0, 1, 0]);
        assert_eq!(header[8], 0, "request message type");
        let size = i32::from_le_bytes(header[10..14].try_into().unwrap()) as usize;
        let mut body = vec![0u8; size - 14];
        socket.read_exact(&mut body).await.unwrap();
        let request_id = i32::from_le_bytes(body[..4].try_into().unwrap());
        assert_ne!(request_id, 0);

        // Reply: header, request id, replyOK, empty 1.1 encapsulation.
        let mut reply = vec![0x49, 0x63, 0x65, 0x50, 1, 0, 1, 0, 2, 0, 25, 0, 0, 0];
        reply.extend_from_slice(&request_id.to_le_bytes());
        reply.push(0);
        reply.extend_from_slice(&[6, 0, 0, 0, 1, 1]);
        socket.write_all(&reply).await.unwrap();

        // Keep the socket open until the client is done.
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let client = communicator();
    let prx = client
        .string_to_proxy(&format!("hello:tcp -h 127.0.0.1 -p {port}"))
        .unwrap()
        .unwrap();
    let reply = prx.invoke("op", OperationMode::Normal, &[]).await.unwrap();
    assert!(reply.payload.is_empty());
    assert_eq!(reply.encoding, ENCODING_1_1);

    let connection = prx.ice_get_cached_connection().expect("connection is cached");
    assert!(connection.is_active());
    assert!(!connection.is_incoming());

    client.destroy().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_twoway_between_communicators_reuses_connection() {
    let server = communicator();
    let client = communicator();
    let (_adapter, hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let prx = proxy_in(&client, &prx);

    prx.invoke("sayHello", OperationMode::Normal, &[]).await.unwrap();
    let first = prx.ice_get_connection().await.unwrap().unwrap();
    prx.ice_ping().await.unwrap();
    let second = prx.ice_get_connection().await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.is_active());
    // ice_ping is answered by the adapter without reaching the servant.
    assert_eq!(hello.calls(), 1);

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_echo_returns_parameters() {
    let server = communicator();
    let client = communicator();
    let (_adapter, _hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let prx = proxy_in(&client, &prx);

    let mut os = OutputStream::with_encoding(ENCODING_1_1);
    os.write_string("ping");
    os.write_i32(42);
    let reply = prx.invoke("echo", OperationMode::Idempotent, os.as_bytes()).await.unwrap();
    let mut is = reply.input();
    assert_eq!(is.read_string().unwrap(), "ping");
    assert_eq!(is.read_i32().unwrap(), 42);

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_remote_errors() {
    let server = communicator();
    let client = communicator();
    let (_adapter, _hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let prx = proxy_in(&client, &prx);

    let err = prx
        .invoke_with_exceptions("fail", OperationMode::Normal, &[], None, &["::Demo::Failure"], false)
        .await
        .unwrap_err();
    assert!(matches!(err, IceError::UserException { ref type_id, .. } if type_id == "::Demo::Failure"));

    let err = prx.invoke("fail", OperationMode::Normal, &[]).await.unwrap_err();
    assert!(matches!(err, IceError::UnknownUserException(ref id) if id == "::Demo::Failure"));

    let err = prx.invoke("crash", OperationMode::Normal, &[]).await.unwrap_err();
    assert!(matches!(err, IceError::UnknownLocalException(_)));

    let err = prx.invoke("missing", OperationMode::Normal, &[]).await.unwrap_err();
    assert!(matches!(err, IceError::OperationNotExist { ref operation, .. } if operation == "missing"));

    let other = prx.ice_identity("nobody".parse().unwrap()).unwrap();
    let err = other.ice_ping().await.unwrap_err();
    assert!(matches!(err, IceError::ObjectNotExist { ref id, .. } if id.name == "nobody"));

    // Remote errors leave the connection usable.
    prx.ice_ping().await.unwrap();

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_builtin_operations() {
    let server = communicator();
    let client = communicator();
    let (_adapter, _hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let prx = proxy_in(&client, &prx);

    assert!(prx.ice_is_a(HELLO_TYPE_ID).await.unwrap());
    assert!(!prx.ice_is_a("::Demo::Other").await.unwrap());
    assert_eq!(prx.ice_id().await.unwrap(), HELLO_TYPE_ID);
    assert_eq!(
        prx.ice_ids().await.unwrap(),
        vec!["::Demo::Hello".to_string(), "::Ice::Object".to_string()]
    );

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_oneway_is_dispatched() {
    let server = communicator();
    let client = communicator();
    let (_adapter, hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let prx = proxy_in(&client, &prx).ice_oneway();

    let reply = prx.invoke("count", OperationMode::Normal, &[]).await.unwrap();
    assert!(reply.payload.is_empty());
    assert!(wait_until(Duration::from_secs(5), || hello.calls() == 1).await);

    // Built-in operations that return values need a twoway proxy.
    assert!(matches!(prx.ice_id().await, Err(IceError::TwowayOnly(_))));

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_invocation_timeout() {
    let server = communicator();
    let client = communicator();
    let (_adapter, hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let prx = proxy_in(&client, &prx).ice_invocation_timeout(Some(Duration::from_millis(100)));

    let err = prx.invoke("block", OperationMode::Normal, &[]).await.unwrap_err();
    assert!(matches!(err, IceError::InvocationTimeout));
    hello.release();

    // The timeout only affects the invocation, not the connection.
    let connection = prx.ice_get_cached_connection().unwrap();
    assert!(connection.is_active());

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_cancel_background_invocation() {
    let server = communicator();
    let client = communicator();
    let (_adapter, hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let prx = proxy_in(&client, &prx);
    prx.ice_ping().await.unwrap();

    let future = prx.invoke_async("block", OperationMode::Normal, &[], None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || hello.calls() == 1).await);
    future.cancel();
    assert!(matches!(future.await, Err(IceError::InvocationCanceled)));
    hello.release();

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_connection_refused_after_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = RuntimeConfig::builder()
        .retry_intervals([Duration::ZERO, Duration::from_millis(10)])
        .build()
        .unwrap();
    let client = communicator_with(config);
    let prx = client
        .string_to_proxy(&format!("hello:tcp -h 127.0.0.1 -p {port}"))
        .unwrap()
        .unwrap();
    let err = prx.ice_ping().await.unwrap_err();
    assert!(
        matches!(err, IceError::ConnectionRefused(_) | IceError::ConnectFailed(_)),
        "unexpected error {err:?}"
    );
    client.destroy().await;
}

#[tokio::test]
async fn test_invocation_timeout_interrupts_retry_delay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = RuntimeConfig::builder()
        .retry_intervals([Duration::from_secs(3)])
        .build()
        .unwrap();
    let client = communicator_with(config);
    let prx = client
        .string_to_proxy(&format!("hello:tcp -h 127.0.0.1 -p {port}"))
        .unwrap()
        .unwrap()
        .ice_invocation_timeout(Some(Duration::from_millis(100)));

    let started = std::time::Instant::now();
    let err = prx.ice_ping().await.unwrap_err();
    assert!(matches!(err, IceError::InvocationTimeout), "unexpected error {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    client.destroy().await;
}

#[tokio::test]
async fn test_collocated_invocation_skips_transport() {
    let communicator = communicator();
    let (_adapter, hello, prx) = start_hello(&communicator, "tcp -h 127.0.0.1 -p 0").await;

    prx.invoke("sayHello", OperationMode::Normal, &[]).await.unwrap();
    assert!(prx.ice_get_connection().await.unwrap().is_none());
    assert_eq!(hello.calls(), 1);

    let remote = prx.ice_collocation_optimized(false).unwrap();
    remote.invoke("sayHello", OperationMode::Normal, &[]).await.unwrap();
    assert!(remote.ice_get_connection().await.unwrap().is_some());
    assert_eq!(hello.calls(), 2);

    communicator.destroy().await;
}

#[tokio::test]
async fn test_adapter_closing_connections_is_seen_by_client() {
    let server = communicator();
    let client = communicator();
    let (adapter, hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0").await;
    let prx = proxy_in(&client, &prx);
    prx.ice_ping().await.unwrap();

    let connection = prx.ice_get_cached_connection().unwrap();
    adapter.close_connections(ice_runtime::CloseMode::Forcefully).await;
    connection.wait_until_finished().await;
    assert!(connection.close_error().is_some());
    hello.release();

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn test_datagram_invocation() {
    let server = communicator();
    let client = communicator();
    let (adapter, hello, prx) = start_hello(&server, "tcp -h 127.0.0.1 -p 0:udp -h 127.0.0.1 -p 0").await;
    assert_eq!(adapter.endpoints().len(), 2);
    let prx = proxy_in(&client, &prx).ice_datagram();

    prx.invoke("count", OperationMode::Normal, &[]).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || hello.calls() == 1).await);
    let connection = prx.ice_get_cached_connection().unwrap();
    assert!(connection.is_datagram());

    // Twoway requests cannot travel over a datagram proxy.
    assert!(matches!(prx.ice_ids().await, Err(IceError::TwowayOnly(_))));

    client.destroy().await;
    server.destroy().await;
}
