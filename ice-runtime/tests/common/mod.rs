//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ice_runtime::{Communicator, Current, IceError, Identity, ObjectAdapter, ObjectPrx, Result, RuntimeConfig, Servant};
use tokio::sync::Notify;

/// Type id of [`Hello`].
pub const HELLO_TYPE_ID: &str = "::Demo::Hello";

/// A servant with a few operations used across the tests.
///
/// * `sayHello` returns nothing.
/// * `echo` returns its parameters unchanged.
/// * `fail` raises the `::Demo::Failure` user exception.
/// * `crash` fails with a local error.
/// * `block` waits until [`Hello::release`] is called.
/// * `count` is oneway friendly and bumps [`Hello::calls`].
#[derive(Debug, Default)]
pub struct Hello {
    calls: AtomicUsize,
    gate: Notify,
}

impl Hello {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.gate.notify_waiters();
    }
}

#[async_trait]
impl Servant for Hello {
    fn ice_ids(&self) -> Vec<String> {
        vec!["::Ice::Object".to_string(), HELLO_TYPE_ID.to_string()]
    }

    async fn dispatch(&self, current: &Current) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match current.request.operation.as_str() {
            "sayHello" | "count" => Ok(Bytes::new()),
            "echo" => Ok(current.request.params.clone()),
            "fail" => Err(IceError::UserException {
                type_id: "::Demo::Failure".to_string(),
                data: Bytes::new(),
            }),
            "crash" => Err(IceError::Marshal("servant bug".to_string())),
            "block" => {
                self.gate.notified().await;
                Ok(Bytes::new())
            }
            _ => Err(current.operation_not_exist()),
        }
    }
}

/// Installs a test subscriber once. Set `RUST_LOG=ice=debug` to see the
/// runtime's traces.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn communicator() -> Communicator {
    communicator_with(RuntimeConfig::default())
}

pub fn communicator_with(config: RuntimeConfig) -> Communicator {
    init_tracing();
    Communicator::new(config).unwrap()
}

/// Starts an adapter on a loopback port with a [`Hello`] servant named
/// `hello` and returns a proxy for it.
pub async fn start_hello(server: &Communicator, endpoints: &str) -> (Arc<ObjectAdapter>, Arc<Hello>, ObjectPrx) {
    let adapter = server
        .create_object_adapter_with_endpoints("", endpoints)
        .await
        .unwrap();
    let hello = Hello::new();
    let prx = adapter.add(hello.clone(), Identity::new("hello", "")).unwrap();
    adapter.activate().await.unwrap();
    (adapter, hello, prx)
}

/// Parses `prx` in `client` so that the two sides use separate
/// communicators.
pub fn proxy_in(client: &Communicator, prx: &ObjectPrx) -> ObjectPrx {
    client.string_to_proxy(&prx.to_string()).unwrap().unwrap()
}

/// Polls `f` until it returns true or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, f: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}
