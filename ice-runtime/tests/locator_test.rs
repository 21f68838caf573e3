//! Indirect proxies resolved through a locator servant.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ice_runtime::core::protocol::OperationMode;
use ice_runtime::core::OutputStream;
use ice_runtime::{Communicator, Current, IceError, Identity, ObjectAdapter, ObjectPrx, Result, Servant};
use parking_lot::Mutex;

use common::{communicator, proxy_in, Hello};

/// A minimal registry answering `findAdapterById` and `findObjectById`.
#[derive(Debug, Default)]
struct Registry {
    adapters: Mutex<HashMap<String, ObjectPrx>>,
    objects: Mutex<HashMap<Identity, ObjectPrx>>,
    lookups: AtomicUsize,
}

impl Registry {
    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Servant for Registry {
    async fn dispatch(&self, current: &Current) -> Result<Bytes> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let mut is = current.request.input();
        let (found, not_found) = match current.request.operation.as_str() {
            "findAdapterById" => {
                let id = is.read_string()?;
                (self.adapters.lock().get(&id).cloned(), "::Ice::AdapterNotFoundException")
            }
            "findObjectById" => {
                let id: Identity = is.read()?;
                (self.objects.lock().get(&id).cloned(), "::Ice::ObjectNotFoundException")
            }
            _ => return Err(current.operation_not_exist()),
        };
        let Some(proxy) = found else {
            return Err(IceError::UserException {
                type_id: not_found.to_string(),
                data: Bytes::new(),
            });
        };
        let mut os = OutputStream::with_encoding(current.request.encoding);
        proxy.write(&mut os)?;
        Ok(Bytes::copy_from_slice(os.as_bytes()))
    }
}

struct Deployment {
    server: Communicator,
    registry: Arc<Registry>,
    hello: Arc<Hello>,
    locator: ObjectPrx,
    _adapters: Vec<Arc<ObjectAdapter>>,
}

async fn deploy() -> Deployment {
    let server = communicator();
    server.properties().set_property("Hello.AdapterId", "HelloAdapter");

    let hello_adapter = server
        .create_object_adapter_with_endpoints("Hello", "tcp -h 127.0.0.1 -p 0")
        .await
        .unwrap();
    let hello = Hello::new();
    let hello_id = Identity::new("hello", "");
    let indirect = hello_adapter.add(hello.clone(), hello_id.clone()).unwrap();
    assert_eq!(indirect.ice_get_adapter_id(), "HelloAdapter");
    hello_adapter.activate().await.unwrap();

    let registry = Arc::new(Registry::default());
    registry.adapters.lock().insert(
        "HelloAdapter".to_string(),
        hello_adapter.create_direct_proxy(Identity::new("dummy", "")).unwrap(),
    );
    registry.objects.lock().insert(hello_id, indirect);

    let registry_adapter = server
        .create_object_adapter_with_endpoints("Registry", "tcp -h 127.0.0.1 -p 0")
        .await
        .unwrap();
    let locator = registry_adapter
        .add(registry.clone(), Identity::new("Locator", "IceGrid"))
        .unwrap();
    registry_adapter.activate().await.unwrap();

    Deployment {
        server,
        registry,
        hello,
        locator,
        _adapters: vec![hello_adapter, registry_adapter],
    }
}

#[tokio::test]
async fn test_adapter_lookup_is_cached() {
    let deployment = deploy().await;
    let client = communicator();
    let locator = proxy_in(&client, &deployment.locator);

    let prx = client
        .string_to_proxy("hello @ HelloAdapter")
        .unwrap()
        .unwrap()
        .ice_locator(Some(&locator))
        .unwrap();
    prx.invoke("sayHello", OperationMode::Normal, &[]).await.unwrap();
    assert_eq!(deployment.hello.calls(), 1);
    assert_eq!(deployment.registry.lookups(), 1);

    // A second proxy for the same adapter uses the cached endpoints.
    let again = client
        .string_to_proxy("hello @ HelloAdapter")
        .unwrap()
        .unwrap()
        .ice_locator(Some(&locator))
        .unwrap();
    again.invoke("sayHello", OperationMode::Normal, &[]).await.unwrap();
    assert_eq!(deployment.hello.calls(), 2);
    assert_eq!(deployment.registry.lookups(), 1);

    client.destroy().await;
    deployment.server.destroy().await;
}

#[tokio::test]
async fn test_well_known_object_lookup() {
    let deployment = deploy().await;
    let client = communicator();
    client.set_default_locator(Some(proxy_in(&client, &deployment.locator)));

    let prx = client.string_to_proxy("hello").unwrap().unwrap();
    prx.invoke("sayHello", OperationMode::Normal, &[]).await.unwrap();
    assert_eq!(deployment.hello.calls(), 1);
    // One lookup for the object, one for its adapter.
    assert_eq!(deployment.registry.lookups(), 2);

    client.destroy().await;
    deployment.server.destroy().await;
}

#[tokio::test]
async fn test_unknown_adapter() {
    let deployment = deploy().await;
    let client = communicator();
    client.set_default_locator(Some(proxy_in(&client, &deployment.locator)));

    let prx = client.string_to_proxy("hello @ Missing").unwrap().unwrap();
    let err = prx.ice_ping().await.unwrap_err();
    assert!(
        matches!(err, IceError::NotRegistered { ref id, .. } if id == "Missing"),
        "unexpected error {err:?}"
    );

    client.destroy().await;
    deployment.server.destroy().await;
}

#[tokio::test]
async fn test_indirect_proxy_without_locator() {
    let client = communicator();
    let prx = client.string_to_proxy("hello @ HelloAdapter").unwrap().unwrap();
    assert!(matches!(prx.ice_ping().await, Err(IceError::NoEndpoint(_))));
    client.destroy().await;
}
