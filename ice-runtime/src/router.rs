//! Router indirection.
//!
//! A routed proxy sends its requests to the router's client endpoints. Before
//! the first request the proxy is registered with the router; registrations
//! are remembered so each identity is added once.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ice_core::protocol::OperationMode;
use ice_core::{IceError, Identity, OutputStream, Result};
use parking_lot::Mutex;

use crate::adapter::ObjectAdapter;
use crate::endpoint::Endpoint;
use crate::proxy::ObjectPrx;
use crate::reference::Reference;

/// The routing service.
#[async_trait]
pub trait Router: Send + Sync + fmt::Debug {
    /// Returns the proxy clients send their requests to.
    async fn get_client_proxy(&self) -> Result<Option<ObjectPrx>>;

    /// Returns the proxy the router uses to reach back into this process.
    async fn get_server_proxy(&self) -> Result<Option<ObjectPrx>>;

    /// Registers `proxies` and returns the proxies the router evicted.
    async fn add_proxies(&self, proxies: &[ObjectPrx]) -> Result<Vec<ObjectPrx>>;
}

/// A [`Router`] reached through a proxy.
#[derive(Debug, Clone)]
pub struct RouterPrx {
    proxy: ObjectPrx,
}

impl RouterPrx {
    pub fn new(proxy: ObjectPrx) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &ObjectPrx {
        &self.proxy
    }

    async fn get_proxy(&self, operation: &str) -> Result<Option<ObjectPrx>> {
        let reply = self
            .proxy
            .invoke_with_exceptions(operation, OperationMode::Nonmutating, &[], None, &[], true)
            .await?;
        ObjectPrx::read(self.proxy.reference().instance(), &mut reply.input())
    }
}

#[async_trait]
impl Router for RouterPrx {
    async fn get_client_proxy(&self) -> Result<Option<ObjectPrx>> {
        self.get_proxy("getClientProxy").await
    }

    async fn get_server_proxy(&self) -> Result<Option<ObjectPrx>> {
        self.get_proxy("getServerProxy").await
    }

    async fn add_proxies(&self, proxies: &[ObjectPrx]) -> Result<Vec<ObjectPrx>> {
        let mut os = OutputStream::with_encoding(self.proxy.ice_get_encoding_version());
        os.write_size(proxies.len());
        for proxy in proxies {
            proxy.write(&mut os)?;
        }
        let reply = self
            .proxy
            .invoke_with_exceptions("addProxies", OperationMode::Idempotent, os.as_bytes(), None, &[], true)
            .await?;

        let instance = self.proxy.reference().instance();
        let mut is = reply.input();
        let count = is.read_seq_size(2)?;
        let mut evicted = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(proxy) = ObjectPrx::read(instance, &mut is)? {
                evicted.push(proxy);
            }
        }
        Ok(evicted)
    }
}

#[derive(Default)]
struct RouterState {
    client_endpoints: Option<Vec<Endpoint>>,
    server_endpoints: Option<Vec<Endpoint>>,
    identities: HashSet<Identity>,
    evicted: HashSet<Identity>,
    adapter: Option<Weak<ObjectAdapter>>,
}

/// Cached router endpoints and registrations for one router.
pub struct RouterInfo {
    router: Arc<dyn Router>,
    proxy: Option<ObjectPrx>,
    state: Mutex<RouterState>,
}

impl fmt::Debug for RouterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterInfo")
            .field("router", &self.router)
            .field("registered", &self.state.lock().identities.len())
            .finish()
    }
}

impl RouterInfo {
    pub fn new(router: Arc<dyn Router>) -> Arc<Self> {
        Arc::new(Self::build(router, None))
    }

    fn build(router: Arc<dyn Router>, proxy: Option<ObjectPrx>) -> Self {
        Self {
            router,
            proxy,
            state: Mutex::new(RouterState::default()),
        }
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Returns the router proxy, if the router is remote.
    pub fn proxy(&self) -> Option<&ObjectPrx> {
        self.proxy.as_ref()
    }

    /// Returns the endpoints routed requests are sent to.
    ///
    /// Without a client proxy the router's own endpoints are used.
    pub async fn get_client_endpoints(&self) -> Result<Vec<Endpoint>> {
        if let Some(endpoints) = &self.state.lock().client_endpoints {
            return Ok(endpoints.clone());
        }
        let endpoints = match self.router.get_client_proxy().await? {
            Some(client) => client.ice_get_endpoints().to_vec(),
            None => self
                .proxy
                .as_ref()
                .map(|proxy| proxy.ice_get_endpoints().to_vec())
                .unwrap_or_default(),
        };
        let mut state = self.state.lock();
        Ok(state.client_endpoints.get_or_insert(endpoints).clone())
    }

    /// Returns the endpoints the router reaches this process through.
    pub async fn get_server_endpoints(&self) -> Result<Vec<Endpoint>> {
        if let Some(endpoints) = &self.state.lock().server_endpoints {
            return Ok(endpoints.clone());
        }
        let server = self
            .router
            .get_server_proxy()
            .await?
            .ok_or_else(|| IceError::NoEndpoint("router has no server proxy".to_string()))?;
        let endpoints = server.ice_get_endpoints().to_vec();
        let mut state = self.state.lock();
        Ok(state.server_endpoints.get_or_insert(endpoints).clone())
    }

    /// Registers `proxy` with the router unless it already is.
    pub async fn add_proxy(&self, proxy: &ObjectPrx) -> Result<()> {
        let identity = proxy.ice_get_identity();
        if self.state.lock().identities.contains(identity) {
            return Ok(());
        }
        let evicted = self.router.add_proxies(std::slice::from_ref(proxy)).await?;

        let mut state = self.state.lock();
        // A concurrent registration may already have seen this identity
        // evicted.
        if !state.evicted.remove(identity) {
            state.identities.insert(identity.clone());
        }
        for proxy in evicted {
            let id = proxy.ice_get_identity();
            if !state.identities.remove(id) {
                state.evicted.insert(id.clone());
            }
        }
        Ok(())
    }

    /// Forgets the registration of `reference`.
    pub fn clear_cache(&self, reference: &Reference) {
        self.state.lock().identities.remove(reference.identity());
    }

    /// Returns the adapter that receives callbacks through this router.
    pub fn adapter(&self) -> Option<Arc<ObjectAdapter>> {
        self.state.lock().adapter.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_adapter(&self, adapter: Option<&Arc<ObjectAdapter>>) {
        self.state.lock().adapter = adapter.map(Arc::downgrade);
    }

    pub fn destroy(&self) {
        let mut state = self.state.lock();
        *state = RouterState::default();
    }
}

/// Shares one [`RouterInfo`] per router proxy.
#[derive(Debug, Default)]
pub struct RouterManager {
    infos: Mutex<HashMap<Reference, Arc<RouterInfo>>>,
}

impl RouterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the info for `router`, creating it on first use.
    pub fn get(&self, router: &ObjectPrx) -> Arc<RouterInfo> {
        // The router itself is never routed.
        let router = router.ice_router(None).unwrap_or_else(|_| router.clone());
        self.infos
            .lock()
            .entry(router.reference().clone())
            .or_insert_with(|| {
                Arc::new(RouterInfo::build(
                    Arc::new(RouterPrx::new(router.clone())),
                    Some(router.clone()),
                ))
            })
            .clone()
    }

    /// Removes and returns the info for `router`.
    pub fn erase(&self, router: &ObjectPrx) -> Option<Arc<RouterInfo>> {
        let router = router.ice_router(None).unwrap_or_else(|_| router.clone());
        self.infos.lock().remove(router.reference())
    }

    pub fn destroy(&self) {
        for info in self.infos.lock().drain().map(|(_, info)| info) {
            info.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::communicator::Communicator;

    #[derive(Debug)]
    struct FakeRouter {
        client: ObjectPrx,
        evict: Mutex<Vec<ObjectPrx>>,
        added: AtomicUsize,
    }

    #[async_trait]
    impl Router for FakeRouter {
        async fn get_client_proxy(&self) -> Result<Option<ObjectPrx>> {
            Ok(Some(self.client.clone()))
        }

        async fn get_server_proxy(&self) -> Result<Option<ObjectPrx>> {
            Ok(None)
        }

        async fn add_proxies(&self, proxies: &[ObjectPrx]) -> Result<Vec<ObjectPrx>> {
            self.added.fetch_add(proxies.len(), Ordering::SeqCst);
            Ok(std::mem::take(&mut *self.evict.lock()))
        }
    }

    #[tokio::test]
    async fn test_router_info_registers_once_and_honours_evictions() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let client = communicator
            .string_to_proxy("router:tcp -h 127.0.0.1 -p 12020")
            .unwrap()
            .unwrap();
        let a = communicator.string_to_proxy("a:tcp -h 127.0.0.1 -p 1").unwrap().unwrap();
        let b = communicator.string_to_proxy("b:tcp -h 127.0.0.1 -p 1").unwrap().unwrap();
        let router = Arc::new(FakeRouter {
            client: client.clone(),
            evict: Mutex::new(Vec::new()),
            added: AtomicUsize::new(0),
        });
        let info = RouterInfo::new(router.clone());

        assert_eq!(info.get_client_endpoints().await.unwrap(), client.ice_get_endpoints());
        assert!(info.get_server_endpoints().await.is_err());

        info.add_proxy(&a).await.unwrap();
        info.add_proxy(&a).await.unwrap();
        assert_eq!(router.added.load(Ordering::SeqCst), 1);

        // Registering b evicts a, so a is registered again next time.
        router.evict.lock().push(a.clone());
        info.add_proxy(&b).await.unwrap();
        info.add_proxy(&a).await.unwrap();
        assert_eq!(router.added.load(Ordering::SeqCst), 3);

        info.clear_cache(b.reference());
        info.add_proxy(&b).await.unwrap();
        assert_eq!(router.added.load(Ordering::SeqCst), 4);
    }
}
