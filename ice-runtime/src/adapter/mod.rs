//! Object adapters: the server side of a communicator.
//!
//! An [`ObjectAdapter`] listens on its endpoints, owns a table of servants
//! and dispatches incoming requests through a [`Dispatcher`] chain. The
//! default chain logs and observes every dispatch before handing it to the
//! servant:
//!
//! ```text
//! LoggerMiddleware -> ObserverMiddleware -> ServantDispatcher -> Servant
//! ```

mod middleware;
mod request;
mod servant;

use std::sync::{Arc, Weak};

use ice_core::{IceError, Identity, Result};
use parking_lot::{Mutex, RwLock};

pub use middleware::{Dispatcher, LoggerMiddleware, ObserverMiddleware, ServantDispatcher};
pub use request::{read_batch, Current, IncomingRequest, OutgoingResponse};
pub use servant::{Servant, ServantManager};

use crate::acm::{AcmConfig, AcmMonitor, FactoryAcmMonitor};
use crate::connection::{CloseMode, Connection, IncomingConnectionFactory};
use crate::endpoint::Endpoint;
use crate::instance::Instance;
use crate::proxy::ObjectPrx;
use crate::reference::{split_endpoints, Reference};
use crate::router::RouterInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivationState {
    Inactive,
    Active,
    Deactivated,
}

struct AdapterState {
    activation: ActivationState,
    factories: Vec<Arc<IncomingConnectionFactory>>,
    published: Vec<Endpoint>,
    router: Option<Arc<RouterInfo>>,
}

/// Hosts servants and dispatches the requests addressed to them.
pub struct ObjectAdapter {
    name: String,
    adapter_id: String,
    instance: Weak<Instance>,
    servants: Arc<ServantManager>,
    dispatcher: RwLock<Arc<dyn Dispatcher>>,
    monitor: Arc<FactoryAcmMonitor>,
    state: Mutex<AdapterState>,
    me: Weak<ObjectAdapter>,
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ObjectAdapter")
            .field("name", &self.name)
            .field("adapter_id", &self.adapter_id)
            .field("state", &state.activation)
            .field("endpoints", &state.factories.len())
            .finish()
    }
}

fn parse_endpoints(instance: &Instance, s: &str) -> Result<Vec<Endpoint>> {
    let mut endpoints = Vec::new();
    for part in split_endpoints(s)? {
        if part.trim().is_empty() {
            continue;
        }
        endpoints.push(instance.endpoint_factories().create(part, true)?);
    }
    Ok(endpoints)
}

impl ObjectAdapter {
    /// Creates an adapter and binds `endpoints`. The adapter dispatches no
    /// requests until [`activate`](Self::activate) is called.
    #[tracing::instrument(skip(instance), fields(adapter = %name))]
    pub(crate) async fn create(
        instance: &Arc<Instance>,
        name: &str,
        endpoints: Option<&str>,
        router: Option<&ObjectPrx>,
    ) -> Result<Arc<Self>> {
        instance.check_destroyed()?;
        let properties = instance.properties();
        let config = instance.config();
        let acm = AcmConfig::from_properties(properties, &format!("{name}.ACM"), config.server_acm());

        let observer = instance.observer().clone();
        let servants = Arc::new(ServantManager::new());
        let chain: Arc<dyn Dispatcher> = Arc::new(ServantDispatcher::new(servants.clone()));
        let chain: Arc<dyn Dispatcher> = Arc::new(ObserverMiddleware::new(chain, observer));
        let chain: Arc<dyn Dispatcher> = Arc::new(LoggerMiddleware::new(
            chain,
            config.warn_dispatch(),
            config.trace().protocol,
        ));

        let adapter = Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            adapter_id: properties.get_property(&format!("{name}.AdapterId")),
            instance: Arc::downgrade(instance),
            servants,
            dispatcher: RwLock::new(chain),
            monitor: FactoryAcmMonitor::new(instance.timer().clone(), acm),
            state: Mutex::new(AdapterState {
                activation: ActivationState::Inactive,
                factories: Vec::new(),
                published: Vec::new(),
                router: None,
            }),
            me: me.clone(),
        });
        instance.add_adapter(adapter.clone())?;

        if let Err(err) = adapter.bind(instance, endpoints, router).await {
            adapter.deactivate();
            return Err(err);
        }
        Ok(adapter)
    }

    async fn bind(&self, instance: &Arc<Instance>, endpoints: Option<&str>, router: Option<&ObjectPrx>) -> Result<()> {
        let properties = instance.properties();

        if let Some(router) = router {
            let info = instance.router_manager().get(router);
            let published = info.get_server_endpoints().await?;
            if let Some(me) = self.me.upgrade() {
                info.set_adapter(Some(&me));
                // Callbacks arrive over the connection to the router.
                let client_endpoints = info.get_client_endpoints().await?;
                let connection = instance
                    .outgoing_connection_factory()
                    .create(&client_endpoints)
                    .await?;
                connection.set_adapter(Some(&me));
            }
            let mut state = self.state.lock();
            state.published = published;
            state.router = Some(info);
            return Ok(());
        }

        let endpoints = match endpoints {
            Some(endpoints) => endpoints.to_string(),
            None => properties.get_property(&format!("{}.Endpoints", self.name)),
        };
        let monitor: Arc<dyn AcmMonitor> = self.monitor.clone();
        let mut factories = Vec::new();
        for endpoint in parse_endpoints(instance, &endpoints)? {
            let factory =
                IncomingConnectionFactory::new(instance.clone(), endpoint, self.me.clone(), monitor.clone()).await?;
            factories.push(factory);
        }

        let published = match properties.get_property(&format!("{}.PublishedEndpoints", self.name)) {
            s if s.is_empty() => factories.iter().map(|f| f.endpoint().clone()).collect(),
            s => parse_endpoints(instance, &s)?,
        };

        let mut state = self.state.lock();
        if state.activation == ActivationState::Deactivated {
            drop(state);
            for factory in &factories {
                factory.destroy();
            }
            return Err(IceError::ObjectAdapterDeactivated(self.name.clone()));
        }
        state.factories = factories;
        state.published = published;
        Ok(())
    }

    fn instance(&self) -> Result<Arc<Instance>> {
        self.instance.upgrade().ok_or(IceError::CommunicatorDestroyed)
    }

    fn check_deactivated(&self) -> Result<()> {
        if self.state.lock().activation == ActivationState::Deactivated {
            return Err(IceError::ObjectAdapterDeactivated(self.name.clone()));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    /// Starts accepting connections and dispatching requests.
    #[tracing::instrument(skip(self), fields(adapter = %self.name))]
    pub async fn activate(&self) -> Result<()> {
        let factories = {
            let mut state = self.state.lock();
            match state.activation {
                ActivationState::Deactivated => {
                    return Err(IceError::ObjectAdapterDeactivated(self.name.clone()))
                }
                ActivationState::Active => return Ok(()),
                ActivationState::Inactive => state.activation = ActivationState::Active,
            }
            state.factories.clone()
        };
        for factory in &factories {
            factory.activate().await?;
        }
        tracing::debug!(endpoints = factories.len(), "object adapter activated");
        Ok(())
    }

    /// Stops listening and closes the adapter's connections gracefully.
    /// Requests in progress complete. Deactivating twice is harmless.
    pub fn deactivate(&self) {
        let (factories, router) = {
            let mut state = self.state.lock();
            if state.activation == ActivationState::Deactivated {
                return;
            }
            state.activation = ActivationState::Deactivated;
            (state.factories.clone(), state.router.take())
        };
        for factory in &factories {
            factory.destroy();
        }
        if let Some(router) = router {
            router.set_adapter(None);
        }
        self.monitor.destroy();
        if let Some(instance) = self.instance.upgrade() {
            instance.remove_adapter(self);
        }
        tracing::debug!(adapter = %self.name, "object adapter deactivated");
    }

    pub fn is_deactivated(&self) -> bool {
        self.state.lock().activation == ActivationState::Deactivated
    }

    /// Waits until every connection of a deactivated adapter has closed.
    pub async fn wait_for_deactivate(&self) {
        let factories = self.state.lock().factories.clone();
        for factory in factories {
            factory.wait_until_finished().await;
        }
    }

    /// Deactivates the adapter, waits for its connections and drops its
    /// servants.
    pub async fn destroy(&self) {
        self.deactivate();
        self.wait_for_deactivate().await;
        self.servants.clear();
        self.state.lock().factories.clear();
    }

    /// Closes the connections accepted by this adapter.
    pub async fn close_connections(&self, mode: CloseMode) {
        let factories = self.state.lock().factories.clone();
        for factory in factories {
            factory.close_connections(mode).await;
        }
    }

    /// Returns the endpoints the adapter listens on, with the bound ports.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state
            .lock()
            .factories
            .iter()
            .map(|f| f.endpoint().clone())
            .collect()
    }

    /// Returns the endpoints put into proxies created by this adapter.
    pub fn published_endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().published.clone()
    }

    pub fn set_published_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<()> {
        let mut state = self.state.lock();
        if state.router.is_some() {
            return Err(IceError::FeatureNotSupported(
                "published endpoints of a router adapter".to_string(),
            ));
        }
        state.published = endpoints;
        Ok(())
    }

    /// Wraps the current dispatch chain in `layer`.
    pub fn use_middleware<F>(&self, layer: F)
    where
        F: FnOnce(Arc<dyn Dispatcher>) -> Arc<dyn Dispatcher>,
    {
        let mut dispatcher = self.dispatcher.write();
        *dispatcher = layer(dispatcher.clone());
    }

    // Servants

    /// Registers `servant` for `identity` and returns a proxy for it.
    pub fn add(&self, servant: Arc<dyn Servant>, identity: Identity) -> Result<ObjectPrx> {
        self.add_facet(servant, identity, "")
    }

    /// Registers `servant` under a fresh identity whose name is a UUID.
    pub fn add_with_uuid(&self, servant: Arc<dyn Servant>) -> Result<ObjectPrx> {
        self.add(servant, Identity::new(uuid::Uuid::new_v4().to_string(), ""))
    }

    pub fn add_facet(&self, servant: Arc<dyn Servant>, identity: Identity, facet: &str) -> Result<ObjectPrx> {
        self.check_deactivated()?;
        self.servants.add(servant, &identity, facet)?;
        Ok(self.create_proxy(identity)?.ice_facet(facet))
    }

    /// Registers a servant for every identity of `category` without a
    /// servant of its own. The empty category matches any identity.
    pub fn add_default_servant(&self, servant: Arc<dyn Servant>, category: &str) -> Result<()> {
        self.check_deactivated()?;
        self.servants.add_default(servant, category)
    }

    pub fn remove(&self, identity: &Identity) -> Result<Arc<dyn Servant>> {
        self.servants.remove(identity, "")
    }

    pub fn remove_facet(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Servant>> {
        self.servants.remove(identity, facet)
    }

    pub fn remove_default_servant(&self, category: &str) -> Result<Arc<dyn Servant>> {
        self.servants.remove_default(category)
    }

    pub fn find(&self, identity: &Identity) -> Option<Arc<dyn Servant>> {
        self.servants.find(identity, "")
    }

    pub fn find_facet(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.servants.find(identity, facet)
    }

    // Proxies

    /// Creates a proxy for `identity`: indirect when the adapter has an
    /// adapter id, direct otherwise.
    pub fn create_proxy(&self, identity: Identity) -> Result<ObjectPrx> {
        if self.adapter_id.is_empty() {
            self.create_direct_proxy(identity)
        } else {
            self.create_indirect_proxy(identity)
        }
    }

    pub fn create_direct_proxy(&self, identity: Identity) -> Result<ObjectPrx> {
        let instance = self.instance()?;
        let reference = instance.reference_factory().create_with_endpoints(
            identity,
            self.published_endpoints(),
            "",
        )?;
        Ok(ObjectPrx::new(reference))
    }

    pub fn create_indirect_proxy(&self, identity: Identity) -> Result<ObjectPrx> {
        let instance = self.instance()?;
        let reference = instance.reference_factory().create_with_endpoints(
            identity,
            Vec::new(),
            self.adapter_id.clone(),
        )?;
        Ok(ObjectPrx::new(reference))
    }

    /// Returns true if `reference` designates an object of this adapter.
    pub fn is_local(&self, reference: &Reference) -> bool {
        if let Some(connection) = reference.fixed_connection() {
            return connection
                .adapter()
                .is_some_and(|adapter| std::ptr::eq(Arc::as_ptr(&adapter), self));
        }

        let state = self.state.lock();
        if state.activation == ActivationState::Deactivated {
            return false;
        }
        if !reference.adapter_id().is_empty() {
            return !self.adapter_id.is_empty() && reference.adapter_id() == self.adapter_id;
        }
        reference.endpoints().iter().any(|endpoint| {
            state.published.iter().any(|p| p.equivalent(endpoint))
                || state.factories.iter().any(|f| f.endpoint().equivalent(endpoint))
        })
    }

    // Dispatch

    /// Runs `request` through the dispatch chain.
    pub async fn dispatch(&self, request: IncomingRequest, connection: Option<Arc<Connection>>) -> OutgoingResponse {
        if self.is_deactivated() {
            let error = IceError::ObjectNotExist {
                id: request.identity.clone(),
                facet: request.facet.clone(),
                operation: request.operation.clone(),
            };
            return OutgoingResponse::from_error(&request, error);
        }
        let dispatcher = self.dispatcher.read().clone();
        let current = Current {
            adapter: self.name.clone(),
            connection,
            request,
        };
        dispatcher.dispatch(&current).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::Communicator;
    use async_trait::async_trait;
    use bytes::Bytes;
    use ice_core::protocol::{OperationMode, ReplyStatus, ENCODING_1_1};
    use ice_core::Context;

    #[derive(Debug)]
    struct Hello;

    #[async_trait]
    impl Servant for Hello {
        async fn dispatch(&self, current: &Current) -> Result<Bytes> {
            match current.request.operation.as_str() {
                "hello" => Ok(Bytes::new()),
                _ => Err(current.operation_not_exist()),
            }
        }
    }

    fn request(name: &str, operation: &str) -> IncomingRequest {
        IncomingRequest {
            request_id: 1,
            identity: Identity::new(name, ""),
            facet: String::new(),
            operation: operation.to_string(),
            mode: OperationMode::Normal,
            context: Context::new(),
            encoding: ENCODING_1_1,
            params: Bytes::new(),
            size: 0,
        }
    }

    #[tokio::test]
    async fn test_add_and_dispatch() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let adapter = communicator
            .create_object_adapter_with_endpoints("Hello", "tcp -h 127.0.0.1 -p 0")
            .await
            .unwrap();
        let prx = adapter.add(Arc::new(Hello), Identity::new("hello", "")).unwrap();
        assert_eq!(prx.ice_get_endpoints().len(), 1);
        assert!(adapter.is_local(prx.reference()));

        let response = adapter.dispatch(request("hello", "hello"), None).await;
        assert_eq!(response.status(), ReplyStatus::Ok);
        let response = adapter.dispatch(request("other", "hello"), None).await;
        assert_eq!(response.status(), ReplyStatus::ObjectNotExist);

        adapter.destroy().await;
        let response = adapter.dispatch(request("hello", "hello"), None).await;
        assert_eq!(response.status(), ReplyStatus::ObjectNotExist);
        assert!(!adapter.is_local(prx.reference()));
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_duplicate_adapter_name() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let _a = communicator.create_object_adapter_with_endpoints("A", "tcp -h 127.0.0.1 -p 0").await.unwrap();
        assert!(matches!(
            communicator.create_object_adapter_with_endpoints("A", "tcp -h 127.0.0.1 -p 0").await,
            Err(IceError::AlreadyRegistered { .. })
        ));
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_indirect_proxies_with_adapter_id() {
        let communicator = Communicator::new(Default::default()).unwrap();
        communicator.properties().set_property("Ind.AdapterId", "ind-1");
        let adapter = communicator.create_object_adapter("Ind").await.unwrap();
        let prx = adapter.add(Arc::new(Hello), Identity::new("x", "")).unwrap();
        assert_eq!(prx.ice_get_adapter_id(), "ind-1");
        assert!(prx.ice_get_endpoints().is_empty());
        assert!(adapter.is_local(prx.reference()));
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_add_with_uuid() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let adapter = communicator.create_object_adapter("Uuid").await.unwrap();
        let a = adapter.add_with_uuid(Arc::new(Hello)).unwrap();
        let b = adapter.add_with_uuid(Arc::new(Hello)).unwrap();
        assert_ne!(a.ice_get_identity(), b.ice_get_identity());
        assert_eq!(a.ice_get_identity().name.len(), 36);
        assert!(adapter.find(a.ice_get_identity()).is_some());
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_middleware_wraps_chain() {
        #[derive(Debug)]
        struct Deny(Arc<dyn Dispatcher>);

        #[async_trait]
        impl Dispatcher for Deny {
            async fn dispatch(&self, current: &Current) -> OutgoingResponse {
                if current.request.operation == "secret" {
                    return OutgoingResponse::from_error(&current.request, current.operation_not_exist());
                }
                self.0.dispatch(current).await
            }
        }

        let communicator = Communicator::new(Default::default()).unwrap();
        let adapter = communicator.create_object_adapter("Mw").await.unwrap();
        adapter.add(Arc::new(Hello), Identity::new("hello", "")).unwrap();
        adapter.use_middleware(|next| Arc::new(Deny(next)));
        let response = adapter.dispatch(request("hello", "secret"), None).await;
        assert_eq!(response.status(), ReplyStatus::OperationNotExist);
        let response = adapter.dispatch(request("hello", "hello"), None).await;
        assert_eq!(response.status(), ReplyStatus::Ok);
        communicator.destroy().await;
    }
}
