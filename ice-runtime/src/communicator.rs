//! Communicator entry point.

use std::sync::Arc;

use ice_core::{InputStream, Result};
use tokio::sync::broadcast;

use crate::adapter::ObjectAdapter;
use crate::config::RuntimeConfig;
use crate::connection::ConnectionEvent;
use crate::instance::{InitializationData, Instance};
use crate::properties::Properties;
use crate::proxy::ObjectPrx;

/// The root object of the runtime.
///
/// A communicator owns the connection factories, the locator and router
/// caches and the object adapters. Cloning yields another handle to the
/// same communicator.
///
/// # Example
///
/// ```rust,no_run
/// use ice_runtime::{Communicator, RuntimeConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let communicator = Communicator::new(RuntimeConfig::default())?;
///     let hello = communicator
///         .string_to_proxy("hello:tcp -h 127.0.0.1 -p 10000")?
///         .ok_or("null proxy")?;
///     hello.ice_ping().await?;
///     communicator.destroy().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Communicator {
    instance: Arc<Instance>,
}

impl Communicator {
    /// Creates a communicator with the given settings. Does not require a
    /// running Tokio runtime; background work starts on first use.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::initialize(InitializationData::from(config))
    }

    /// Creates a communicator configured from `Ice.*` properties.
    pub fn with_properties(properties: Properties) -> Result<Self> {
        Self::initialize(InitializationData {
            config: RuntimeConfig::from_properties(&properties),
            properties,
            ..InitializationData::default()
        })
    }

    pub fn initialize(data: InitializationData) -> Result<Self> {
        let instance = Instance::new(data)?;
        tracing::debug!(protocol = instance.config().default_protocol(), "communicator initialized");
        Ok(Self { instance })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.instance.config()
    }

    pub fn properties(&self) -> &Properties {
        self.instance.properties()
    }

    // Proxies

    /// Parses a stringified proxy. Returns `None` for a null proxy.
    pub fn string_to_proxy(&self, s: &str) -> Result<Option<ObjectPrx>> {
        self.instance.check_destroyed()?;
        Ok(self
            .instance
            .reference_factory()
            .create_from_string(s, None)?
            .map(ObjectPrx::new))
    }

    pub fn proxy_to_string(&self, proxy: Option<&ObjectPrx>) -> String {
        proxy.map(ToString::to_string).unwrap_or_default()
    }

    /// Creates the proxy named by property `prefix`, applying the
    /// `prefix.*` settings such as `prefix.Locator` or
    /// `prefix.InvocationTimeout`.
    pub fn property_to_proxy(&self, prefix: &str) -> Result<Option<ObjectPrx>> {
        self.instance.check_destroyed()?;
        let s = self.properties().get_property(prefix);
        Ok(self
            .instance
            .reference_factory()
            .create_from_string(&s, Some(prefix))?
            .map(ObjectPrx::new))
    }

    /// Reads a marshaled proxy.
    pub fn read_proxy(&self, is: &mut InputStream) -> Result<Option<ObjectPrx>> {
        ObjectPrx::read(&self.instance, is)
    }

    pub fn set_default_locator(&self, locator: Option<ObjectPrx>) {
        self.instance.reference_factory().set_default_locator(locator);
    }

    pub fn default_locator(&self) -> Option<ObjectPrx> {
        self.instance.reference_factory().default_locator()
    }

    pub fn set_default_router(&self, router: Option<ObjectPrx>) {
        self.instance.reference_factory().set_default_router(router);
    }

    pub fn default_router(&self) -> Option<ObjectPrx> {
        self.instance.reference_factory().default_router()
    }

    // Adapters

    /// Creates an adapter listening on the endpoints of property
    /// `name.Endpoints`.
    pub async fn create_object_adapter(&self, name: &str) -> Result<Arc<ObjectAdapter>> {
        ObjectAdapter::create(&self.instance, name, None, None).await
    }

    pub async fn create_object_adapter_with_endpoints(
        &self,
        name: &str,
        endpoints: &str,
    ) -> Result<Arc<ObjectAdapter>> {
        ObjectAdapter::create(&self.instance, name, Some(endpoints), None).await
    }

    /// Creates an adapter reachable through `router`. Requests arrive over
    /// the connection to the router.
    pub async fn create_object_adapter_with_router(
        &self,
        name: &str,
        router: &ObjectPrx,
    ) -> Result<Arc<ObjectAdapter>> {
        ObjectAdapter::create(&self.instance, name, None, Some(router)).await
    }

    // Connections

    /// Sends the batch requests queued on every outgoing connection.
    pub async fn flush_batch_requests(&self) -> Result<()> {
        self.instance.outgoing_connection_factory().flush_batch_requests().await
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.instance.subscribe_connection_events()
    }

    // Lifecycle

    /// Deactivates every object adapter. Outgoing invocations keep working.
    pub fn shutdown(&self) {
        for adapter in self.instance.adapters() {
            adapter.deactivate();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.instance.is_destroyed()
    }

    /// Destroys the communicator and waits for its connections to close.
    /// Later calls on proxies fail with `CommunicatorDestroyed`.
    pub async fn destroy(&self) {
        let adapters = self.instance.destroy();
        for adapter in adapters {
            adapter.destroy().await;
        }
        self.instance.outgoing_connection_factory().wait_until_finished().await;
        self.instance.finish_destroy();
        tracing::debug!("communicator destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ice_core::IceError;

    #[test]
    fn test_new_outside_runtime() {
        let communicator = Communicator::new(RuntimeConfig::default()).unwrap();
        assert!(!communicator.is_destroyed());
        let prx = communicator
            .string_to_proxy("hello:tcp -h 127.0.0.1 -p 4061")
            .unwrap()
            .unwrap();
        assert_eq!(communicator.proxy_to_string(Some(&prx)), prx.to_string());
        assert!(communicator.string_to_proxy("").unwrap().is_none());
    }

    #[test]
    fn test_property_to_proxy() {
        let properties = Properties::new();
        properties.set_property("Hello.Proxy", "hello:tcp -h 127.0.0.1 -p 4061");
        properties.set_property("Hello.Proxy.InvocationTimeout", "1500");
        let communicator = Communicator::with_properties(properties).unwrap();
        let prx = communicator.property_to_proxy("Hello.Proxy").unwrap().unwrap();
        assert_eq!(
            prx.ice_get_invocation_timeout(),
            Some(std::time::Duration::from_millis(1500))
        );
        assert!(communicator.property_to_proxy("Missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroyed_communicator_rejects_work() {
        let communicator = Communicator::new(RuntimeConfig::default()).unwrap();
        let prx = communicator
            .string_to_proxy("hello:tcp -h 127.0.0.1 -p 4061")
            .unwrap()
            .unwrap();
        communicator.destroy().await;
        assert!(communicator.is_destroyed());
        assert!(matches!(
            communicator.string_to_proxy("a:tcp -p 1"),
            Err(IceError::CommunicatorDestroyed)
        ));
        assert!(matches!(prx.ice_ping().await, Err(IceError::CommunicatorDestroyed)));
        assert!(matches!(
            communicator.create_object_adapter("A").await,
            Err(IceError::CommunicatorDestroyed)
        ));
    }
}
