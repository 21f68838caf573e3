//! Shared state of one communicator.
//!
//! Every reference, connection and adapter holds the [`Instance`] it was
//! created by. Factories and registries hold it weakly so that dropping the
//! last [`Communicator`](crate::communicator::Communicator) handle tears the
//! graph down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ice_core::{IceError, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::acm::FactoryAcmMonitor;
use crate::adapter::ObjectAdapter;
use crate::batch::BatchRequestInterceptor;
use crate::config::RuntimeConfig;
use crate::connection::{ConnectionEvent, OutgoingConnectionFactory};
use crate::endpoint::{EndpointDefaults, EndpointFactoryManager, EndpointHostResolver};
use crate::handler::RequestHandlerFactory;
use crate::locator::{Clock, LocatorManager, SystemClock};
use crate::observer::{CommunicatorObserver, NoopObserver};
use crate::properties::Properties;
use crate::reference::{Reference, ReferenceFactory};
use crate::router::RouterManager;
use crate::runtime::{Runtime, TokioRuntime};
use crate::timer::Timer;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything needed to set up a communicator.
#[derive(Clone)]
pub struct InitializationData {
    /// Runtime settings.
    pub config: RuntimeConfig,
    /// Properties consulted for per-proxy and per-adapter settings.
    pub properties: Properties,
    /// Receives instrumentation events.
    pub observer: Option<Arc<dyn CommunicatorObserver>>,
    /// Decides when queued batch requests are flushed.
    pub batch_interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    /// Executor for background work. Tokio when absent.
    pub runtime: Option<Arc<dyn Runtime>>,
    /// Clock used by the locator cache.
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for InitializationData {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            properties: Properties::new(),
            observer: None,
            batch_interceptor: None,
            runtime: None,
            clock: None,
        }
    }
}

impl std::fmt::Debug for InitializationData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationData")
            .field("config", &self.config)
            .field("observer", &self.observer.is_some())
            .field("batch_interceptor", &self.batch_interceptor.is_some())
            .finish_non_exhaustive()
    }
}

impl From<RuntimeConfig> for InitializationData {
    fn from(config: RuntimeConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }
}

/// The per-communicator registry of factories, caches and settings.
pub struct Instance {
    config: RuntimeConfig,
    properties: Properties,
    runtime: Arc<dyn Runtime>,
    timer: Timer,
    resolver: EndpointHostResolver,
    observer: Arc<dyn CommunicatorObserver>,
    batch_interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    events: broadcast::Sender<ConnectionEvent>,
    endpoint_factories: EndpointFactoryManager,
    reference_factory: ReferenceFactory,
    request_handler_factory: RequestHandlerFactory,
    outgoing_monitor: Arc<FactoryAcmMonitor>,
    outgoing_connection_factory: OutgoingConnectionFactory,
    locator_manager: LocatorManager,
    router_manager: RouterManager,
    adapters: Mutex<Vec<Arc<ObjectAdapter>>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("adapters", &self.adapters.lock().len())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) fn new(data: InitializationData) -> Result<Arc<Self>> {
        let InitializationData {
            config,
            properties,
            observer,
            batch_interceptor,
            runtime,
            clock,
        } = data;

        let runtime = runtime.unwrap_or_else(TokioRuntime::shared);
        let timer = Timer::new(runtime.clone());
        let resolver = EndpointHostResolver::new()?;
        let observer = observer.unwrap_or_else(|| Arc::new(NoopObserver));
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let endpoint_factories = EndpointFactoryManager::with_builtin(
            config.default_protocol(),
            EndpointDefaults {
                host: config.default_host().map(str::to_string),
                timeout: config.default_timeout(),
            },
        );
        let outgoing_monitor = FactoryAcmMonitor::new(timer.clone(), config.client_acm().clone());
        let locator_manager = LocatorManager::new(clock, config.background_locator_cache_updates());

        Ok(Arc::new_cyclic(|me| Self {
            reference_factory: ReferenceFactory::new(me.clone()),
            request_handler_factory: RequestHandlerFactory::new(me.clone()),
            outgoing_connection_factory: OutgoingConnectionFactory::new(me.clone(), outgoing_monitor.clone()),
            outgoing_monitor,
            config,
            properties,
            runtime,
            timer,
            resolver,
            observer,
            batch_interceptor,
            events,
            endpoint_factories,
            locator_manager,
            router_manager: RouterManager::new(),
            adapters: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn resolver(&self) -> &EndpointHostResolver {
        &self.resolver
    }

    pub fn observer(&self) -> &Arc<dyn CommunicatorObserver> {
        &self.observer
    }

    pub fn batch_interceptor(&self) -> Option<Arc<dyn BatchRequestInterceptor>> {
        self.batch_interceptor.clone()
    }

    pub fn endpoint_factories(&self) -> &EndpointFactoryManager {
        &self.endpoint_factories
    }

    pub fn reference_factory(&self) -> &ReferenceFactory {
        &self.reference_factory
    }

    pub fn request_handler_factory(&self) -> &RequestHandlerFactory {
        &self.request_handler_factory
    }

    pub fn outgoing_connection_factory(&self) -> &OutgoingConnectionFactory {
        &self.outgoing_connection_factory
    }

    pub fn locator_manager(&self) -> &LocatorManager {
        &self.locator_manager
    }

    pub fn router_manager(&self) -> &RouterManager {
        &self.router_manager
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit_connection_event(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn check_destroyed(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(IceError::CommunicatorDestroyed);
        }
        Ok(())
    }

    pub(crate) fn add_adapter(&self, adapter: Arc<ObjectAdapter>) -> Result<()> {
        self.check_destroyed()?;
        let mut adapters = self.adapters.lock();
        if !adapter.name().is_empty() && adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(IceError::AlreadyRegistered {
                kind: "object adapter".to_string(),
                id: adapter.name().to_string(),
            });
        }
        adapters.push(adapter);
        Ok(())
    }

    pub(crate) fn remove_adapter(&self, adapter: &ObjectAdapter) {
        self.adapters
            .lock()
            .retain(|a| !std::ptr::eq(Arc::as_ptr(a), adapter));
    }

    pub fn adapters(&self) -> Vec<Arc<ObjectAdapter>> {
        self.adapters.lock().clone()
    }

    /// Returns the adapter of this communicator that hosts the target of
    /// `reference`, if any.
    pub fn find_adapter(&self, reference: &Reference) -> Option<Arc<ObjectAdapter>> {
        self.adapters
            .lock()
            .iter()
            .find(|adapter| adapter.is_local(reference))
            .cloned()
    }

    /// Marks the instance destroyed and stops every background activity.
    /// Connections are closed gracefully; wait for them with
    /// [`OutgoingConnectionFactory::wait_until_finished`].
    pub(crate) fn destroy(&self) -> Vec<Arc<ObjectAdapter>> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        tracing::debug!("destroying communicator");

        let adapters = std::mem::take(&mut *self.adapters.lock());
        for adapter in &adapters {
            adapter.deactivate();
        }
        self.outgoing_connection_factory.destroy();
        self.locator_manager.destroy();
        self.router_manager.destroy();
        self.outgoing_monitor.destroy();
        adapters
    }

    /// Stops the timer and resolver once every connection has finished
    /// closing. Graceful closes arm their close timeout on the timer.
    pub(crate) fn finish_destroy(&self) {
        self.timer.destroy();
        self.resolver.destroy();
    }
}
