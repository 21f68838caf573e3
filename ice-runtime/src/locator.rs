//! Locator indirection and its endpoint cache.
//!
//! Indirect references name an object adapter (`object @ adapter`) or only
//! an identity (well-known objects). A [`LocatorInfo`] resolves them to
//! endpoints through a [`Locator`] and caches the answers in a
//! [`LocatorTable`] with a time-to-live in seconds.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ice_core::protocol::{EncodingVersion, OperationMode};
use ice_core::{IceError, Identity, OutputStream, Result};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::endpoint::Endpoint;
use crate::proxy::ObjectPrx;
use crate::reference::Reference;
use crate::runtime::RuntimeExt;

const OBJECT_NOT_FOUND: &str = "::Ice::ObjectNotFoundException";
const ADAPTER_NOT_FOUND: &str = "::Ice::AdapterNotFoundException";

/// Source of the current time for cache expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// The monotonic system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Used to test expiry.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// The lookup service behind indirect references.
#[async_trait]
pub trait Locator: Send + Sync + fmt::Debug {
    /// Returns a proxy for the object with `id`.
    async fn find_object_by_id(&self, id: &Identity) -> Result<Option<ObjectPrx>>;

    /// Returns a proxy carrying the endpoints of the adapter with `id`.
    async fn find_adapter_by_id(&self, id: &str) -> Result<Option<ObjectPrx>>;
}

/// A [`Locator`] reached through a proxy.
#[derive(Debug, Clone)]
pub struct LocatorPrx {
    proxy: ObjectPrx,
}

impl LocatorPrx {
    pub fn new(proxy: ObjectPrx) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &ObjectPrx {
        &self.proxy
    }

    async fn find(&self, operation: &str, params: &[u8], not_found: &'static str, kind: &str, id: String) -> Result<Option<ObjectPrx>> {
        let result = self
            .proxy
            .invoke_with_exceptions(operation, OperationMode::Idempotent, params, None, &[not_found], true)
            .await;
        match result {
            Ok(reply) => ObjectPrx::read(self.proxy.reference().instance(), &mut reply.input()),
            Err(IceError::UserException { type_id, .. }) if type_id == not_found => {
                Err(IceError::NotRegistered {
                    kind: kind.to_string(),
                    id,
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Locator for LocatorPrx {
    async fn find_object_by_id(&self, id: &Identity) -> Result<Option<ObjectPrx>> {
        let mut os = OutputStream::with_encoding(self.proxy.ice_get_encoding_version());
        os.write(id);
        self.find("findObjectById", os.as_bytes(), OBJECT_NOT_FOUND, "object", id.to_string())
            .await
    }

    async fn find_adapter_by_id(&self, id: &str) -> Result<Option<ObjectPrx>> {
        let mut os = OutputStream::with_encoding(self.proxy.ice_get_encoding_version());
        os.write_string(id);
        self.find("findAdapterById", os.as_bytes(), ADAPTER_NOT_FOUND, "object adapter", id.to_string())
            .await
    }
}

fn is_fresh(now: Instant, stored: Instant, ttl: i32) -> bool {
    match u64::try_from(ttl) {
        Ok(secs) => now.saturating_duration_since(stored) <= Duration::from_secs(secs),
        Err(_) => true,
    }
}

/// Cached locator answers.
///
/// Lookups take a TTL in seconds: `0` disables the cache, a negative value
/// never expires. Stale entries are still returned, flagged as not cached, so
/// callers can use them while a refresh is running.
#[derive(Debug)]
pub struct LocatorTable {
    clock: Arc<dyn Clock>,
    adapter_endpoints: Mutex<HashMap<String, (Instant, Vec<Endpoint>)>>,
    object_references: Mutex<HashMap<Identity, (Instant, Reference)>>,
}

impl LocatorTable {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            adapter_endpoints: Mutex::new(HashMap::new()),
            object_references: Mutex::new(HashMap::new()),
        }
    }

    pub fn clear(&self) {
        self.adapter_endpoints.lock().clear();
        self.object_references.lock().clear();
    }

    /// Returns the endpoints of `adapter_id` and whether they are still
    /// within `ttl`.
    pub fn get_adapter_endpoints(&self, adapter_id: &str, ttl: i32) -> Option<(Vec<Endpoint>, bool)> {
        if ttl == 0 {
            return None;
        }
        let table = self.adapter_endpoints.lock();
        let (stored, endpoints) = table.get(adapter_id)?;
        Some((endpoints.clone(), is_fresh(self.clock.now(), *stored, ttl)))
    }

    pub fn add_adapter_endpoints(&self, adapter_id: &str, endpoints: Vec<Endpoint>) {
        self.adapter_endpoints
            .lock()
            .insert(adapter_id.to_string(), (self.clock.now(), endpoints));
    }

    pub fn remove_adapter_endpoints(&self, adapter_id: &str) -> Option<Vec<Endpoint>> {
        self.adapter_endpoints.lock().remove(adapter_id).map(|(_, eps)| eps)
    }

    /// Returns the reference registered for `id` and whether it is still
    /// within `ttl`.
    pub fn get_object_reference(&self, id: &Identity, ttl: i32) -> Option<(Reference, bool)> {
        if ttl == 0 {
            return None;
        }
        let table = self.object_references.lock();
        let (stored, reference) = table.get(id)?;
        Some((reference.clone(), is_fresh(self.clock.now(), *stored, ttl)))
    }

    pub fn add_object_reference(&self, id: &Identity, reference: Reference) {
        self.object_references
            .lock()
            .insert(id.clone(), (self.clock.now(), reference));
    }

    pub fn remove_object_reference(&self, id: &Identity) -> Option<Reference> {
        self.object_references.lock().remove(id).map(|(_, r)| r)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LookupKey {
    Object(Identity),
    Adapter(String),
}

type Lookup = Arc<OnceCell<Result<Option<ObjectPrx>>>>;

/// Resolves indirect references through one locator.
pub struct LocatorInfo {
    locator: Arc<dyn Locator>,
    proxy: Option<ObjectPrx>,
    table: Arc<LocatorTable>,
    background_updates: bool,
    pending: Mutex<HashMap<LookupKey, Lookup>>,
    me: Weak<LocatorInfo>,
}

impl fmt::Debug for LocatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocatorInfo")
            .field("locator", &self.locator)
            .field("background_updates", &self.background_updates)
            .finish()
    }
}

impl LocatorInfo {
    /// Creates an info over any [`Locator`] implementation.
    pub fn new(locator: Arc<dyn Locator>, table: Arc<LocatorTable>, background_updates: bool) -> Arc<Self> {
        Self::build(locator, None, table, background_updates)
    }

    fn build(
        locator: Arc<dyn Locator>,
        proxy: Option<ObjectPrx>,
        table: Arc<LocatorTable>,
        background_updates: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            locator,
            proxy,
            table,
            background_updates,
            pending: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn locator(&self) -> &Arc<dyn Locator> {
        &self.locator
    }

    /// Returns the locator proxy, if the locator is remote.
    pub fn proxy(&self) -> Option<&ObjectPrx> {
        self.proxy.as_ref()
    }

    pub fn table(&self) -> &Arc<LocatorTable> {
        &self.table
    }

    /// Resolves the endpoints of an indirect reference.
    ///
    /// Returns the endpoints and whether they came from the cache.
    pub async fn get_endpoints(&self, reference: &Reference, ttl: i32) -> Result<(Vec<Endpoint>, bool)> {
        if reference.is_well_known() {
            self.get_object_endpoints(reference, ttl).await
        } else {
            self.get_adapter_endpoints(reference, reference.adapter_id(), ttl).await
        }
    }

    async fn get_adapter_endpoints(&self, reference: &Reference, adapter_id: &str, ttl: i32) -> Result<(Vec<Endpoint>, bool)> {
        let key = LookupKey::Adapter(adapter_id.to_string());
        if let Some((endpoints, fresh)) = self.table.get_adapter_endpoints(adapter_id, ttl) {
            if fresh || self.background_updates {
                if !fresh {
                    self.refresh_in_background(reference, key);
                }
                self.trace_cached(reference, &endpoints);
                return Ok((endpoints, true));
            }
        }

        match self.lookup(key).await {
            Ok(Some(proxy)) => {
                let endpoints = proxy.ice_get_endpoints().to_vec();
                if !endpoints.is_empty() {
                    self.table.add_adapter_endpoints(adapter_id, endpoints.clone());
                }
                self.trace_resolved(reference, &endpoints);
                Ok((endpoints, false))
            }
            Ok(None) => Ok((Vec::new(), false)),
            Err(err) => Err(self.lookup_failed(reference, err)),
        }
    }

    async fn get_object_endpoints(&self, reference: &Reference, ttl: i32) -> Result<(Vec<Endpoint>, bool)> {
        let id = reference.identity();
        let key = LookupKey::Object(id.clone());
        let (object, cached) = match self.table.get_object_reference(id, ttl) {
            Some((object, fresh)) if fresh || self.background_updates => {
                if !fresh {
                    self.refresh_in_background(reference, key);
                }
                (object, true)
            }
            _ => match self.lookup(key).await {
                Ok(Some(proxy)) => {
                    let object = proxy.reference().clone();
                    if !object.is_well_known() {
                        self.table.add_object_reference(id, object.clone());
                    }
                    (object, false)
                }
                Ok(None) => return Ok((Vec::new(), false)),
                Err(err) => return Err(self.lookup_failed(reference, err)),
            },
        };

        if object.is_well_known() {
            return Ok((Vec::new(), false));
        }
        if object.is_indirect() {
            let (endpoints, adapter_cached) = self
                .get_adapter_endpoints(&object, object.adapter_id(), ttl)
                .await?;
            return Ok((endpoints, cached && adapter_cached));
        }
        let endpoints = object.endpoints().to_vec();
        if cached {
            self.trace_cached(reference, &endpoints);
        } else {
            self.trace_resolved(reference, &endpoints);
        }
        Ok((endpoints, cached))
    }

    /// Runs one locator request per key; concurrent callers share it.
    async fn lookup(&self, key: LookupKey) -> Result<Option<ObjectPrx>> {
        let cell = self
            .pending
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let result = cell
            .get_or_init(|| async {
                match &key {
                    LookupKey::Object(id) => self.locator.find_object_by_id(id).await,
                    LookupKey::Adapter(id) => self.locator.find_adapter_by_id(id).await,
                }
            })
            .await
            .clone();

        let mut pending = self.pending.lock();
        if pending.get(&key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            pending.remove(&key);
        }
        result
    }

    fn refresh_in_background(&self, reference: &Reference, key: LookupKey) {
        let Some(me) = self.me.upgrade() else { return };
        if self.pending.lock().contains_key(&key) {
            return;
        }
        let runtime = reference.instance().runtime().clone();
        runtime.spawn(async move {
            let result = me.lookup(key.clone()).await;
            match (key, result) {
                (LookupKey::Adapter(id), Ok(Some(proxy))) => {
                    let endpoints = proxy.ice_get_endpoints().to_vec();
                    if !endpoints.is_empty() {
                        me.table.add_adapter_endpoints(&id, endpoints);
                    }
                }
                (LookupKey::Object(id), Ok(Some(proxy))) => {
                    if !proxy.reference().is_well_known() {
                        me.table.add_object_reference(&id, proxy.reference().clone());
                    }
                }
                (_, Ok(None)) => {}
                (key, Err(err)) => {
                    tracing::debug!(target: "ice::locator", ?key, error = %err, "background locator refresh failed");
                }
            }
        });
    }

    /// Drops the cached answers used to resolve `reference`.
    pub fn clear_cache(&self, reference: &Reference) {
        let trace = reference.instance().config().trace().locator > 1;
        if reference.is_well_known() {
            if let Some(object) = self.table.remove_object_reference(reference.identity()) {
                if trace {
                    tracing::debug!(target: "ice::locator", object = %reference.identity(), "removed well-known object from locator cache");
                }
                if object.is_indirect() {
                    self.table.remove_adapter_endpoints(object.adapter_id());
                }
            }
        } else if self.table.remove_adapter_endpoints(reference.adapter_id()).is_some() && trace {
            tracing::debug!(target: "ice::locator", adapter = reference.adapter_id(), "removed adapter endpoints from locator cache");
        }
    }

    fn lookup_failed(&self, reference: &Reference, err: IceError) -> IceError {
        if reference.instance().config().trace().locator > 0 {
            tracing::debug!(target: "ice::locator", reference = %reference, error = %err, "locator lookup failed");
        }
        err
    }

    fn trace_cached(&self, reference: &Reference, endpoints: &[Endpoint]) {
        if reference.instance().config().trace().locator > 1 {
            tracing::debug!(target: "ice::locator", reference = %reference, endpoints = %join(endpoints), "found endpoints in locator cache");
        }
    }

    fn trace_resolved(&self, reference: &Reference, endpoints: &[Endpoint]) {
        if reference.instance().config().trace().locator > 0 {
            tracing::debug!(target: "ice::locator", reference = %reference, endpoints = %join(endpoints), "retrieved endpoints from locator");
        }
    }
}

fn join(endpoints: &[Endpoint]) -> String {
    endpoints.iter().map(ToString::to_string).collect::<Vec<_>>().join(":")
}

/// Shares one [`LocatorInfo`] per locator proxy and one table per locator
/// identity and encoding.
#[derive(Debug)]
pub struct LocatorManager {
    clock: Arc<dyn Clock>,
    background_updates: bool,
    infos: Mutex<HashMap<Reference, Arc<LocatorInfo>>>,
    tables: Mutex<HashMap<(Identity, EncodingVersion), Arc<LocatorTable>>>,
}

impl LocatorManager {
    pub fn new(clock: Arc<dyn Clock>, background_updates: bool) -> Self {
        Self {
            clock,
            background_updates,
            infos: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the info for `locator`, creating it on first use.
    pub fn get(&self, locator: &ObjectPrx) -> Arc<LocatorInfo> {
        // The locator itself is never resolved through a locator.
        let locator = locator.ice_locator(None).unwrap_or_else(|_| locator.clone());
        let mut infos = self.infos.lock();
        if let Some(info) = infos.get(locator.reference()) {
            return info.clone();
        }
        let table = self
            .tables
            .lock()
            .entry((locator.ice_get_identity().clone(), locator.ice_get_encoding_version()))
            .or_insert_with(|| Arc::new(LocatorTable::new(self.clock.clone())))
            .clone();
        let info = LocatorInfo::build(
            Arc::new(LocatorPrx::new(locator.clone())),
            Some(locator.clone()),
            table,
            self.background_updates,
        );
        infos.insert(locator.reference().clone(), info.clone());
        info
    }

    pub fn destroy(&self) {
        for table in self.tables.lock().values() {
            table.clear();
        }
        self.infos.lock().clear();
        self.tables.lock().clear();
    }
}
