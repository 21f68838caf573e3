//! Servants and the table the adapter looks them up in.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ice_core::{IceError, Identity, OutputStream, Result};
use parking_lot::RwLock;

use super::Current;
use crate::proxy::OBJECT_TYPE_ID;

/// Implements the operations of one object.
#[async_trait]
pub trait Servant: Send + Sync + Debug {
    /// Type ids of the interfaces the object implements, most derived last.
    fn ice_ids(&self) -> Vec<String> {
        vec![OBJECT_TYPE_ID.to_string()]
    }

    /// Runs `current.request` and returns the marshaled results.
    ///
    /// Return [`Current::operation_not_exist`] for unknown operations and
    /// [`IceError::UserException`] for declared exceptions.
    async fn dispatch(&self, current: &Current) -> Result<Bytes>;
}

/// Answers the operations every object supports. Returns `None` for any
/// other operation.
pub(crate) fn dispatch_builtin(servant: &dyn Servant, current: &Current) -> Option<Result<Bytes>> {
    let request = &current.request;
    let mut os = OutputStream::with_encoding(request.encoding);
    match request.operation.as_str() {
        "ice_ping" => {}
        "ice_isA" => {
            let type_id = match request.input().read_string() {
                Ok(type_id) => type_id,
                Err(err) => return Some(Err(err)),
            };
            os.write_bool(servant.ice_ids().iter().any(|id| *id == type_id));
        }
        "ice_id" => {
            let ids = servant.ice_ids();
            os.write_string(ids.last().map(String::as_str).unwrap_or(OBJECT_TYPE_ID));
        }
        "ice_ids" => {
            let mut ids = servant.ice_ids();
            ids.sort();
            os.write_string_seq(&ids);
        }
        _ => return None,
    }
    Some(Ok(Bytes::copy_from_slice(os.as_bytes())))
}

/// Servants keyed by identity and facet, plus default servants keyed by
/// category.
#[derive(Debug, Default)]
pub struct ServantManager {
    servants: RwLock<HashMap<Identity, HashMap<String, Arc<dyn Servant>>>>,
    default_servants: RwLock<HashMap<String, Arc<dyn Servant>>>,
}

impl ServantManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, servant: Arc<dyn Servant>, identity: &Identity, facet: &str) -> Result<()> {
        if identity.is_null() {
            return Err(IceError::IllegalIdentity(identity.to_string()));
        }
        let mut servants = self.servants.write();
        let facets = servants.entry(identity.clone()).or_default();
        if facets.contains_key(facet) {
            return Err(IceError::AlreadyRegistered {
                kind: "servant".to_string(),
                id: registered_id(identity, facet),
            });
        }
        facets.insert(facet.to_string(), servant);
        Ok(())
    }

    pub fn add_default(&self, servant: Arc<dyn Servant>, category: &str) -> Result<()> {
        let mut defaults = self.default_servants.write();
        if defaults.contains_key(category) {
            return Err(IceError::AlreadyRegistered {
                kind: "default servant".to_string(),
                id: category.to_string(),
            });
        }
        defaults.insert(category.to_string(), servant);
        Ok(())
    }

    pub fn remove(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Servant>> {
        let mut servants = self.servants.write();
        let removed = servants.get_mut(identity).and_then(|facets| facets.remove(facet));
        if servants.get(identity).is_some_and(HashMap::is_empty) {
            servants.remove(identity);
        }
        removed.ok_or_else(|| IceError::NotRegistered {
            kind: "servant".to_string(),
            id: registered_id(identity, facet),
        })
    }

    /// Removes every facet of `identity`.
    pub fn remove_all_facets(&self, identity: &Identity) -> Result<HashMap<String, Arc<dyn Servant>>> {
        self.servants
            .write()
            .remove(identity)
            .ok_or_else(|| IceError::NotRegistered {
                kind: "servant".to_string(),
                id: identity.to_string(),
            })
    }

    pub fn remove_default(&self, category: &str) -> Result<Arc<dyn Servant>> {
        self.default_servants
            .write()
            .remove(category)
            .ok_or_else(|| IceError::NotRegistered {
                kind: "default servant".to_string(),
                id: category.to_string(),
            })
    }

    /// Finds the servant for `identity` and `facet`, falling back to the
    /// default servant of the identity's category and then to the default
    /// servant of the empty category.
    pub fn find(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        if let Some(servant) = self
            .servants
            .read()
            .get(identity)
            .and_then(|facets| facets.get(facet))
        {
            return Some(servant.clone());
        }
        let defaults = self.default_servants.read();
        defaults
            .get(&identity.category)
            .or_else(|| defaults.get(""))
            .cloned()
    }

    /// Returns true if any facet of `identity` is registered.
    pub fn has_identity(&self, identity: &Identity) -> bool {
        self.servants.read().contains_key(identity)
    }

    pub fn clear(&self) {
        self.servants.write().clear();
        self.default_servants.write().clear();
    }
}

fn registered_id(identity: &Identity, facet: &str) -> String {
    if facet.is_empty() {
        identity.to_string()
    } else {
        format!("{identity} -f {facet}")
    }
}
