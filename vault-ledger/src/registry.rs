//! Admin-vetted destinations and their adapters.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapter::DestinationAdapter;
use crate::types::DestinationId;

#[derive(Default, Clone)]
pub struct ProtocolRegistry {
    adapters: BTreeMap<DestinationId, Arc<dyn DestinationAdapter>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an adapter under its own id. Returns `false` if the id is taken.
    pub fn register(&mut self, adapter: Arc<dyn DestinationAdapter>) -> bool {
        let id = adapter.id().clone();
        if self.adapters.contains_key(&id) {
            return false;
        }
        self.adapters.insert(id, adapter);
        true
    }

    pub fn deregister(&mut self, id: &DestinationId) -> Option<Arc<dyn DestinationAdapter>> {
        self.adapters.remove(id)
    }

    pub fn get(&self, id: &DestinationId) -> Option<Arc<dyn DestinationAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn contains(&self, id: &DestinationId) -> bool {
        self.adapters.contains_key(id)
    }

    /// Registered ids in order.
    pub fn ids(&self) -> Vec<DestinationId> {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("destinations", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
