use crate::control::ConnectionManager;
use crate::descriptor::SchemaDescriptor;
use crate::error::{ReduceError, Result};
use crate::protocol::GetSchemaReply;
use ahash::AHashMap;
use std::sync::{Arc, RwLock};

/// Process-wide map from schema id to compiled descriptor. Entries live
/// for the process lifetime; there is no eviction or invalidation.
/// Cloning yields a handle onto the same underlying map, so one cache can
/// back every session in the process.
pub struct SchemaCache {
    entries: Arc<RwLock<AHashMap<String, Arc<SchemaDescriptor>>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(AHashMap::new())),
        }
    }

    pub fn get(&self, schema_id: &str) -> Option<Arc<SchemaDescriptor>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(schema_id).cloned())
    }

    pub fn put(&self, descriptor: Arc<SchemaDescriptor>) -> Result<()> {
        let mut entries = self.entries.write()
            .map_err(|e| ReduceError::Unknown(format!("Lock poisoned: {}", e)))?;

        entries.insert(descriptor.schema_id().to_string(), descriptor);
        Ok(())
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(schema_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a missing schema through the coordination service and cache
    /// the compiled descriptor. Duplicate concurrent fetches for one key
    /// are tolerated; both compile identical descriptors and the second
    /// write is a no-op in effect.
    pub fn fetch(
        &self,
        schema_id: &str,
        connection: &ConnectionManager,
    ) -> Result<Arc<SchemaDescriptor>> {
        match connection.get_schema(schema_id)? {
            GetSchemaReply::Found { schema_id, shape } => {
                let descriptor = Arc::new(SchemaDescriptor::compile(schema_id, &shape)?);
                self.put(Arc::clone(&descriptor))?;
                Ok(descriptor)
            }
            GetSchemaReply::NotFound { schema_id } => {
                Err(ReduceError::SchemaNotFound(schema_id))
            }
        }
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SchemaCache {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}
