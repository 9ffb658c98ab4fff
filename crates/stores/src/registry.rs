//! Store registry — resolves configured store names to instances.
//!
//! Built-in names are `memory`, `file`, and `jdbc` (with `database` and
//! `db` as aliases). Hosts may register additional factories under
//! custom names; anything else fails with [`StoreError::UnknownStore`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::info;

use tracevault_core::error::StoreError;
use tracevault_core::store::AuditStore;

use crate::file::{FileStore, FileStoreConfig};
use crate::in_memory::{MemoryStore, MemoryStoreConfig};
#[cfg(feature = "sqlite")]
use crate::sql::{SqlStore, SqlStoreConfig};

/// Builds a custom store from its JSON configuration.
pub type StoreFactory =
    Box<dyn Fn(&Value) -> Result<Arc<dyn AuditStore>, StoreError> + Send + Sync>;

/// Name → store resolution, including host-registered factories.
#[derive(Default)]
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom store under a name (e.g. a fully qualified
    /// implementation path).
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> &mut Self {
        let name = name.into();
        info!(store = %name, "Registered custom audit store");
        self.factories.insert(name, factory);
        self
    }

    /// Lowercase the name and collapse the relational aliases.
    pub fn canonical_name(name: &str) -> String {
        let lower = name.to_lowercase();
        match lower.as_str() {
            "database" | "db" => "jdbc".into(),
            _ => lower,
        }
    }

    /// Resolve and construct a store. Construction validates the
    /// configuration eagerly, so a misconfigured store fails here and
    /// not on first use.
    pub async fn build(
        &self,
        name: &str,
        config: &Value,
    ) -> Result<Arc<dyn AuditStore>, StoreError> {
        match Self::canonical_name(name).as_str() {
            "memory" => {
                let config: MemoryStoreConfig = parse_config(config)?;
                Ok(Arc::new(MemoryStore::new(config)))
            }
            "file" => {
                let config: FileStoreConfig = parse_config(config)?;
                Ok(Arc::new(FileStore::new(config)?))
            }
            #[cfg(feature = "sqlite")]
            "jdbc" => {
                let config: SqlStoreConfig = parse_config(config)?;
                Ok(Arc::new(SqlStore::connect(config).await?))
            }
            _ => match self.factories.get(name) {
                Some(factory) => factory(config),
                None => Err(StoreError::UnknownStore(name.to_string())),
            },
        }
    }
}

fn parse_config<T: DeserializeOwned>(config: &Value) -> Result<T, StoreError> {
    let value = match config {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(value)
        .map_err(|e| StoreError::NotConfigured(format!("invalid store config: {e}")))
}
