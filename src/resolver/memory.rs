//! Fixed in-memory backend mapping, mostly for development and tests.

use std::collections::HashMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::debug;

use crate::protocol::RoutingMetadata;
use crate::resolver::BackendResolver;

/// Resolves the `database` startup parameter against a static map.
pub struct StaticResolver {
    backends: HashMap<String, String>,
}

impl StaticResolver {
    /// Build from a `db1=host1:5432,db2=host2:5432` mapping string.
    pub fn from_mapping(mapping: &str) -> anyhow::Result<Self> {
        let mut backends = HashMap::new();
        for pair in mapping.split(',').filter(|p| !p.trim().is_empty()) {
            let Some((name, addr)) = pair.split_once('=') else {
                bail!("invalid backend mapping entry {pair:?}, expected name=host:port");
            };
            backends.insert(name.trim().to_owned(), addr.trim().to_owned());
        }
        Ok(Self { backends })
    }
}

#[async_trait]
impl BackendResolver for StaticResolver {
    async fn resolve(&self, metadata: &RoutingMetadata) -> anyhow::Result<String> {
        let database = metadata
            .database()
            .context("no database in startup parameters")?;
        let addr = self
            .backends
            .get(database)
            .with_context(|| format!("no backend configured for database {database:?}"))?;

        debug!(%database, %addr, "resolved backend");
        Ok(addr.clone())
    }
}
