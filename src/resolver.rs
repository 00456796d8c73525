//! Backend discovery contract.

pub mod memory;

use async_trait::async_trait;

use crate::protocol::RoutingMetadata;

/// Maps routing metadata to a dialable backend address.
///
/// Implementations are shared read-only across all connection tasks; any
/// caching is their own concern. The dispatch engine bounds every call with
/// a deadline, so implementations should stay honest about cancellation.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    /// Resolve to a `host:port` address accepted by the TCP dialer.
    async fn resolve(&self, metadata: &RoutingMetadata) -> anyhow::Result<String>;
}
