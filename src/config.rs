//! Engine configuration.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:5432";
pub const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:8080";

/// Upper bound on a single backend resolution.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProxyConfig {
    /// Address postgres clients connect to.
    pub listen: SocketAddr,
    /// Address of the liveness/readiness HTTP surface.
    pub http_listen: SocketAddr,
    pub resolve_timeout: Duration,
}
