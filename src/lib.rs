//! Protocol-aware TCP proxy for PostgreSQL.
//!
//! Clients connect to this service as if it were the database. The proxy
//! reads the startup phase of the libpq protocol (including the in-band TLS
//! upgrade), derives routing metadata from the tenant-encoded `user`
//! parameter, resolves a concrete backend address, replays the startup
//! message to the backend and then relays bytes in both directions until
//! either side closes.

#![deny(deprecated, nonstandard_style)]
#![warn(clippy::all)]

pub mod config;
pub mod http;
pub mod logging;
pub mod pqproto;
pub mod protocol;
pub mod proxy;
pub mod resolver;
pub mod signals;
pub mod stream;
pub mod tenant;
pub mod tls;
pub mod util;
