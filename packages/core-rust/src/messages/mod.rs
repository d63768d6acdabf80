//! Wire-compatible message schemas for the datafeed protocol.
//!
//! Everything that crosses the broker is JSON with camelCase field names.
//! `registration` covers the client -> coordinator registration handshake;
//! `envelope` covers the coordinator-internal `__meta` routing stamp.

pub mod envelope;
pub mod registration;

pub use envelope::{peek, stamp, strip, RouteMeta, META_FIELD};
pub use registration::{ModuleKind, RegisterReply, RegisterRequest, RegisteredModule};
