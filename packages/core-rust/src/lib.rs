//! Datafeed Core -- module descriptors, routing predicates, and message
//! envelopes shared by the coordinator and module clients.

pub mod messages;
pub mod path;

pub use messages::{
    peek, stamp, strip, ModuleKind, RegisterReply, RegisterRequest, RegisteredModule, RouteMeta,
    META_FIELD,
};
pub use path::PathExpr;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
