//! Ready-made modules that ship with the server.

pub mod archive;

pub use archive::{ArchiveConfig, ArchiveModule};
