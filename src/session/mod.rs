//! Trip session registry.

pub mod registry;

pub use registry::SessionRegistry;
