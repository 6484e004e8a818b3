//! Chat pipeline.

pub mod pipeline;

pub use pipeline::{ChatPipeline, validate_content, validate_reaction};
