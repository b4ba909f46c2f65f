/// Policy resolution for the CLIP proxy.
///
/// Computes the effective per-tool policy by layering the three config
/// scopes (global → upstream → tool) with field-level merging.
pub mod resolver;

pub use resolver::{qualify, split_qualified, PolicyResolver};
