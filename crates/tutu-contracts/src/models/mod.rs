mod registry;
mod selectors;

pub use registry::{ModelCatalog, ModelSpec};
pub use selectors::{ModelSelection, ModelSelector, TaggedModel};
