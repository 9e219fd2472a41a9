mod backoff;
mod catalog;
mod error;
mod renderer;

pub use catalog::{ToolCatalogSource, ToolDescriptor, ToolParam};
pub use error::PromptError;
pub use renderer::{PromptRenderer, RenderOptions};
