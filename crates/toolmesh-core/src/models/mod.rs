pub mod provider;
pub mod tool;

pub use provider::ProviderConfig;
pub use tool::{ProviderTool, Tool};
