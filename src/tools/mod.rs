//! Tools: the capabilities a tool-bearing step may invoke.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::{ToolDefinition, ToolRegistry};
pub use tool::*;
