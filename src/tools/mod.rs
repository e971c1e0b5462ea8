//! 工具：ToolStep 调用的回调与注册表

pub mod registry;

pub use registry::{FnTool, Tool, ToolRegistry};
