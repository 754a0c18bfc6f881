//! 工具层：Tool trait 与注册表、并发执行器，以及网页搜索 / 抓取 / 沙箱文件读写

pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod search;

pub use executor::{ToolExecutor, ERROR_MARKER};
pub use filesystem::{ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{Tool, ToolRegistry};
pub use schema::parameters_schema;
pub use search::{ExtractWebPageTool, WebSearchTool};
