//! 工具层：调用门面、沙箱文件系统、图片读取与参数 Schema

pub mod facade;
pub mod filesystem;
pub mod image;
pub mod schema;

pub use facade::{FacadeLimits, ToolFacade, DEFAULT_SESSION_ID};
pub use filesystem::{
    EntryKind, FileContent, FileEntry, MatchKind, SafeFs, SearchMatch, WriteResult,
};
pub use image::{detect_mime, load_image};
pub use schema::{tool_descriptors, LlmOutput, ToolDescriptor};
