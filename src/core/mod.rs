//! 核心层：错误分类、引擎装配与优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{Engine, EngineBuilder};
pub use error::{
    MemoryError, ProviderError, ProviderErrorKind, RegistryError, RouterError, ToolError,
};
pub use shutdown::{
    BackgroundTaskCleanup, CleanupReport, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
