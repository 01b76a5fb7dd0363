//! OpenLLM - 多 Provider 路由与自愈引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、引擎装配、优雅关闭
//! - **healing**: 错误签名与自愈巡检（自动停用 / 探测恢复）
//! - **llm**: Provider 抽象、各后端 Adapter、注册表、健康追踪与 Router
//! - **memory**: 交互记忆（SQLite / 内存）
//! - **observability**: tracing 初始化
//! - **tools**: 工具调用门面与沙箱文件系统

pub mod config;
pub mod core;
pub mod healing;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;

pub use crate::core::{Engine, EngineBuilder};
