//! 自愈：错误签名归一化、周期巡检与错误摘要

pub mod monitor;
pub mod signature;
pub mod summary;

pub use monitor::{HealingEvent, MonitorPolicy, SelfHealingMonitor, WindowStats, PROBE_SESSION_ID};
pub use signature::{error_signature, normalize_message, signature_class};
pub use summary::{error_summary, ErrorSummary, ProviderSummary};
