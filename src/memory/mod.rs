//! 记忆层：对话消息、只追加的交互记录及其存储（内存 / SQLite）

pub mod conversation;
pub mod interaction;
pub mod sqlite;
pub mod store;

pub use conversation::{Message, Role};
pub use interaction::{InteractionRecord, Outcome};
pub use sqlite::SqliteInteractionStore;
pub use store::{InMemoryInteractionStore, InteractionStore};
