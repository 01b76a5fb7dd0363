//! LLM 层：Provider 抽象、各后端 Adapter、注册表、健康追踪与路由

pub mod groq;
pub mod health;
pub mod huggingface;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod registry;
pub mod router;
pub mod traits;
pub mod types;

pub use groq::{create_groq_adapter, GROQ_BASE_URL, GROQ_DEFAULT_MODEL};
pub use health::{HealthPolicy, HealthRecord, HealthTracker};
pub use huggingface::HuggingFaceAdapter;
pub use mock::{MockAdapter, MockBehavior};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use registry::{Provider, ProviderEntry, ProviderKind, ProviderRegistry, ProviderState};
pub use router::{ProviderStatus, Router, RouterPolicy};
pub use traits::ProviderAdapter;
pub use types::{excerpt, CostClass, ImageInput, Operation, Payload, Request, Response};
