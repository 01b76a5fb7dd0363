//! 工具参数与输出的类型定义，参数 JSON Schema 由 schemars 自动生成

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_dir() -> String {
    ".".to_string()
}

fn default_window_minutes() -> u32 {
    60
}

/// chat 参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ChatArgs {
    /// 用户消息
    pub message: String,
    /// 会话 id；省略时使用 "default"，同一会话会带上历史上下文
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// describeImage 参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DescribeImageArgs {
    /// 图片路径（相对工作区）
    pub path: String,
    /// 针对图片的问题，默认让模型整体描述
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// extractText 参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExtractTextArgs {
    pub path: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListFilesArgs {
    #[serde(default = "default_dir")]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub include_hidden: bool,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchFilesArgs {
    #[serde(default = "default_dir")]
    pub path: String,
    /// 文件名子串或 glob 通配（如 *.rs）
    pub pattern: String,
    /// 同时搜索文本内容（仅扫描 1 MiB 以内的文件）
    #[serde(default)]
    pub content_search: bool,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ProviderStatusArgs {}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ErrorSummaryArgs {
    /// 统计窗口（分钟），从现在往前
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
}

impl Default for ErrorSummaryArgs {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
        }
    }
}

/// 经由 Router 的操作（chat / describeImage / extractText）的统一输出
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmOutput {
    pub content: String,
    pub provider_id: String,
    pub model: Option<String>,
    pub latency_ms: u64,
    pub tokens_used: u64,
    pub session_id: String,
}

/// 对外公布的工具描述
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null)
}

/// 全部工具描述（名称固定，顺序稳定）
pub fn tool_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "chat",
            description: "Send a message to the best available language model, with session context.",
            parameters: schema_of::<ChatArgs>(),
        },
        ToolDescriptor {
            name: "describeImage",
            description: "Describe an image from the workspace using a vision-capable model.",
            parameters: schema_of::<DescribeImageArgs>(),
        },
        ToolDescriptor {
            name: "extractText",
            description: "Extract visible text from an image in the workspace.",
            parameters: schema_of::<ExtractTextArgs>(),
        },
        ToolDescriptor {
            name: "readFile",
            description: "Read a text file from the workspace.",
            parameters: schema_of::<ReadFileArgs>(),
        },
        ToolDescriptor {
            name: "writeFile",
            description: "Create or overwrite a text file in the workspace.",
            parameters: schema_of::<WriteFileArgs>(),
        },
        ToolDescriptor {
            name: "listFiles",
            description: "List a workspace directory, directories first.",
            parameters: schema_of::<ListFilesArgs>(),
        },
        ToolDescriptor {
            name: "searchFiles",
            description: "Search workspace files by name and optionally by content.",
            parameters: schema_of::<SearchFilesArgs>(),
        },
        ToolDescriptor {
            name: "providerStatus",
            description: "Show provider health, quarantine and enablement state.",
            parameters: schema_of::<ProviderStatusArgs>(),
        },
        ToolDescriptor {
            name: "errorSummary",
            description: "Summarize recent failures by error class, and success rate and latency per provider.",
            parameters: schema_of::<ErrorSummaryArgs>(),
        },
    ]
}
