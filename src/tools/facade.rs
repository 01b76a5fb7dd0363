//! 工具调用门面
//!
//! 固定的一组具名操作：chat / describeImage / extractText 构造 Request 交给 Router；
//! readFile / writeFile / listFiles / searchFiles 只委托给沙箱文件系统，不经过 Router。
//! invoke(name, args) 按名分派 JSON 参数，每次调用输出结构化审计日志（JSON）。
//!
//! 没有任何可用 Provider 时门面仍可构造：经由 Router 的操作返回
//! NoProviderConfigured，文件工具照常工作。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::ToolError;
use crate::healing::{error_summary, ErrorSummary};
use crate::llm::{excerpt, Operation, Payload, ProviderStatus, Request, Response, Router};
use crate::memory::{InteractionRecord, InteractionStore, Message, Outcome};
use crate::tools::image::load_image;
use crate::tools::schema::{
    ChatArgs, DescribeImageArgs, ErrorSummaryArgs, ExtractTextArgs, ListFilesArgs, LlmOutput,
    ReadFileArgs, SearchFilesArgs, WriteFileArgs,
};
use crate::tools::{FileContent, FileEntry, SafeFs, SearchMatch, WriteResult};

pub const DEFAULT_SESSION_ID: &str = "default";
const DESCRIBE_PROMPT: &str = "Describe this image in detail.";
const EXTRACT_PROMPT: &str =
    "Extract all visible text from this image. Return only the extracted text, preserving line breaks.";

/// 门面限制
#[derive(Debug, Clone)]
pub struct FacadeLimits {
    pub max_image_bytes: u64,
    pub max_context_entries: usize,
}

impl Default for FacadeLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: 20 * 1024 * 1024,
            max_context_entries: 20,
        }
    }
}

/// 工具门面：持有 Router（可能缺席）、交互记忆与沙箱文件系统
pub struct ToolFacade {
    router: Option<Arc<Router>>,
    memory: Arc<dyn InteractionStore>,
    fs: SafeFs,
    limits: FacadeLimits,
}

impl ToolFacade {
    pub fn new(router: Arc<Router>, fs: SafeFs, limits: FacadeLimits) -> Self {
        let memory = Arc::clone(router.memory());
        Self {
            router: Some(router),
            memory,
            fs,
            limits,
        }
    }

    /// 没有可用 Provider 时的门面：只有文件工具与状态查询可用
    pub fn without_router(memory: Arc<dyn InteractionStore>, fs: SafeFs, limits: FacadeLimits) -> Self {
        Self {
            router: None,
            memory,
            fs,
            limits,
        }
    }

    pub fn router(&self) -> Option<&Arc<Router>> {
        self.router.as_ref()
    }

    pub fn memory(&self) -> &Arc<dyn InteractionStore> {
        &self.memory
    }

    pub async fn chat(&self, args: ChatArgs) -> Result<LlmOutput, ToolError> {
        self.chat_with_cancel(args, &CancellationToken::new()).await
    }

    pub async fn describe_image(&self, args: DescribeImageArgs) -> Result<LlmOutput, ToolError> {
        self.describe_image_with_cancel(args, &CancellationToken::new())
            .await
    }

    pub async fn extract_text(&self, args: ExtractTextArgs) -> Result<LlmOutput, ToolError> {
        self.extract_text_with_cancel(args, &CancellationToken::new())
            .await
    }

    async fn chat_with_cancel(
        &self,
        args: ChatArgs,
        cancel: &CancellationToken,
    ) -> Result<LlmOutput, ToolError> {
        self.require_router()?;
        if args.message.trim().is_empty() {
            return Err(ToolError::InvalidArguments("message must not be empty".into()));
        }
        let session = session_or_default(args.session_id);
        let mut messages = self.context_messages(&session).await;
        messages.push(Message::user(args.message));
        let payload = Payload::Chat {
            messages,
            system_prompt: args.system_prompt,
            max_tokens: args.max_tokens,
            temperature: args.temperature,
        };
        self.dispatch(Request::new(session, Operation::Chat, payload), cancel)
            .await
    }

    async fn describe_image_with_cancel(
        &self,
        args: DescribeImageArgs,
        cancel: &CancellationToken,
    ) -> Result<LlmOutput, ToolError> {
        self.require_router()?;
        let image = self.load_image(args.path).await?;
        let prompt = args
            .question
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| DESCRIBE_PROMPT.to_string());
        let request = Request::new(
            session_or_default(args.session_id),
            Operation::DescribeImage,
            Payload::Image { image, prompt },
        );
        self.dispatch(request, cancel).await
    }

    async fn extract_text_with_cancel(
        &self,
        args: ExtractTextArgs,
        cancel: &CancellationToken,
    ) -> Result<LlmOutput, ToolError> {
        self.require_router()?;
        let image = self.load_image(args.path).await?;
        let request = Request::new(
            session_or_default(args.session_id),
            Operation::ExtractText,
            Payload::Image {
                image,
                prompt: EXTRACT_PROMPT.to_string(),
            },
        );
        self.dispatch(request, cancel).await
    }

    pub async fn read_file(&self, args: ReadFileArgs) -> Result<FileContent, ToolError> {
        let fs = self.fs.clone();
        blocking(move || fs.read_file(&args.path)).await
    }

    pub async fn write_file(&self, args: WriteFileArgs) -> Result<WriteResult, ToolError> {
        let fs = self.fs.clone();
        blocking(move || fs.write_file(&args.path, &args.content)).await
    }

    pub async fn list_files(&self, args: ListFilesArgs) -> Result<Vec<FileEntry>, ToolError> {
        let fs = self.fs.clone();
        blocking(move || fs.list_files(&args.path, args.recursive, args.include_hidden)).await
    }

    pub async fn search_files(&self, args: SearchFilesArgs) -> Result<Vec<SearchMatch>, ToolError> {
        let fs = self.fs.clone();
        blocking(move || fs.search_files(&args.path, &args.pattern, args.content_search)).await
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.router.as_ref().map(|r| r.stats()).unwrap_or_default()
    }

    /// 最近 window_minutes 内的错误与性能摘要，覆盖注册表中的全部 Provider
    pub async fn error_summary(&self, args: ErrorSummaryArgs) -> Result<ErrorSummary, ToolError> {
        let since = Utc::now() - chrono::Duration::minutes(i64::from(args.window_minutes));
        let provider_ids: Vec<String> = match &self.router {
            Some(router) => router.registry().iter().map(|e| e.id().to_string()).collect(),
            None => Vec::new(),
        };
        error_summary(self.memory.as_ref(), &provider_ids, since)
            .await
            .map_err(|e| ToolError::Io(e.to_string()))
    }

    /// 按名称调用（JSON 参数 / JSON 输出）
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        self.invoke_with_cancel(name, args, &CancellationToken::new())
            .await
    }

    /// 可取消的按名调用；取消只影响经由 Router 的操作
    pub async fn invoke_with_cancel(
        &self,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let start = Instant::now();
        let preview = args_preview(&args);
        let result: Result<Value, ToolError> = async {
            match name {
                "chat" => to_value(self.chat_with_cancel(parse(args)?, cancel).await),
                "describeImage" => {
                    to_value(self.describe_image_with_cancel(parse(args)?, cancel).await)
                }
                "extractText" => to_value(self.extract_text_with_cancel(parse(args)?, cancel).await),
                "readFile" => to_value(self.read_file(parse(args)?).await),
                "writeFile" => to_value(self.write_file(parse(args)?).await),
                "listFiles" => to_value(self.list_files(parse(args)?).await),
                "searchFiles" => to_value(self.search_files(parse(args)?).await),
                "providerStatus" => to_value(Ok(self.provider_status())),
                "errorSummary" => to_value(self.error_summary(parse(args)?).await),
                other => Err(ToolError::UnknownTool(other.to_string())),
            }
        }
        .await;

        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => error_code(e),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }

    async fn dispatch(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<LlmOutput, ToolError> {
        let router = self.require_router()?;
        let session_id = request.session_id.clone();
        let response: Response = router.dispatch_with_cancel(request, cancel).await?;
        Ok(LlmOutput {
            content: response.content,
            provider_id: response.provider_id,
            model: response.model,
            latency_ms: response.latency_ms,
            tokens_used: response.tokens_used,
            session_id,
        })
    }

    fn require_router(&self) -> Result<&Arc<Router>, ToolError> {
        self.router.as_ref().ok_or(ToolError::NoProviderConfigured)
    }

    /// 会话历史转为对话消息（只取成功的 chat 记录）；读取失败时不带上下文继续
    async fn context_messages(&self, session_id: &str) -> Vec<Message> {
        let records = match self
            .memory
            .context_for(session_id, self.limits.max_context_entries)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Context unavailable");
                return Vec::new();
            }
        };
        records.iter().flat_map(record_to_messages).collect()
    }

    async fn load_image(&self, path: String) -> Result<crate::llm::ImageInput, ToolError> {
        let fs = self.fs.clone();
        let max = self.limits.max_image_bytes;
        blocking(move || load_image(&fs, &path, max)).await
    }
}

fn record_to_messages(record: &InteractionRecord) -> Vec<Message> {
    if record.outcome != Outcome::Success || record.operation != Operation::Chat {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(2);
    if let Some(prompt) = &record.prompt {
        out.push(Message::user(prompt.clone()));
    }
    if let Some(response) = &record.response {
        out.push(Message::assistant(response.clone()));
    }
    out
}

fn session_or_default(session_id: Option<String>) -> String {
    session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string())
}

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    // 无参数调用时允许传 null
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn to_value<T: Serialize>(result: Result<T, ToolError>) -> Result<Value, ToolError> {
    let value = result?;
    serde_json::to_value(value).map_err(|e| ToolError::Io(e.to_string()))
}

fn error_code(err: &ToolError) -> String {
    serde_json::to_value(err)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| "error".to_string())
}

async fn blocking<T, F>(f: F) -> Result<T, ToolError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ToolError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError::Io(e.to_string()))?
}

fn args_preview(args: &Value) -> String {
    excerpt(&args.to_string(), 200)
}
