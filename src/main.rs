//! OpenLLM 命令行入口
//!
//! 初始化日志与配置，装配引擎并启动自愈巡检，然后从标准输入读取指令：
//! - 普通文本：以默认会话发起 chat
//! - `/tool <name> <json>`：调用任意工具
//! - `/status`：打印各 Provider 状态
//! - `/tools`：列出工具描述
//! - `/quit`：退出

use std::path::PathBuf;

use anyhow::Context;
use openllm::config::load_config;
use openllm::core::{BackgroundTaskCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use openllm::tools::{tool_descriptors, ToolFacade};
use openllm::{observability, EngineBuilder};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;
    let engine = EngineBuilder::new(config)
        .build()
        .context("Failed to build engine")?;

    let manager = ShutdownManager::new();
    manager.install_signal_handlers();

    let mut coordinator = ShutdownCoordinator::new(manager.clone());
    if let Some(monitor_handle) = engine.start_monitor(manager.token()) {
        coordinator.register(BackgroundTaskCleanup::new("self-healing-monitor", monitor_handle));
    }

    if let Some(monitor) = &engine.monitor {
        let mut events = monitor.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("[healing] {}", line);
                }
            }
        });
    }

    tokio::select! {
        res = repl(&engine.facade, manager.token()) => {
            if let Err(e) = res {
                manager.shutdown(ShutdownReason::FatalError(e.to_string()));
            } else {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        }
        _ = manager.wait_for_shutdown() => {}
    }

    let report = coordinator.run_cleanup().await;
    if let Some(ShutdownReason::FatalError(msg)) = manager.reason() {
        anyhow::bail!("Stopped after fatal error: {}", msg);
    }
    if !report.timed_out.is_empty() {
        tracing::warn!(tasks = ?report.timed_out, "Exited before some tasks finished");
    }
    Ok(())
}

async fn repl(facade: &ToolFacade, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("openllm ready. Type a message, /status, /tools, /tool <name> <json> or /quit.");

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (name, args) = match parse_command(line) {
            Command::Quit => break,
            Command::Status => {
                print_json(&serde_json::to_value(facade.provider_status())?);
                continue;
            }
            Command::Tools => {
                print_json(&serde_json::to_value(tool_descriptors())?);
                continue;
            }
            Command::Invalid(msg) => {
                eprintln!("{}", msg);
                continue;
            }
            Command::Tool { name, args } => (name, args),
        };

        match facade.invoke_with_cancel(&name, args, &cancel).await {
            Ok(value) => print_json(&value),
            Err(e) => eprintln!("error: {}", e),
        }
    }
    Ok(())
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{}", value),
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Quit,
    Status,
    Tools,
    Tool { name: String, args: Value },
    Invalid(String),
}

fn parse_command(line: &str) -> Command {
    match line {
        "/quit" | "/exit" => return Command::Quit,
        "/status" => return Command::Status,
        "/tools" => return Command::Tools,
        _ => {}
    }

    let Some(rest) = line.strip_prefix("/tool ") else {
        return Command::Tool {
            name: "chat".to_string(),
            args: serde_json::json!({ "message": line }),
        };
    };

    let rest = rest.trim();
    let (name, raw) = match rest.split_once(char::is_whitespace) {
        Some((name, raw)) => (name, raw.trim()),
        None => (rest, "{}"),
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(args) => Command::Tool {
            name: name.to_string(),
            args,
        },
        Err(e) => Command::Invalid(format!("invalid JSON arguments: {}", e)),
    }
}
