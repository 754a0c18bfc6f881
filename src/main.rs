//! mchat - 终端多轮对话客户端
//!
//! 入口：加载配置、初始化文件日志、创建运行时与 TUI，退出时等待运行时落盘。

use std::path::PathBuf;

use anyhow::Context;
use mchat::{config, core::create_runtime, observability, ui::run_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 唯一可选参数：配置文件路径
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match config::load_config(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!(
                "Create {} or set MCHAT__LLM__BASE_URL and MCHAT__LLM__MODEL",
                config::default_config_path().display()
            );
            std::process::exit(1);
        }
    };

    observability::init(&observability::default_log_path())?;

    let runtime = create_runtime(&cfg)
        .await
        .context("Failed to create chat runtime")?;
    let state_rx = runtime.subscribe();
    let (cmd_tx, handle) = runtime.spawn();

    let ui_result = run_app(state_rx, cmd_tx.clone()).await;
    // UI 异常退出时也要让运行时保存会话
    let _ = cmd_tx.send(mchat::core::Command::Quit);
    handle.await.context("Chat runtime panicked")?;
    ui_result.context("App run failed")
}
