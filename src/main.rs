//! Switchboard 命令行入口
//!
//! 初始化日志与配置，注册内置 Agent，把标准输入的每一行作为同一会话的一轮输入并打印回复。
//! 用法：`switchboard [config.toml]`；输入 `quit` 退出，`/tasks` 查看最近的 Task。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use switchboard::agents::{ClockAgent, EchoAgent};
use switchboard::core::{register_switchboard, run_with_graceful_shutdown, ShutdownCoordinator, ShutdownManager};
use switchboard::memory::Sender;
use switchboard::{load_config, observability, Incoming, Switchboard, SwitchboardBuilder};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path.as_deref()).context("Failed to load config")?;
    observability::init_with(config.app.log_format);

    let participant_id = config.app.participant_id.clone();
    let switchboard = Arc::new(
        SwitchboardBuilder::new(config)
            .with_keywords("echo", ["say"])
            .with_agent(Arc::new(EchoAgent))
            .with_agent(Arc::new(ClockAgent))
            .build()
            .await
            .context("Failed to assemble switchboard")?,
    );
    switchboard
        .start_listener()
        .await
        .context("Failed to start dispatch listener")?;

    let conversation = switchboard
        .memory()
        .create_conversation(&participant_id)
        .await
        .context("Failed to create conversation")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    register_switchboard(&mut coordinator, &switchboard);

    println!("switchboard ready (conversation {}). Type 'quit' to exit.", conversation.id);
    let repl = run_repl(Arc::clone(&switchboard), conversation.id, participant_id);
    let coordinator = &coordinator;
    run_with_graceful_shutdown(shutdown, repl, move || async move {
        coordinator.run_cleanup().await;
    })
    .await;

    Ok(())
}

async fn run_repl(switchboard: Arc<Switchboard>, conversation_id: String, participant_id: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "failed to read stdin");
                break;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "quit" | "exit") {
            break;
        }
        if input == "/tasks" {
            for task in switchboard.manager().recent_tasks(10).await {
                println!(
                    "  {} {:<10} {:<9} {}ms",
                    task.id,
                    task.assigned_agent,
                    task.status.as_str(),
                    task.duration_ms().unwrap_or_default()
                );
            }
            continue;
        }

        let incoming = Incoming::new(&conversation_id, input).with_participant(&participant_id);
        let reply = switchboard.handle(incoming).await;
        match &reply.sender {
            Sender::Agent(name) => println!("[{}] {}", name, reply.content),
            _ => println!("{}", reply.content),
        }
    }
}
