//! Hive 命令行入口
//!
//! 用法：`hive [--profile ID] [--config PATH] <请求文本…>`
//! 事件以 JSON 行写到 stderr，最终 RunOutcome 以 JSON 打印到 stdout；Ctrl+C 取消本次运行。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hive::config::{load_config, resolve_profiles_path};
use hive::execution::event_channel;
use hive::llm::create_llm_from_config;
use hive::profile::{Profile, StaticProfileService};
use hive::tools::EchoTool;
use hive::{observability, Agent, Request};
use tokio_util::sync::CancellationToken;

/// Hive 命令行参数
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(about = "Run a request through the Hive planner / executor pipeline")]
#[command(long_about = None)]
struct Cli {
    /// Profile ID（缺省使用配置中的 default_profile）
    #[arg(long)]
    profile: Option<String>,

    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,

    /// 请求文本，多个单词以空格拼接
    #[arg(required = true, trailing_var_arg = true)]
    request: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config).context("Failed to load config")?;
    let profiles = match resolve_profiles_path(&cfg) {
        Some(path) => StaticProfileService::load(&path)
            .with_context(|| format!("Failed to load profiles from {}", path.display()))?,
        None => {
            tracing::warn!("no profiles file found, using a single standalone profile");
            StaticProfileService::new(vec![Profile::standalone(cfg.app.default_profile.clone())])
        }
    };

    let llm = create_llm_from_config(&cfg.llm);
    let agent = Agent::builder(llm, Arc::new(profiles))
        .with_config(cfg)
        .with_tool(EchoTool)
        .build()
        .context("Failed to build agent")?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, cancelling run");
            on_ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = event_channel();
    let printer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&envelope) {
                eprintln!("{line}");
            }
        }
    });

    let mut request = Request::new(cli.request.join(" "));
    request.profile_id = cli.profile;
    let outcome = agent.run(request, cancel, Some(tx)).await.context("Run failed")?;
    // 发送端随 agent 内部上下文释放后通道关闭
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_joins_trailing_request_words() {
        let cli = Cli::try_parse_from(["hive", "--profile", "sql", "list", "tables", "in", "sales"]).unwrap();
        assert_eq!(cli.profile.as_deref(), Some("sql"));
        assert!(cli.config.is_none());
        assert_eq!(cli.request.join(" "), "list tables in sales");
    }

    #[test]
    fn test_cli_accepts_config_path() {
        let cli = Cli::try_parse_from(["hive", "--config", "hive.toml", "echo", "hi"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("hive.toml")));
        assert!(cli.profile.is_none());
    }

    #[test]
    fn test_cli_requires_request_text() {
        assert!(Cli::try_parse_from(["hive", "--profile", "sql"]).is_err());
    }
}
