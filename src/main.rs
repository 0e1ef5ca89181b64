//! Push Lab CLI
//!
//! 在实验室平台上运行一次诊断会话：检查就绪状态、请求权限、发送测试通知、
//! 管理推送订阅、生成推送服务搭建指南。

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use push_lab::{
    AnthropicGuidance, DeliveryOutcome, DisplayCommand, Harness, HarnessConfig, HistoryItem,
    LabPlatform, PermissionState, ReadinessSnapshot, Subscription,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "plab")]
#[command(about = "Push Lab - Web 推送通知诊断工具")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    env: EnvArgs,

    #[command(subcommand)]
    command: Commands,
}

/// 实验室环境覆盖项
#[derive(Args)]
struct EnvArgs {
    /// 配置文件路径 (默认: ~/.config/push-lab/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// 模拟跨域 iframe 沙箱
    #[arg(long, global = true)]
    sandboxed: bool,
    /// 模拟非 HTTPS 上下文
    #[arg(long, global = true)]
    insecure: bool,
    /// 不注册 Service Worker
    #[arg(long, global = true)]
    no_service_worker: bool,
    /// 权限提示时用户选择拒绝
    #[arg(long, global = true)]
    deny: bool,
    /// 平台不提供通知 API
    #[arg(long, global = true)]
    unsupported: bool,
    /// 已经授予权限
    #[arg(long, global = true)]
    granted: bool,
    /// 轮询间隔（秒）
    #[arg(long, global = true)]
    interval: Option<u64>,
    /// 外部展示命令，例如 "notify-send -u low"
    #[arg(long, global = true)]
    display_command: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// 显示就绪状态
    Status {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 请求通知权限
    Permission,
    /// 发送测试通知
    Fire {
        /// 标题 (默认使用配置)
        #[arg(long)]
        title: Option<String>,
        /// 正文 (默认使用配置)
        #[arg(long)]
        body: Option<String>,
        /// 延迟秒数
        #[arg(long, short, default_value = "0")]
        delay: u64,
        /// 发送前先请求权限
        #[arg(long)]
        request: bool,
    },
    /// 打开推送订阅并输出 JSON
    Subscribe {
        /// base64url 编码的 VAPID 公钥 (默认使用配置)
        #[arg(long)]
        key: Option<String>,
        /// 同时写入文件
        #[arg(long)]
        export: Option<PathBuf>,
        /// 沙箱中退回模拟订阅
        #[arg(long)]
        fallback: bool,
    },
    /// 输出模拟订阅 JSON
    Simulate {
        /// 同时写入文件
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// 订阅后投递一条推送消息
    Push {
        /// base64url 编码的 VAPID 公钥 (默认使用配置)
        #[arg(long)]
        key: Option<String>,
        /// 推送负载（JSON {"title","body"} 或纯文本）
        #[arg(long)]
        payload: Option<String>,
    },
    /// 生成推送服务搭建指南
    Guide {
        /// base64url 编码的 VAPID 公钥 (默认使用配置)
        #[arg(long)]
        key: Option<String>,
    },
    /// 显示生效的配置
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 控制日志级别，例如: RUST_LOG=debug plab fire
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("push_lab=info,plab=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.env)?;

    if let Commands::Config = cli.command {
        let mut shown = config.clone();
        if !shown.guidance.api_key.is_empty() {
            shown.guidance.api_key = "***".to_string();
        }
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }

    let platform = Arc::new(match config.display_command.as_deref().and_then(DisplayCommand::parse) {
        Some(command) => {
            debug!(program = %command.program, "Using external display command");
            LabPlatform::with_display_command(config.lab.clone(), command)
        }
        None => LabPlatform::new(config.lab.clone()),
    });
    let harness = Harness::start(platform.clone(), &config).await;

    let result = run(cli.command, &harness, &config).await;
    if let Some(message) = harness.last_error() {
        eprintln!("⚠️  {}", message);
    }
    harness.shutdown();
    result
}

fn load_config(args: &EnvArgs) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = HarnessConfig::load(path)?;
            config.apply_env();
            config
        }
        None => HarnessConfig::load_default()?,
    };

    if args.sandboxed {
        config.lab.sandboxed = true;
    }
    if args.insecure {
        config.lab.secure_context = false;
    }
    if args.no_service_worker {
        config.lab.service_worker = false;
    }
    if args.deny {
        config.lab.prompt_answer = PermissionState::Denied;
    }
    if args.unsupported {
        config.lab.notifications_supported = false;
    }
    if args.granted {
        config.lab.initial_permission = PermissionState::Granted;
    }
    if let Some(secs) = args.interval {
        config.poll_interval_secs = secs;
    }
    if let Some(command) = &args.display_command {
        config.display_command = Some(command.clone());
    }
    Ok(config)
}

async fn run(command: Commands, harness: &Harness, config: &HarnessConfig) -> Result<()> {
    match command {
        Commands::Status { json } => {
            let snapshot = harness.readiness();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_readiness(&snapshot);
            }
        }
        Commands::Permission => {
            let state = harness.request_permission().await?;
            println!("Permission: {}", state);
        }
        Commands::Fire {
            title,
            body,
            delay,
            request,
        } => {
            if request {
                let state = harness.request_permission().await?;
                info!(permission = %state, "Permission before dispatch");
            }
            let title = title.unwrap_or_else(|| config.default_title.clone());
            let body = body.unwrap_or_else(|| config.default_body.clone());

            match harness.dispatch(&title, &body, Duration::from_secs(delay)).await? {
                DeliveryOutcome::Delivered(item) => print_item(&item),
                DeliveryOutcome::Scheduled(scheduled) => {
                    println!("⏳ Scheduled for {}", scheduled.fires_at.format("%H:%M:%S"));
                    tokio::select! {
                        item = scheduled.wait() => print_item(&item?),
                        _ = tokio::signal::ctrl_c() => {
                            harness.cancel_pending();
                            warn!("Interrupted, pending notification cancelled");
                        }
                    }
                }
            }
        }
        Commands::Subscribe {
            key,
            export,
            fallback,
        } => {
            let key = resolve_key(key, config)?;
            let subscription = if fallback {
                harness.subscribe_or_simulate(&key).await?
            } else {
                harness.subscribe(&key).await?
            };
            print_subscription(&subscription, harness, export)?;
        }
        Commands::Simulate { export } => {
            let subscription = harness.simulate();
            print_subscription(&subscription, harness, export)?;
        }
        Commands::Push { key, payload } => {
            let key = resolve_key(key, config)?;
            harness.subscribe(&key).await?;
            let item = harness
                .deliver_push(payload.map(String::into_bytes))
                .await?;
            print_item(&item);
        }
        Commands::Guide { key } => {
            let key = resolve_key(key, config)?;
            harness.subscribe_or_simulate(&key).await?;
            // blocking client 不能在异步上下文中创建或销毁
            let guidance_config = config.guidance.clone();
            let generator =
                tokio::task::spawn_blocking(move || AnthropicGuidance::new(guidance_config))
                    .await??;
            let text = harness.generate_guidance(Arc::new(generator)).await?;
            println!("{}", text);
        }
        Commands::Config => {}
    }
    Ok(())
}

fn resolve_key(key: Option<String>, config: &HarnessConfig) -> Result<String> {
    key.or_else(|| config.application_server_key.clone())
        .ok_or_else(|| anyhow!("No application server key. Pass --key or set PLAB_VAPID_KEY"))
}

fn print_readiness(snapshot: &ReadinessSnapshot) {
    let mark = |ok: bool| if ok { "✅" } else { "❌" };
    println!("Permission:      {}", snapshot.permission);
    println!("Notifications:   {}", mark(snapshot.notifications_supported));
    println!("Service worker:  {}", mark(snapshot.service_worker_active));
    println!("Secure context:  {}", mark(snapshot.is_secure_context));
    println!(
        "Sandboxed:       {}",
        if snapshot.is_sandboxed { "⚠️  yes" } else { "no" }
    );
}

fn print_item(item: &HistoryItem) {
    println!(
        "✅ [{}] {} - {} ({})",
        item.method,
        item.title,
        item.body,
        item.timestamp.format("%H:%M:%S")
    );
}

fn print_subscription(
    subscription: &Subscription,
    harness: &Harness,
    export: Option<PathBuf>,
) -> Result<()> {
    let json = harness
        .export_subscription()
        .ok_or_else(|| anyhow!("No subscription to export"))?;
    if subscription.is_simulated() {
        eprintln!("ℹ️  Simulated subscription (sandboxed context), not usable for real pushes");
    }
    if let Some(path) = export {
        std::fs::write(&path, &json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Subscription exported");
    }
    println!("{}", json);
    Ok(())
}
