//! Edge Stream Agent CLI
//!
//! 接收 RabbitMQ 命令，监管 RTSP → RTMP relay 进程

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use edge_stream_agent::{AgentConfig, AgentController, CliBridge};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "esa")]
#[command(about = "Edge Stream Agent - 接收远程命令，监管视频推流进程")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动 agent，连接 broker 并消费命令队列
    Run(RunArgs),
    /// 检查本机环境与有效配置
    Check,
}

#[derive(Args)]
struct RunArgs {
    /// 覆盖 agent 身份标识（默认读 JETSON_ID 环境变量）
    #[arg(long)]
    agent_id: Option<String>,
    /// Broker 主机名
    #[arg(long)]
    broker_host: Option<String>,
    /// Broker 端口
    #[arg(long)]
    broker_port: Option<u16>,
    /// Broker 用户名
    #[arg(long)]
    broker_user: Option<String>,
    /// Broker 密码
    #[arg(long)]
    broker_pass: Option<String>,
    /// 命令队列名称
    #[arg(long)]
    command_queue: Option<String>,
    /// 响应队列名称
    #[arg(long)]
    response_queue: Option<String>,
    /// 视频管线控制程序
    #[arg(long)]
    bridge_program: Option<String>,
    /// 本地 relay 端点
    #[arg(long)]
    local_endpoint: Option<String>,
}

impl RunArgs {
    fn apply(self, config: &mut AgentConfig) {
        if let Some(agent_id) = self.agent_id {
            config.agent_id = agent_id;
        }
        if let Some(host) = self.broker_host {
            config.broker.host = host;
        }
        if let Some(port) = self.broker_port {
            config.broker.port = port;
        }
        if let Some(user) = self.broker_user {
            config.broker.username = user;
        }
        if let Some(pass) = self.broker_pass {
            config.broker.password = pass;
        }
        if let Some(queue) = self.command_queue {
            config.broker.command_queue = queue;
        }
        if let Some(queue) = self.response_queue {
            config.broker.response_queue = queue;
        }
        if let Some(program) = self.bridge_program {
            config.bridge_program = program;
        }
        if let Some(endpoint) = self.local_endpoint {
            config.relay.local_endpoint = endpoint;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化 tracing 日志系统
    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    // 例如: RUST_LOG=debug esa run
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("edge_stream_agent=info,esa=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let mut config = AgentConfig::load()?;
            args.apply(&mut config);
            check_relay_program(&config);

            let bridge = Arc::new(CliBridge::new(config.bridge_program.clone()));
            let controller = AgentController::new(config, bridge);

            spawn_signal_handler(&controller);
            controller.run().await?;
        }
        Commands::Check => {
            let config = AgentConfig::load()?;
            println!("配置文件: {}", AgentConfig::config_file_path().display());
            println!("{}", serde_json::to_string_pretty(&config)?);

            let relay_program = config.relay.backend.program();
            match which::which(relay_program) {
                Ok(path) => println!("relay 工具: {} -> {}", relay_program, path.display()),
                Err(_) => println!("relay 工具: {} 未找到 (PATH)", relay_program),
            }
            match which::which(&config.bridge_program) {
                Ok(path) => println!("bridge 控制程序: {} -> {}", config.bridge_program, path.display()),
                Err(_) => println!("bridge 控制程序: {} 未找到 (PATH)", config.bridge_program),
            }
        }
    }

    Ok(())
}

/// relay 工具缺失时提前告警，不阻止启动
fn check_relay_program(config: &AgentConfig) {
    let program = config.relay.backend.program();
    if which::which(program).is_err() {
        warn!(program, "Relay program not found on PATH, start_stream commands will fail");
    }
}

/// 监听进程终止信号，触发有序关闭
fn spawn_signal_handler(controller: &AgentController) {
    let shutdown = controller.shutdown_sender();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }
        let _ = shutdown.send(true);
    });
}
