//! # LAN Gateway 主程序
//!
//! 单端口网关：HTTP 转发、CONNECT 隧道与 AI 接口密钥轮换

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use lan_gateway::{
    app::GatewayApp,
    config::{self, EnvOverrides, ProxyConfig},
    lerror, linfo,
    logging::{self, LogComponent, LogStage},
};
use tokio_util::sync::CancellationToken;

/// 命令行参数，优先级高于配置文件
#[derive(Debug, Parser)]
#[command(name = "lan-gateway", version, about = "LAN gateway with HTTP forwarding, CONNECT tunnelling and AI key rotation")]
struct Args {
    /// TOML 配置文件路径（默认 config/gateway.toml，不存在时使用内置默认值）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 监听地址
    #[arg(long)]
    host: Option<String>,

    /// 监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 最大并发连接数
    #[arg(long)]
    max_connections: Option<usize>,

    /// 日志级别（DEBUG / INFO / WARNING / ERROR）
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, mut config: ProxyConfig) -> ProxyConfig {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(max_connections) = self.max_connections {
            config.server.max_connections = max_connections;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone();
    let config = config::load_config(config_path.as_deref()).context("加载配置失败")?;
    let config = args.apply(config);
    config::validate_config(&config).context("配置无效")?;

    logging::init_logging(&config.logging.level);
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "service_starting",
        "Gateway starting",
        addr = %config.server.bind_address(),
        max_connections = config.server.max_connections,
        gateway_enabled = config.gateway.enabled,
        key_file = %config.gateway.key_file.display()
    );

    let app = GatewayApp::build(config, EnvOverrides::from_env())
        .await
        .context("网关启动失败")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => linfo!(
                "system",
                LogStage::Shutdown,
                LogComponent::Main,
                "shutdown_signal",
                "Shutdown signal received"
            ),
            Err(e) => lerror!(
                "system",
                LogStage::Shutdown,
                LogComponent::Main,
                "signal_listen_failed",
                "Failed to listen for shutdown signal",
                error = %e
            ),
        }
        signal_token.cancel();
    });

    app.run(shutdown).await.context("网关运行失败")?;
    Ok(())
}
