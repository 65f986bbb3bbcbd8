//! 集成测试公共设施：在随机端口上启动完整网关，以及几个简单的本地上游

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lan_gateway::app::GatewayApp;
use lan_gateway::config::{ApiKeyConfig, EnvOverrides, KeyConfigStore, ProxyConfig};
use lan_gateway::proxy::ConnectionLimit;
use lan_gateway::statistics::ClientStatsTracker;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 运行中的测试网关
pub struct TestGateway {
    pub addr: SocketAddr,
    pub dir: tempfile::TempDir,
    pub key_store: Arc<KeyConfigStore>,
    pub stats: Arc<ClientStatsTracker>,
    pub connections: ConnectionLimit,
    shutdown: CancellationToken,
    handle: JoinHandle<lan_gateway::Result<()>>,
}

impl TestGateway {
    /// 以测试友好的默认值启动，`configure` 可再做调整
    pub async fn start(keys: &[ApiKeyConfig], configure: impl FnOnce(&mut ProxyConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProxyConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.timeouts.header_read_secs = 2;
        config.timeouts.connect_secs = 2;
        config.timeouts.idle_secs = 5;
        config.timeouts.shutdown_grace_secs = 1;
        config.gateway.key_file = dir.path().join("gemini_config.json");
        config.gateway.usage_file = dir.path().join("stats/gemini_usage_history.json");
        config.gateway.watch_key_file = false;
        config.gateway.reload_check_interval_secs = 0;
        config.gateway.usage_flush_interval_secs = 3600;
        config.stats.file = dir.path().join("stats/request_stats.json");
        config.stats.auto_save_interval_secs = 3600;
        configure(&mut config);

        write_keys(&config.gateway.key_file, keys);

        let app = GatewayApp::build(config, EnvOverrides::default()).await.unwrap();
        let addr = app.local_addr();
        let key_store = app.key_store();
        let stats = app.stats();
        let connections = app.connections();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(app.run(shutdown.clone()));

        Self {
            addr,
            dir,
            key_store,
            stats,
            connections,
            shutdown,
            handle,
        }
    }

    pub fn key_file(&self) -> PathBuf {
        self.key_store.path().to_path_buf()
    }

    pub fn usage_file(&self) -> PathBuf {
        self.dir.path().join("stats/gemini_usage_history.json")
    }

    pub fn stats_file(&self) -> PathBuf {
        self.dir.path().join("stats/request_stats.json")
    }

    /// 触发关闭并等待结束
    pub async fn stop(self) -> tempfile::TempDir {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("gateway did not stop in time")
            .unwrap()
            .unwrap();
        self.dir
    }
}

/// 写密钥文件（包装格式）
pub fn write_keys(path: &std::path::Path, keys: &[ApiKeyConfig]) {
    let document = serde_json::json!({ "enabled": true, "configs": keys });
    std::fs::write(path, serde_json::to_vec_pretty(&document).unwrap()).unwrap();
}

/// 发送原始字节并读到连接关闭
pub async fn send_raw(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("response not finished in time")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// 回显服务器：每个连接把收到的字节原样写回
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.into_split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    addr
}

/// 一个已关闭的端口
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// 当天日期（与网关计数使用同一时区）
pub fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

/// 轮询直到条件成立（连接任务在响应发出后才记录统计）
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}
