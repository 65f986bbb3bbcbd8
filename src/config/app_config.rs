//! # 进程配置结构定义
//!
//! 启动时加载一次，运行期间不可变。

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// 网关主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    /// 监听与接入配置
    pub server: ServerConfig,
    /// 超时配置
    pub timeouts: TimeoutConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// AI 网关配置
    pub gateway: GatewayConfig,
    /// 客户端统计配置
    pub stats: StatsConfig,
}

/// 监听与接入配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// 绑定地址
    pub host: String,
    /// 绑定端口
    pub port: u16,
    /// 同时存活的最大连接数
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            max_connections: 20,
        }
    }
}

impl ServerConfig {
    /// 监听地址字符串
    #[must_use]
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// 解析为套接字地址
    pub fn socket_addr(&self) -> crate::error::Result<SocketAddr> {
        self.bind_address().parse().map_err(|e| {
            crate::error::ProxyError::config_with_source(
                format!("无效的监听地址: {}", self.bind_address()),
                e,
            )
        })
    }
}

/// 超时配置（秒）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// 读取请求头的期限
    pub header_read_secs: u64,
    /// 连接上游的期限
    pub connect_secs: u64,
    /// 隧道和转发的空闲超时
    pub idle_secs: u64,
    /// 关闭时等待在途连接的宽限期
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            header_read_secs: 15,
            connect_secs: 10,
            idle_secs: 300,
            shutdown_grace_secs: 10,
        }
    }
}

impl TimeoutConfig {
    /// 请求头读取期限
    #[must_use]
    pub const fn header_read(&self) -> Duration {
        Duration::from_secs(self.header_read_secs)
    }

    /// 上游连接期限
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    /// 空闲超时
    #[must_use]
    pub const fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    /// 关闭宽限期
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别，接受 `WARNING` 这类写法
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "WARNING".to_string(),
        }
    }
}

/// AI 网关配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// 是否启用 AI 网关路径
    pub enabled: bool,
    /// 进入网关的路径前缀
    pub api_prefix: String,
    /// 默认上游地址
    pub upstream_base: String,
    /// 密钥配置文件
    pub key_file: PathBuf,
    /// 用量持久化文件
    pub usage_file: PathBuf,
    /// 惰性检查密钥文件变化的间隔
    pub reload_check_interval_secs: u64,
    /// 是否启动文件监听任务
    pub watch_key_file: bool,
    /// 单次上游请求超时
    pub request_timeout_secs: u64,
    /// 网关请求体上限
    pub max_body_bytes: usize,
    /// 用量保留天数
    pub usage_retention_days: u32,
    /// 用量落盘间隔
    pub usage_flush_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_prefix: "/v1beta/".to_string(),
            upstream_base: "https://generativelanguage.googleapis.com".to_string(),
            key_file: PathBuf::from("gemini_config.json"),
            usage_file: PathBuf::from("stats/gemini_usage_history.json"),
            reload_check_interval_secs: 5,
            watch_key_file: true,
            request_timeout_secs: 60,
            max_body_bytes: 32 * 1024 * 1024,
            usage_retention_days: 30,
            usage_flush_interval_secs: 5,
        }
    }
}

impl GatewayConfig {
    /// 惰性检查间隔
    #[must_use]
    pub const fn reload_check_interval(&self) -> Duration {
        Duration::from_secs(self.reload_check_interval_secs)
    }

    /// 上游请求超时
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 落盘间隔
    #[must_use]
    pub const fn usage_flush_interval(&self) -> Duration {
        Duration::from_secs(self.usage_flush_interval_secs)
    }
}

/// 客户端统计配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatsConfig {
    /// 是否记录按 IP 的请求统计
    pub enabled: bool,
    /// 统计文件
    pub file: PathBuf,
    /// 自动保存间隔
    pub auto_save_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: PathBuf::from("stats/request_stats.json"),
            auto_save_interval_secs: 60,
        }
    }
}

impl StatsConfig {
    /// 自动保存间隔
    #[must_use]
    pub const fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval_secs)
    }
}
