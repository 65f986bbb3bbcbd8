//! # 日志配置模块
//!
//! 统一的结构化日志：每条日志都带有 `request_id`、处理阶段、组件和操作名，
//! 通过 `linfo!` / `ldebug!` / `lwarn!` / `lerror!` 宏输出。

use std::env;
use std::fmt;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 请求处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    /// 启动
    Startup,
    /// 接入连接
    Accept,
    /// 请求分类
    Classify,
    /// 普通 HTTP 转发
    Forward,
    /// CONNECT 隧道
    Tunnel,
    /// 密钥选择
    Scheduling,
    /// 上游请求
    UpstreamRequest,
    /// 响应回写
    Response,
    /// 配置重载
    Reload,
    /// 用量记录
    Usage,
    /// 后台任务
    BackgroundTask,
    /// 关闭
    Shutdown,
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Startup => "startup",
            Self::Accept => "accept",
            Self::Classify => "classify",
            Self::Forward => "forward",
            Self::Tunnel => "tunnel",
            Self::Scheduling => "scheduling",
            Self::UpstreamRequest => "upstream_request",
            Self::Response => "response",
            Self::Reload => "reload",
            Self::Usage => "usage",
            Self::BackgroundTask => "background_task",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// 产生日志的组件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    /// 进程入口
    Main,
    /// 连接接入与监管
    Server,
    /// 请求分类器
    Classifier,
    /// HTTP 转发
    Forwarder,
    /// 隧道
    Tunnel,
    /// AI 网关路由
    Gateway,
    /// 密钥配置存储
    KeyStore,
    /// 文件监听
    Watcher,
    /// 用量存储
    Usage,
    /// 客户端统计
    Statistics,
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Main => "main",
            Self::Server => "server",
            Self::Classifier => "classifier",
            Self::Forwarder => "forwarder",
            Self::Tunnel => "tunnel",
            Self::Gateway => "gateway",
            Self::KeyStore => "key_store",
            Self::Watcher => "watcher",
            Self::Usage => "usage",
            Self::Statistics => "statistics",
        };
        f.write_str(name)
    }
}

/// info 级结构化日志
#[macro_export]
macro_rules! linfo {
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr $(,)?) => {
        ::tracing::info!(request_id = %$rid, stage = %$stage, component = %$component, operation = $op, "{}", $msg)
    };
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr, $($fields:tt)+) => {
        ::tracing::info!(request_id = %$rid, stage = %$stage, component = %$component, operation = $op, $($fields)+, "{}", $msg)
    };
}

/// debug 级结构化日志
#[macro_export]
macro_rules! ldebug {
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr $(,)?) => {
        ::tracing::debug!(request_id = %$rid, stage = %$stage, component = %$component, operation = $op, "{}", $msg)
    };
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr, $($fields:tt)+) => {
        ::tracing::debug!(request_id = %$rid, stage = %$stage, component = %$component, operation = $op, $($fields)+, "{}", $msg)
    };
}

/// warn 级结构化日志
#[macro_export]
macro_rules! lwarn {
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr $(,)?) => {
        ::tracing::warn!(request_id = %$rid, stage = %$stage, component = %$component, operation = $op, "{}", $msg)
    };
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr, $($fields:tt)+) => {
        ::tracing::warn!(request_id = %$rid, stage = %$stage, component = %$component, operation = $op, $($fields)+, "{}", $msg)
    };
}

/// error 级结构化日志
#[macro_export]
macro_rules! lerror {
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr $(,)?) => {
        ::tracing::error!(request_id = %$rid, stage = %$stage, component = %$component, operation = $op, "{}", $msg)
    };
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr, $($fields:tt)+) => {
        ::tracing::error!(request_id = %$rid, stage = %$stage, component = %$component, operation = $op, $($fields)+, "{}", $msg)
    };
}

/// 把 WARNING、CRITICAL 等常见写法归一成 tracing 的级别名
#[must_use]
pub fn normalize_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" | "fatal" => "error",
        "off" => "off",
        _ => "info",
    }
}

/// 初始化日志系统
///
/// `RUST_LOG` 存在时优先使用，否则以配置级别作为默认过滤器。
/// 重复初始化（例如测试中）会被忽略。
pub fn init_logging(log_level: &str) {
    let level = normalize_level(log_level);
    let default_filter = format!("{level},lan_gateway={level},reqwest=warn,hyper=warn");
    let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(
            tracing_fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}

/// 日志里展示密钥时只保留末尾四位
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}
