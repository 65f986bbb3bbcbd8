//! # 错误类型定义

use reqwest::StatusCode;
use thiserror::Error;

/// 网关主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置相关错误（包含密钥文件加载失败）
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 请求行或请求头无法解析
    #[error("请求格式错误: {message}")]
    MalformedRequest { message: String },

    /// 请求体超过允许大小
    #[error("请求体过大: {message}")]
    PayloadTooLarge { message: String, limit: usize },

    /// 连接上游失败（拒绝连接、DNS 解析失败等）
    #[error("上游连接失败: {target}: {message}")]
    UpstreamConnect {
        target: String,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 连接超时错误
    #[error("连接超时: {message}")]
    ConnectionTimeout {
        message: String,
        timeout_seconds: u64,
    },

    /// 上游 HTTP 通信错误
    #[error("网络错误: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 没有可用密钥
    #[error("所有密钥均不可用: {message}")]
    AllKeysExhausted { message: String },

    /// AI 网关未启用
    #[error("AI网关未启用")]
    GatewayDisabled,

    /// 目标指向网关自身或客户端自身
    #[error("检测到代理循环: {target}")]
    LoopDetected { target: String },

    /// 连接数已满，拒绝接入
    #[error("连接数已达上限: {max_connections}")]
    AdmissionRejected { max_connections: usize },

    /// 服务器启动错误
    #[error("服务器启动错误: {message}")]
    ServerStart {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 附加上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProxyError>,
    },
}

impl ProxyError {
    /// 将错误转换为HTTP状态码和错误代码
    #[must_use]
    pub fn to_http_response_parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Self::MalformedRequest { .. } => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
            Self::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            Self::UpstreamConnect { .. } => (StatusCode::BAD_GATEWAY, "UPSTREAM_CONNECT_FAILED"),
            Self::ConnectionTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "CONNECTION_TIMEOUT"),
            Self::Network { .. } => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            Self::AllKeysExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            Self::GatewayDisabled => (StatusCode::BAD_REQUEST, "FAILED_PRECONDITION"),
            Self::LoopDetected { .. } => (StatusCode::LOOP_DETECTED, "LOOP_DETECTED"),
            Self::AdmissionRejected { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "TOO_MANY_CONNECTIONS")
            }
            Self::ServerStart { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "SERVER_START_ERROR"),
            Self::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            Self::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::Serialization { .. } => (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR"),
            Self::Context { source, .. } => source.to_http_response_parts(),
        }
    }

    /// 剥掉上下文包装后的根错误
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建请求格式错误
    pub fn malformed<T: Into<String>>(message: T) -> Self {
        Self::MalformedRequest {
            message: message.into(),
        }
    }

    /// 创建上游连接错误
    pub fn upstream_connect<T: Into<String>, M: Into<String>>(target: T, message: M) -> Self {
        Self::UpstreamConnect {
            target: target.into(),
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的上游连接错误
    pub fn upstream_connect_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        target: T,
        source: E,
    ) -> Self {
        let source = source.into();
        Self::UpstreamConnect {
            target: target.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// 创建连接超时错误
    pub fn connection_timeout<T: Into<String>>(message: T, timeout_seconds: u64) -> Self {
        Self::ConnectionTimeout {
            message: message.into(),
            timeout_seconds,
        }
    }

    /// 创建带来源的网络错误
    pub fn network_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建密钥耗尽错误
    pub fn all_keys_exhausted<T: Into<String>>(message: T) -> Self {
        Self::AllKeysExhausted {
            message: message.into(),
        }
    }

    /// 创建带来源的服务器启动错误
    pub fn server_start_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::ServerStart {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建IO错误
    pub fn io<T: Into<String>>(message: T, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "IO操作失败".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON处理失败".to_string(),
            source: err.into(),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::connection_timeout(format!("上游请求超时: {err}"), 0);
        }
        Self::network_with_source("HTTP请求失败", err)
    }
}

impl From<notify::Error> for ProxyError {
    fn from(err: notify::Error) -> Self {
        Self::config_with_source("文件监听失败", err)
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        Self::config_with_source("URL解析失败", err)
    }
}
