//! # 配置管理模块
//!
//! 进程配置（TOML，启动时加载一次）和密钥配置（JSON，运行期热重载）。

mod app_config;
pub mod key_store;
mod watcher;

pub use app_config::{
    GatewayConfig, LoggingConfig, ProxyConfig, ServerConfig, StatsConfig, TimeoutConfig,
};
pub use key_store::{ApiKeyConfig, EnvOverrides, KeyConfigStore, KeySet, KeyStoreEvent};
pub use watcher::KeyFileWatcher;

use crate::ensure_config;
use crate::error::{ProxyError, Result};
use std::path::Path;

/// 默认进程配置文件位置
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

/// 加载配置文件
///
/// 未显式指定且默认文件不存在时使用内置默认值。
pub fn load_config(path: Option<&Path>) -> Result<ProxyConfig> {
    let (config_file, explicit) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG_PATH), false),
    };

    if !config_file.exists() {
        if explicit {
            return Err(ProxyError::config(format!(
                "配置文件不存在: {}",
                config_file.display()
            )));
        }
        let config = ProxyConfig::default();
        validate_config(&config)?;
        return Ok(config);
    }

    let config_content = std::fs::read_to_string(config_file).map_err(|e| {
        ProxyError::config_with_source(format!("读取配置文件失败: {}", config_file.display()), e)
    })?;

    let config = parse_config(&config_content)?;
    Ok(config)
}

/// 从 TOML 文本解析并校验
pub fn parse_config(content: &str) -> Result<ProxyConfig> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// 验证配置有效性
pub fn validate_config(config: &ProxyConfig) -> Result<()> {
    ensure_config!(config.server.port != 0, "无效的服务器端口: {}", config.server.port);
    ensure_config!(!config.server.host.trim().is_empty(), "监听地址不能为空");
    ensure_config!(config.server.max_connections > 0, "最大连接数必须大于0");
    config.server.socket_addr()?;

    ensure_config!(config.timeouts.header_read_secs > 0, "请求头读取超时必须大于0");
    ensure_config!(config.timeouts.connect_secs > 0, "连接超时必须大于0");
    ensure_config!(config.timeouts.idle_secs > 0, "空闲超时必须大于0");

    let gateway = &config.gateway;
    ensure_config!(
        gateway.api_prefix.starts_with('/'),
        "网关路径前缀必须以 / 开头: {}",
        gateway.api_prefix
    );
    url::Url::parse(&gateway.upstream_base)?;
    ensure_config!(gateway.usage_retention_days > 0, "用量保留天数必须大于0");
    ensure_config!(gateway.max_body_bytes > 0, "请求体上限必须大于0");
    ensure_config!(gateway.request_timeout_secs > 0, "上游请求超时必须大于0");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_follow_lan_deployment() {
        let config = ProxyConfig::default();
        assert_eq!(config.server.bind_address(), "0.0.0.0:8888");
        assert_eq!(config.server.max_connections, 20);
        assert_eq!(config.logging.level, "WARNING");
        assert_eq!(config.gateway.api_prefix, "/v1beta/");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = parse_config(
            r#"
[server]
port = 9000

[gateway]
key_file = "keys.json"
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.gateway.key_file, Path::new("keys.json"));
        assert_eq!(config.timeouts, TimeoutConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse_config("[server]\nmax_connections = 0\n").is_err());
        assert!(parse_config("[gateway]\napi_prefix = \"v1beta\"\n").is_err());
        assert!(parse_config("[gateway]\nupstream_base = \"not a url\"\n").is_err());
        assert!(parse_config("[server]\nport = \"abc\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[server]\nhost = \"127.0.0.1\"\nport = 18888\n").unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.server.bind_address(), "127.0.0.1:18888");
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = load_config(Some(Path::new("/nonexistent/gateway.toml"))).unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
    }

    #[test]
    fn test_ipv6_bind_address() {
        let server = ServerConfig {
            host: "::1".to_string(),
            port: 8888,
            max_connections: 1,
        };
        assert_eq!(server.bind_address(), "[::1]:8888");
        assert!(server.socket_addr().is_ok());
    }
}
