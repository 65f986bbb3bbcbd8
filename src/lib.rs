//! # LAN Gateway Library
//!
//! 局域网单端口网关：普通 HTTP 转发、CONNECT 隧道，以及带凭证替换、
//! 多密钥故障转移和按日用量统计的 AI 接口网关。

pub mod app;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod proxy;
pub mod statistics;
pub mod usage;
pub mod utils;

// Re-export commonly used types
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
