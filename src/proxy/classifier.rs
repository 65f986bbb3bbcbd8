//! # 请求分类
//!
//! 读完请求头后决定连接走哪条路径：CONNECT 隧道、普通转发或 AI 网关。

use std::time::Duration;

use tokio::io::AsyncBufRead;

use super::http::{RequestHead, read_request_head};
use crate::error::{ProxyError, Result};
use crate::{ensure_wellformed, malformed_error};

/// 分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `CONNECT host:port`
    ConnectTunnel {
        /// 目标主机
        host: String,
        /// 目标端口
        port: u16,
    },
    /// 普通 HTTP 转发
    ForwardHttp {
        /// 目标主机
        host: String,
        /// 目标端口
        port: u16,
        /// 改写后的 origin-form 目标
        origin_form: String,
    },
    /// AI 网关
    Gateway {
        /// 路径与查询串
        path_and_query: String,
    },
}

/// 带解析后请求头的分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// 请求头
    pub head: RequestHead,
    /// 路由
    pub route: Route,
}

/// 请求分类器
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    api_prefix: String,
}

impl RequestClassifier {
    /// 以网关路径前缀创建
    pub fn new(api_prefix: impl Into<String>) -> Self {
        Self {
            api_prefix: api_prefix.into(),
        }
    }

    /// 在期限内读取请求头并分类；客户端未发送任何字节就关闭时返回 `Ok(None)`
    pub async fn read_and_classify<R>(&self, reader: &mut R, deadline: Duration) -> Result<Option<Classified>>
    where
        R: AsyncBufRead + Unpin,
    {
        let head = tokio::time::timeout(deadline, read_request_head(reader))
            .await
            .map_err(|_| ProxyError::connection_timeout("读取请求头超时", deadline.as_secs()))??;

        head.map(|head| self.classify(head)).transpose()
    }

    /// 对已解析的请求头分类
    pub fn classify(&self, head: RequestHead) -> Result<Classified> {
        let route = if head.method.eq_ignore_ascii_case("CONNECT") {
            let (host, port) = parse_authority(&head.target, 443)?;
            Route::ConnectTunnel { host, port }
        } else if head.target.starts_with('/') {
            if head.target.starts_with(&self.api_prefix) {
                Route::Gateway {
                    path_and_query: head.target.clone(),
                }
            } else {
                let host_header = head
                    .header("host")
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| malformed_error!("缺少 Host 请求头"))?;
                let (host, port) = parse_authority(host_header, 80)?;
                Route::ForwardHttp {
                    host,
                    port,
                    origin_form: head.target.clone(),
                }
            }
        } else {
            let (host, port, origin_form) = split_absolute_form(&head.target)?;
            Route::ForwardHttp {
                host,
                port,
                origin_form,
            }
        };

        Ok(Classified { head, route })
    }
}

/// 解析 `host[:port]`，支持 `[v6]:port`
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let authority = authority.trim();
    ensure_wellformed!(!authority.is_empty(), "目标地址为空");
    ensure_wellformed!(
        !authority.contains(['/', ' ', '@', '?', '#']),
        "目标地址无效: {}",
        authority
    );

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| malformed_error!("IPv6 地址缺少 ]: {}", authority))?;
        let port = match after {
            "" => None,
            p => Some(
                p.strip_prefix(':')
                    .ok_or_else(|| malformed_error!("目标地址无效: {}", authority))?,
            ),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => {
                return Err(malformed_error!("IPv6 地址需要方括号: {}", authority));
            }
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    ensure_wellformed!(!host.is_empty(), "目标主机为空: {}", authority);
    let port = match port {
        None => default_port,
        Some(p) => p
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| malformed_error!("端口无效: {}", authority))?,
    };

    Ok((host.to_string(), port))
}

/// 拆分 absolute-form 目标为 (主机, 端口, origin-form)
fn split_absolute_form(target: &str) -> Result<(String, u16, String)> {
    let (scheme, rest) = target
        .split_once("://")
        .ok_or_else(|| malformed_error!("请求目标无效: {}", target))?;
    ensure_wellformed!(
        scheme.eq_ignore_ascii_case("http"),
        "不支持的协议: {}（HTTPS 请使用 CONNECT）",
        scheme
    );

    let split_at = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, path) = rest.split_at(split_at);
    // 去掉 userinfo
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let (host, port) = parse_authority(authority, 80)?;

    let path = path.split('#').next().unwrap_or_default();
    let origin_form = if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('?') {
        format!("/{path}")
    } else {
        path.to_string()
    };

    Ok((host, port, origin_form))
}
