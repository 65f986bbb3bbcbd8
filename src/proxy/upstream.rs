//! # 上游连接
//!
//! 转发和隧道路径使用一次性的 TCP 连接；AI 网关路径通过 `GatewayUpstream`
//! 发送 HTTPS 请求，默认实现基于 reqwest，响应体以流的形式交给调用方。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};

/// 上游响应体的字节流
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 建立到 `host:port` 的 TCP 连接
///
/// 超时返回 `ConnectionTimeout`，拒绝连接和 DNS 失败返回 `UpstreamConnect`。
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let target = format_target(host, port);
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(ProxyError::upstream_connect_with_source(target, e)),
        Err(_) => Err(ProxyError::connection_timeout(
            format!("连接 {target} 超时"),
            timeout.as_secs(),
        )),
    }
}

/// `host:port` 形式的展示串，IPv6 加方括号
#[must_use]
pub fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// 发往 AI 上游的请求
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// 方法
    pub method: String,
    /// 完整 URL（已注入凭证）
    pub url: String,
    /// 需要透传的请求头
    pub headers: Vec<(String, String)>,
    /// 请求体
    pub body: Bytes,
}

/// AI 上游的响应
pub struct UpstreamResponse {
    /// 状态码
    pub status: StatusCode,
    /// 响应头
    pub headers: Vec<(String, String)>,
    /// 响应体
    pub body: BodyStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl UpstreamResponse {
    /// 由完整响应体构造
    pub fn from_bytes(status: StatusCode, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            headers,
            body: Box::pin(futures::stream::once(async move { Ok::<_, ProxyError>(body) })),
        }
    }

    /// 取第一个同名响应头
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 预读响应体开头至少 `limit` 字节（或直到结束）用于判定错误类型
    ///
    /// 预读的内容会放回流的开头，之后仍可完整回传。
    pub async fn buffer_prefix(&mut self, limit: usize) -> Result<Bytes> {
        let mut chunks = Vec::new();
        let mut buffered = 0usize;
        while buffered < limit {
            match self.body.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    buffered += chunk.len();
                    chunks.push(chunk);
                }
                None => break,
            }
        }

        let prefix: Bytes = chunks.concat().into();
        let rest = std::mem::replace(&mut self.body, Box::pin(futures::stream::empty()));
        let replay = prefix.clone();
        self.body = Box::pin(
            futures::stream::once(async move { Ok::<_, ProxyError>(replay) })
                .filter(|chunk| futures::future::ready(chunk.as_ref().map_or(true, |c| !c.is_empty())))
                .chain(rest),
        );
        Ok(prefix)
    }
}

/// AI 上游抽象
#[async_trait]
pub trait GatewayUpstream: Send + Sync {
    /// 发送一次请求，只有网络层失败才返回错误
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;
}

/// 基于 reqwest 的上游实现
#[derive(Debug, Clone)]
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    /// 创建客户端，不做连接池复用
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .pool_max_idle_per_host(0)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::internal_with_source("创建 HTTP 客户端失败", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GatewayUpstream for ReqwestUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ProxyError::malformed(format!("请求方法无效: {e}")))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::connection_timeout(format!("上游请求超时: {e}"), 0)
            } else if e.is_connect() {
                ProxyError::upstream_connect_with_source(host_of(&request.url), e)
            } else {
                ProxyError::network_with_source("上游请求失败", e)
            }
        })?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes_stream().map(|chunk| chunk.map_err(ProxyError::from));

        Ok(UpstreamResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str()
                .map(|h| format_target(h, u.port_or_known_default().unwrap_or(443)))
        })
        .unwrap_or_else(|| "upstream".to_string())
}
