//! # AI 网关路由
//!
//! 读完整个请求体后按密钥顺序尝试上游：成功时计入用量并流式回传，
//! 密钥失效或配额耗尽时换下一把，其它结果原样交给客户端。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use futures::StreamExt;
use reqwest::StatusCode;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::policy::{self, AttemptVerdict, INSPECT_BODY_LIMIT};
use super::rewrite::build_upstream_request;
use crate::config::{GatewayConfig, KeyConfigStore};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::proxy::http::{BodyDeadline, HOP_BY_HOP_HEADERS, RequestHead, read_body, write_proxy_error};
use crate::proxy::upstream::{GatewayUpstream, UpstreamResponse};
use crate::{ldebug, linfo, lwarn};

/// 路由运行参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// 进程级开关
    pub enabled: bool,
    /// 密钥未配置 `api_base` 时使用的上游地址
    pub upstream_base: String,
    /// 请求体上限
    pub max_body_bytes: usize,
}

impl From<&GatewayConfig> for GatewaySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            enabled: config.enabled,
            upstream_base: config.upstream_base.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// 一次网关请求的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOutcome {
    /// 回给客户端的状态码
    pub status: u16,
    /// 最终使用的密钥
    pub key_id: Option<String>,
    /// 尝试过的密钥数
    pub attempts: usize,
    /// 回传的响应体字节数
    pub body_bytes: u64,
}

/// AI 网关路由
pub struct GatewayRouter {
    key_store: Arc<KeyConfigStore>,
    upstream: Arc<dyn GatewayUpstream>,
    settings: GatewaySettings,
}

impl std::fmt::Debug for GatewayRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRouter")
            .field("key_store", &self.key_store)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl GatewayRouter {
    /// 创建路由
    pub fn new(key_store: Arc<KeyConfigStore>, upstream: Arc<dyn GatewayUpstream>, settings: GatewaySettings) -> Self {
        Self {
            key_store,
            upstream,
            settings,
        }
    }

    /// 处理一次网关请求；出错时错误响应已写给客户端
    pub async fn handle<S>(
        &self,
        client: &mut S,
        head: &RequestHead,
        path_and_query: &str,
        request_id: &str,
        deadline: &BodyDeadline,
    ) -> Result<GatewayOutcome>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        match self.serve(client, head, path_and_query, request_id, deadline).await {
            Ok(outcome) => Ok(outcome),
            Err(ServeError::BeforeResponse(e)) => {
                let _ = write_proxy_error(client, &e).await;
                Err(e)
            }
            Err(ServeError::DuringResponse(e)) => Err(e),
        }
    }

    async fn serve<S>(
        &self,
        client: &mut S,
        head: &RequestHead,
        path_and_query: &str,
        request_id: &str,
        deadline: &BodyDeadline,
    ) -> std::result::Result<GatewayOutcome, ServeError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        if !self.settings.enabled || !self.key_store.is_enabled() {
            return Err(ServeError::BeforeResponse(ProxyError::GatewayDisabled));
        }

        let framing = head.body_framing().map_err(ServeError::BeforeResponse)?;
        let body = read_body(client, framing, self.settings.max_body_bytes, deadline)
            .await
            .map_err(ServeError::BeforeResponse)?;

        let today = today();
        let budget = self.key_store.snapshot().len();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut last_failure: Option<u16> = None;

        while attempted.len() < budget {
            let Some(key) = self.key_store.select_key(&attempted, today) else {
                break;
            };
            attempted.insert(key.id.clone());

            let request = match build_upstream_request(head, path_and_query, &body, &key, &self.settings.upstream_base) {
                Ok(request) => request,
                Err(e) => {
                    lwarn!(
                        request_id,
                        LogStage::Scheduling,
                        LogComponent::Gateway,
                        "key_skipped",
                        "Key has an unusable upstream address, trying next key",
                        key_id = %key.id,
                        error = %e
                    );
                    continue;
                }
            };
            ldebug!(
                request_id,
                LogStage::UpstreamRequest,
                LogComponent::Gateway,
                "upstream_attempt",
                "Sending request upstream",
                key_id = %key.id,
                key = %key.masked_key(),
                model = %key.model,
                attempt = attempted.len()
            );

            let mut response = self.upstream.send(request).await.map_err(ServeError::BeforeResponse)?;
            let status = response.status;
            let inspected = if policy::needs_body(status) {
                Some(
                    response
                        .buffer_prefix(INSPECT_BODY_LIMIT)
                        .await
                        .map_err(ServeError::BeforeResponse)?,
                )
            } else {
                None
            };

            match policy::evaluate(status, inspected.as_deref()) {
                AttemptVerdict::Failover => {
                    lwarn!(
                        request_id,
                        LogStage::Scheduling,
                        LogComponent::Gateway,
                        "key_failover",
                        "Key rejected upstream, trying next key",
                        key_id = %key.id,
                        status = status.as_u16()
                    );
                    last_failure = Some(status.as_u16());
                }
                verdict => {
                    if verdict == AttemptVerdict::Success {
                        let used = self.key_store.usage().increment(&key.id, today);
                        linfo!(
                            request_id,
                            LogStage::Usage,
                            LogComponent::Gateway,
                            "usage_recorded",
                            "Request served",
                            key_id = %key.id,
                            status = status.as_u16(),
                            used_today = used,
                            daily_limit = key.daily_limit
                        );
                    }
                    let body_bytes = write_upstream_response(client, response, &head.method)
                        .await
                        .map_err(ServeError::DuringResponse)?;
                    return Ok(GatewayOutcome {
                        status: status.as_u16(),
                        key_id: Some(key.id),
                        attempts: attempted.len(),
                        body_bytes,
                    });
                }
            }
        }

        let message = match last_failure {
            Some(status) => format!("已尝试 {} 个密钥，最后一次上游返回 {status}", attempted.len()),
            None => "没有可用的密钥".to_string(),
        };
        lwarn!(
            request_id,
            LogStage::Scheduling,
            LogComponent::Gateway,
            "keys_exhausted",
            "No usable key left for this request",
            attempts = attempted.len(),
            configured = budget
        );
        Err(ServeError::BeforeResponse(ProxyError::all_keys_exhausted(message)))
    }
}

/// 响应头写出前的错误要回给客户端，写出之后只能断开连接
enum ServeError {
    BeforeResponse(ProxyError),
    DuringResponse(ProxyError),
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn has_no_body(method: &str, status: StatusCode) -> bool {
    method.eq_ignore_ascii_case("HEAD")
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// 回写上游响应：有 Content-Length 时按长度，否则改为 chunked
async fn write_upstream_response<W>(writer: &mut W, mut response: UpstreamResponse, method: &str) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let status = response.status;
    let no_body = has_no_body(method, status);
    let length = response
        .header("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok());
    let chunked = !no_body && length.is_none();

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    for (name, value) in &response.headers {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || lower == "content-length" {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(length) = length {
        head.push_str(&format!("Content-Length: {length}\r\n"));
    } else if chunked {
        head.push_str("Transfer-Encoding: chunked\r\n");
    }
    head.push_str("Connection: close\r\n\r\n");
    writer.write_all(head.as_bytes()).await?;

    let mut written = 0u64;
    if !no_body {
        while let Some(chunk) = response.body.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            if chunked {
                writer.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
                writer.write_all(&chunk).await?;
                writer.write_all(b"\r\n").await?;
            } else {
                writer.write_all(&chunk).await?;
            }
            writer.flush().await?;
            written += chunk.len() as u64;
        }
        if chunked {
            writer.write_all(b"0\r\n\r\n").await?;
        }
    }
    writer.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeyConfig, EnvOverrides};
    use crate::proxy::upstream::UpstreamRequest;
    use crate::usage::UsageStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, BufReader};
    use tokio_util::sync::CancellationToken;

    /// 按密钥返回预设状态码的上游
    struct ScriptedUpstream {
        responses: Vec<(&'static str, u16, &'static str)>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GatewayUpstream for ScriptedUpstream {
        async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
            self.seen.lock().unwrap().push(request.url.clone());
            let (_, status, body) = self
                .responses
                .iter()
                .find(|(key, _, _)| request.url.ends_with(&format!("key={key}")))
                .copied()
                .unwrap_or(("", 500, "unexpected"));
            Ok(UpstreamResponse::from_bytes(
                StatusCode::from_u16(status).unwrap(),
                vec![("content-type".to_string(), "application/json".to_string())],
                body,
            ))
        }
    }

    fn store_with(keys: &[ApiKeyConfig]) -> (tempfile::TempDir, Arc<KeyConfigStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, serde_json::to_vec(keys).unwrap()).unwrap();
        let store = KeyConfigStore::open(
            path,
            Arc::new(UsageStore::in_memory(30)),
            Duration::from_secs(3600),
            EnvOverrides::default(),
        );
        (dir, Arc::new(store))
    }

    fn router(store: Arc<KeyConfigStore>, upstream: Arc<ScriptedUpstream>) -> GatewayRouter {
        GatewayRouter::new(
            store,
            upstream,
            GatewaySettings {
                enabled: true,
                upstream_base: "https://upstream.test".to_string(),
                max_body_bytes: 1024,
            },
        )
    }

    fn deadline() -> BodyDeadline {
        BodyDeadline {
            idle: Duration::from_secs(5),
            force_close: CancellationToken::new(),
        }
    }

    /// 收到 k1 的请求时改写密钥文件，其余交给脚本化上游
    struct ReloadingUpstream {
        store: Arc<KeyConfigStore>,
        replacement: Vec<ApiKeyConfig>,
        inner: ScriptedUpstream,
    }

    #[async_trait]
    impl GatewayUpstream for ReloadingUpstream {
        async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
            if request.url.ends_with("key=k1") {
                self.store.save_keys(true, &self.replacement).unwrap();
            }
            self.inner.send(request).await
        }
    }

    fn gateway_head(content_length: usize) -> RequestHead {
        RequestHead {
            method: "POST".to_string(),
            target: "/v1beta/models/x:generateContent".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Content-Length".to_string(), content_length.to_string())],
        }
    }

    async fn run(router: &GatewayRouter, body: &'static [u8]) -> (Result<GatewayOutcome>, String) {
        let (client, proxy_side) = tokio::io::duplex(64 * 1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(body).await.unwrap();

        let mut proxy_side = BufReader::new(proxy_side);
        let head = gateway_head(body.len());
        let result = router
            .handle(&mut proxy_side, &head, "/v1beta/models/x:generateContent", "test", &deadline())
            .await;
        drop(proxy_side);

        let mut response = String::new();
        client_read.read_to_string(&mut response).await.unwrap();
        (result, response)
    }

    #[tokio::test]
    async fn test_failover_to_second_key() {
        let (_dir, store) = store_with(&[ApiKeyConfig::new("k1", "m", 10), ApiKeyConfig::new("k2", "m", 10)]);
        let upstream = Arc::new(ScriptedUpstream {
            responses: vec![("k1", 429, "{}"), ("k2", 200, "{\"ok\":true}")],
            seen: Mutex::new(Vec::new()),
        });
        let router = router(Arc::clone(&store), Arc::clone(&upstream));

        let (result, response) = run(&router, b"{}").await;
        let outcome = result.unwrap();

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.attempts, 2);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("{\"ok\":true}"));

        let today = today();
        let k1 = ApiKeyConfig::derive_id("k1", "m");
        let k2 = ApiKeyConfig::derive_id("k2", "m");
        assert_eq!(store.usage().count_for(&k1, today), 0);
        assert_eq!(store.usage().count_for(&k2, today), 1);
        assert_eq!(upstream.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_all_keys_rejected_returns_503() {
        let (_dir, store) = store_with(&[ApiKeyConfig::new("k1", "m", 10), ApiKeyConfig::new("k2", "m", 10)]);
        let upstream = Arc::new(ScriptedUpstream {
            responses: vec![("k1", 401, "{}"), ("k2", 403, "{}")],
            seen: Mutex::new(Vec::new()),
        });
        let router = router(Arc::clone(&store), upstream);

        let (result, response) = run(&router, b"{}").await;
        assert!(matches!(result.unwrap_err(), ProxyError::AllKeysExhausted { .. }));
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(store.usage().is_empty());
    }

    #[tokio::test]
    async fn test_other_client_error_is_passed_through() {
        let (_dir, store) = store_with(&[ApiKeyConfig::new("k1", "m", 10), ApiKeyConfig::new("k2", "m", 10)]);
        let upstream = Arc::new(ScriptedUpstream {
            responses: vec![("k1", 400, "{\"error\":{\"message\":\"Invalid JSON payload\"}}")],
            seen: Mutex::new(Vec::new()),
        });
        let router = router(Arc::clone(&store), Arc::clone(&upstream));

        let (result, response) = run(&router, b"{}").await;
        assert_eq!(result.unwrap().status, 400);
        assert!(response.contains("Invalid JSON payload"));
        assert_eq!(upstream.seen.lock().unwrap().len(), 1);
        assert!(store.usage().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_daily_limit_skips_key() {
        let (_dir, store) = store_with(&[ApiKeyConfig::new("k1", "m", 1), ApiKeyConfig::new("k2", "m", 10)]);
        let k1 = ApiKeyConfig::derive_id("k1", "m");
        store.usage().increment(&k1, today());
        let upstream = Arc::new(ScriptedUpstream {
            responses: vec![("k1", 200, "one"), ("k2", 200, "two")],
            seen: Mutex::new(Vec::new()),
        });
        let router = router(store, upstream);

        let (result, response) = run(&router, b"").await;
        assert_eq!(result.unwrap().attempts, 1);
        assert!(response.ends_with("two"));
    }

    #[tokio::test]
    async fn test_no_keys_returns_503() {
        let (_dir, store) = store_with(&[]);
        let upstream = Arc::new(ScriptedUpstream {
            responses: Vec::new(),
            seen: Mutex::new(Vec::new()),
        });
        let router = router(store, upstream);

        let (result, response) = run(&router, b"").await;
        assert!(matches!(result.unwrap_err(), ProxyError::AllKeysExhausted { .. }));
        assert!(response.contains("\"code\":503"));
    }

    #[tokio::test]
    async fn test_disabled_gateway_returns_400() {
        let (_dir, store) = store_with(&[ApiKeyConfig::new("k1", "m", 10)]);
        let upstream = Arc::new(ScriptedUpstream {
            responses: Vec::new(),
            seen: Mutex::new(Vec::new()),
        });
        let mut router = router(store, upstream);
        router.settings.enabled = false;

        let (result, response) = run(&router, b"").await;
        assert!(matches!(result.unwrap_err(), ProxyError::GatewayDisabled));
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_oversized_body_returns_413() {
        let (_dir, store) = store_with(&[ApiKeyConfig::new("k1", "m", 10)]);
        let upstream = Arc::new(ScriptedUpstream {
            responses: Vec::new(),
            seen: Mutex::new(Vec::new()),
        });
        let router = router(store, upstream);

        let (result, response) = run(&router, &[b'x'; 2048]).await;
        assert!(matches!(result.unwrap_err(), ProxyError::PayloadTooLarge { .. }));
        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn test_key_removed_during_failover_is_not_tried() {
        let (_dir, store) = store_with(&[ApiKeyConfig::new("k1", "m", 10), ApiKeyConfig::new("k2", "m", 10)]);
        let upstream = Arc::new(ReloadingUpstream {
            store: Arc::clone(&store),
            replacement: vec![ApiKeyConfig::new("k1", "m", 10), ApiKeyConfig::new("k3", "m", 10)],
            inner: ScriptedUpstream {
                responses: vec![("k1", 429, "{}"), ("k2", 200, "two"), ("k3", 200, "three")],
                seen: Mutex::new(Vec::new()),
            },
        });
        let router = GatewayRouter::new(
            Arc::clone(&store),
            Arc::clone(&upstream) as Arc<dyn GatewayUpstream>,
            GatewaySettings {
                enabled: true,
                upstream_base: "https://upstream.test".to_string(),
                max_body_bytes: 1024,
            },
        );

        let (result, response) = run(&router, b"{}").await;
        let outcome = result.unwrap();

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.key_id, Some(ApiKeyConfig::derive_id("k3", "m")));
        assert!(response.ends_with("three"));
        let seen = upstream.inner.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|url| !url.ends_with("key=k2")), "{seen:?}");
        assert_eq!(store.usage().count_for(&ApiKeyConfig::derive_id("k3", "m"), today()), 1);
    }

    #[tokio::test]
    async fn test_key_with_bad_api_base_is_skipped() {
        let mut broken = ApiKeyConfig::new("k1", "m", 10);
        broken.api_base = Some("not a url".to_string());
        let (_dir, store) = store_with(&[broken, ApiKeyConfig::new("k2", "m", 10)]);
        let upstream = Arc::new(ScriptedUpstream {
            responses: vec![("k2", 200, "two")],
            seen: Mutex::new(Vec::new()),
        });
        let router = router(store, Arc::clone(&upstream));

        let (result, response) = run(&router, b"{}").await;
        let outcome = result.unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.attempts, 2);
        assert!(response.ends_with("two"));
        assert_eq!(upstream.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_body_returns_504() {
        let (_dir, store) = store_with(&[ApiKeyConfig::new("k1", "m", 10)]);
        let upstream = Arc::new(ScriptedUpstream {
            responses: vec![("k1", 200, "{}")],
            seen: Mutex::new(Vec::new()),
        });
        let router = router(store, Arc::clone(&upstream));

        let (client, proxy_side) = tokio::io::duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"{").await.unwrap();

        let mut proxy_side = BufReader::new(proxy_side);
        let deadline = BodyDeadline {
            idle: Duration::from_millis(200),
            force_close: CancellationToken::new(),
        };
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            router.handle(&mut proxy_side, &gateway_head(10), "/v1beta/models/x:generateContent", "test", &deadline),
        )
        .await
        .expect("stalled body must not hold the connection");
        drop(proxy_side);

        assert!(matches!(result.unwrap_err(), ProxyError::ConnectionTimeout { .. }));
        let mut response = String::new();
        client_read.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"), "{response}");
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_length_is_rechunked() {
        let response = UpstreamResponse {
            status: StatusCode::OK,
            headers: vec![("transfer-encoding".to_string(), "chunked".to_string())],
            body: Box::pin(futures::stream::iter(vec![
                Ok::<_, ProxyError>(Bytes::from_static(b"data: 1\n\n")),
                Ok(Bytes::from_static(b"data: 2\n\n")),
            ])),
        };
        let mut out = Vec::new();
        let written = write_upstream_response(&mut out, response, "POST").await.unwrap();
        assert_eq!(written, 18);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n9\r\ndata: 1\n\n\r\n9\r\ndata: 2\n\n\r\n0\r\n\r\n"
        );
    }
}
