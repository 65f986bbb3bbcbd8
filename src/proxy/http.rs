//! # HTTP/1.x 报文头与报文体处理
//!
//! 只做代理需要的那部分：用 httparse 解析请求头和 chunk 尺寸行，
//! 按 Content-Length 或 chunked 读取/原样转发请求体，写网关自己生成的错误响应。

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, Result};
use crate::{ensure_wellformed, malformed_error};

/// 请求头总字节上限
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
/// 请求头个数上限
pub const MAX_HEADERS: usize = 100;
/// chunk 尺寸行、trailer 行的长度上限
const MAX_LINE_BYTES: usize = 8 * 1024;
/// 转发请求体时的单次读写缓冲
const COPY_BUF_BYTES: usize = 16 * 1024;

/// 隧道建立成功的响应
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// 逐跳头，转发时不向下一跳传递
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// 解析后的请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// 方法
    pub method: String,
    /// 请求目标（origin-form / absolute-form / authority-form）
    pub target: String,
    /// 协议版本
    pub version: String,
    /// 按原顺序保存的头
    pub headers: Vec<(String, String)>,
}

/// 报文体的定界方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// 没有报文体
    Empty,
    /// 固定长度
    Length(u64),
    /// 分块传输
    Chunked,
}

impl RequestHead {
    /// 取第一个同名头（不区分大小写）
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 删除所有同名头
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// 设置头，已有同名头时全部替换
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    /// 请求体定界方式
    pub fn body_framing(&self) -> Result<BodyFraming> {
        let chunked = self
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("transfer-encoding"))
            .flat_map(|(_, v)| v.split(','))
            .map(str::trim)
            .next_back()
            .is_some_and(|last| last.eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(BodyFraming::Chunked);
        }
        ensure_wellformed!(
            self.header("transfer-encoding").is_none(),
            "不支持的 Transfer-Encoding"
        );

        let mut lengths = self
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.trim().parse::<u64>());
        match lengths.next() {
            None => Ok(BodyFraming::Empty),
            Some(Ok(first)) => {
                for other in lengths {
                    ensure_wellformed!(other == Ok(first), "Content-Length 冲突");
                }
                Ok(if first == 0 {
                    BodyFraming::Empty
                } else {
                    BodyFraming::Length(first)
                })
            }
            Some(Err(_)) => Err(malformed_error!("Content-Length 无效")),
        }
    }

    /// 序列化为报文头字节（含结尾空行）
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// 读请求体时的空闲时限与强制关闭信号
#[derive(Debug, Clone)]
pub struct BodyDeadline {
    /// 两次收到数据之间允许的最长间隔
    pub idle: Duration,
    /// 关闭宽限期结束后触发
    pub force_close: CancellationToken,
}

impl BodyDeadline {
    async fn guard<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            () = self.force_close.cancelled() => {
                Err(ProxyError::connection_timeout("网关正在关闭，请求体读取中止", 0))
            }
            result = tokio::time::timeout(self.idle, operation) => result.unwrap_or_else(|_| {
                Err(ProxyError::connection_timeout(
                    format!("{} 秒内没有收到请求体数据", self.idle.as_secs()),
                    self.idle.as_secs(),
                ))
            }),
        }
    }
}

/// 读一行（含换行符），超过 `limit` 视为格式错误；EOF 返回空
async fn read_line_limited<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    ensure_wellformed!(read <= limit, "行过长");
    Ok(line)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl RequestHead {
    fn from_parsed(request: &httparse::Request<'_, '_>) -> Result<Self> {
        let (Some(method), Some(target), Some(minor)) = (request.method, request.path, request.version) else {
            return Err(malformed_error!("请求行不完整"));
        };
        let headers = request
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();
        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: format!("HTTP/1.{minor}"),
            headers,
        })
    }
}

/// 读取并解析请求头
///
/// 连接在发出任何字节前关闭时返回 `Ok(None)`。只消费请求头本身，
/// 紧随其后的字节留在 `reader` 里。
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffered: Vec<u8> = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buffered.is_empty() {
                return Ok(None);
            }
            return Err(malformed_error!("请求头未结束连接即关闭"));
        }
        let previous = buffered.len();
        let take = available.len().min(MAX_HEAD_BYTES + 1 - previous);
        buffered.extend_from_slice(&available[..take]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buffered) {
            Ok(httparse::Status::Complete(head_len)) => {
                ensure_wellformed!(head_len <= MAX_HEAD_BYTES, "请求头过大");
                let head = RequestHead::from_parsed(&request)?;
                reader.consume(head_len - previous);
                return Ok(Some(head));
            }
            Ok(httparse::Status::Partial) => {
                reader.consume(take);
                ensure_wellformed!(buffered.len() <= MAX_HEAD_BYTES, "请求头过大");
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(malformed_error!("请求头数量超过 {}", MAX_HEADERS));
            }
            Err(e) => return Err(malformed_error!("请求头无法解析: {}", e)),
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    match httparse::parse_chunk_size(line) {
        Ok(httparse::Status::Complete((_, size))) => Ok(size),
        Ok(httparse::Status::Partial) => Err(malformed_error!("chunk 尺寸行不完整")),
        Err(_) => Err(malformed_error!(
            "chunk 尺寸无效: {}",
            String::from_utf8_lossy(trim_line_end(line))
        )),
    }
}

/// 从 `reader` 搬运恰好 `length` 字节到 `writer`，每次读写都受 `deadline` 约束
async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, length: u64, deadline: &BodyDeadline) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = length;
    let mut buf = vec![0u8; usize::try_from(length).unwrap_or(COPY_BUF_BYTES).min(COPY_BUF_BYTES)];
    while remaining > 0 {
        let want = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
        let read = deadline
            .guard(async { reader.read(&mut buf[..want]).await.map_err(ProxyError::from) })
            .await?;
        ensure_wellformed!(read > 0, "请求体不完整");
        deadline
            .guard(async { writer.write_all(&buf[..read]).await.map_err(ProxyError::from) })
            .await?;
        remaining -= read as u64;
    }
    Ok(length)
}

/// 完整读取请求体（网关路径需要在故障转移时重放）
pub async fn read_body<R>(
    reader: &mut R,
    framing: BodyFraming,
    limit: usize,
    deadline: &BodyDeadline,
) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let too_large = || ProxyError::PayloadTooLarge {
        message: format!("请求体超过 {limit} 字节"),
        limit,
    };

    match framing {
        BodyFraming::Empty => Ok(Bytes::new()),
        BodyFraming::Length(length) => {
            if usize::try_from(length).ok().is_none_or(|length| length > limit) {
                return Err(too_large());
            }
            let mut body = Vec::new();
            copy_exact(reader, &mut body, length, deadline).await?;
            Ok(Bytes::from(body))
        }
        BodyFraming::Chunked => {
            let mut body = Vec::new();
            loop {
                let size_line = deadline.guard(read_line_limited(reader, MAX_LINE_BYTES)).await?;
                let size = parse_chunk_size(&size_line)?;
                if size == 0 {
                    skip_trailers(reader, deadline).await?;
                    break;
                }
                if usize::try_from(size)
                    .ok()
                    .is_none_or(|size| body.len().saturating_add(size) > limit)
                {
                    return Err(too_large());
                }
                copy_exact(reader, &mut body, size, deadline).await?;
                expect_crlf(reader, deadline).await?;
            }
            Ok(Bytes::from(body))
        }
    }
}

async fn skip_trailers<R>(reader: &mut R, deadline: &BodyDeadline) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    for _ in 0..=MAX_HEADERS {
        let line = deadline.guard(read_line_limited(reader, MAX_LINE_BYTES)).await?;
        ensure_wellformed!(line.ends_with(b"\n"), "trailer 不完整");
        if trim_line_end(&line).is_empty() {
            return Ok(());
        }
    }
    Err(malformed_error!("trailer 过多"))
}

async fn expect_crlf<R>(reader: &mut R, deadline: &BodyDeadline) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let line = deadline.guard(read_line_limited(reader, 2)).await?;
    ensure_wellformed!(trim_line_end(&line).is_empty() && line.ends_with(b"\n"), "chunk 结尾缺少 CRLF");
    Ok(())
}

/// 把请求体原样转发给上游，保留 chunked 编码，返回转发的字节数
pub async fn relay_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
    deadline: &BodyDeadline,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(0),
        BodyFraming::Length(length) => copy_exact(reader, writer, length, deadline).await,
        BodyFraming::Chunked => {
            let mut total = 0u64;
            loop {
                let size_line = deadline.guard(read_line_limited(reader, MAX_LINE_BYTES)).await?;
                let size = parse_chunk_size(&size_line)?;
                writer.write_all(&size_line).await?;
                total += size_line.len() as u64;

                if size == 0 {
                    loop {
                        let line = deadline.guard(read_line_limited(reader, MAX_LINE_BYTES)).await?;
                        ensure_wellformed!(line.ends_with(b"\n"), "trailer 不完整");
                        writer.write_all(&line).await?;
                        total += line.len() as u64;
                        if trim_line_end(&line).is_empty() {
                            return Ok(total);
                        }
                    }
                }

                // 数据加结尾 CRLF
                let framed = size.checked_add(2).ok_or_else(|| malformed_error!("chunk 尺寸无效"))?;
                total += copy_exact(reader, writer, framed, deadline).await?;
            }
        }
    }
}

/// 网关自身产生的错误响应体
#[must_use]
pub fn error_body(status: StatusCode, code: &str, message: &str) -> Vec<u8> {
    serde_json::json!({
        "error": {
            "code": status.as_u16(),
            "message": message,
            "status": code,
        }
    })
    .to_string()
    .into_bytes()
}

/// 写 JSON 错误响应并声明关闭连接
pub async fn write_error_response<W>(
    writer: &mut W,
    status: StatusCode,
    code: &str,
    message: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = error_body(status, code, message);
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown"),
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// 按错误类型写响应
pub async fn write_proxy_error<W>(writer: &mut W, error: &ProxyError) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (status, code) = error.to_http_response_parts();
    write_error_response(writer, status, code, &error.root().to_string()).await
}
