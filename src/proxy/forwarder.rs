//! # 普通 HTTP 转发与 CONNECT 隧道
//!
//! 每个请求新建一条上游连接，不做连接复用。
//! 两个入口在失败时都会先把错误响应写给客户端，再把错误返回给调用方记录日志。

use std::net::IpAddr;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt};

use super::connection::ConnectionContext;
use super::http::{CONNECT_ESTABLISHED, RequestHead, relay_body, write_proxy_error};
use super::tunnel::{PumpStats, pump, relay_until_eof};
use super::upstream::{connect_tcp, format_target};
use crate::error::{ProxyError, Result};
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};

/// 转发时从请求里去掉的头
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
    "upgrade",
    "te",
];

/// 判断目标是否指向网关自己
fn check_loop(host: &str, port: u16, ctx: &ConnectionContext) -> Result<()> {
    if port != ctx.local_addr.port() {
        return Ok(());
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let targets_self = match host.parse::<IpAddr>() {
        Ok(ip) => ip == ctx.local_addr.ip() || ip.is_loopback() || ip.is_unspecified(),
        Err(_) => host.eq_ignore_ascii_case("localhost"),
    };
    if targets_self {
        return Err(ProxyError::LoopDetected {
            target: format_target(host, port),
        });
    }
    Ok(())
}

async fn fail<S, T>(client: &mut S, error: ProxyError) -> Result<T>
where
    S: AsyncWrite + Unpin,
{
    let _ = write_proxy_error(client, &error).await;
    Err(error)
}

/// 建立 CONNECT 隧道并运行字节泵
pub async fn open_tunnel<S>(mut client: S, host: &str, port: u16, ctx: &ConnectionContext) -> Result<PumpStats>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Err(e) = check_loop(host, port, ctx) {
        return fail(&mut client, e).await;
    }

    let upstream = match connect_tcp(host, port, ctx.connect_timeout).await {
        Ok(upstream) => upstream,
        Err(e) => return fail(&mut client, e).await,
    };

    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;
    ldebug!(
        ctx.request_id,
        LogStage::Tunnel,
        LogComponent::Tunnel,
        "tunnel_established",
        "Tunnel established",
        target = %format_target(host, port)
    );

    // 客户端在请求头之后立即发来的字节还在 BufReader 里，泵会先读到它们
    Ok(pump(client, upstream, ctx.idle_timeout, ctx.force_close.clone()).await)
}

/// 把请求改写为 origin-form 后转发，并原样回传响应直到上游关闭
pub async fn forward_http<S>(
    mut client: S,
    mut head: RequestHead,
    host: &str,
    port: u16,
    origin_form: &str,
    ctx: &ConnectionContext,
) -> Result<PumpStats>
where
    S: AsyncBufRead + AsyncWrite + Unpin + Send,
{
    if let Err(e) = check_loop(host, port, ctx) {
        return fail(&mut client, e).await;
    }
    let framing = match head.body_framing() {
        Ok(framing) => framing,
        Err(e) => return fail(&mut client, e).await,
    };

    let mut upstream = match connect_tcp(host, port, ctx.connect_timeout).await {
        Ok(upstream) => upstream,
        Err(e) => return fail(&mut client, e).await,
    };

    rewrite_for_origin(&mut head, host, port, origin_form);
    upstream.write_all(&head.to_bytes()).await?;
    let sent = match relay_body(&mut client, &mut upstream, framing, &ctx.body_deadline()).await {
        Ok(sent) => sent,
        Err(e) => return fail(&mut client, e).await,
    };
    upstream.flush().await?;

    let (received, outcome) =
        relay_until_eof(&mut upstream, &mut client, ctx.idle_timeout, &ctx.force_close).await;

    ldebug!(
        ctx.request_id,
        LogStage::Forward,
        LogComponent::Forwarder,
        "forward_finished",
        "Forwarded request finished",
        target = %format_target(host, port),
        method = %head.method,
        request_body_bytes = sent,
        response_bytes = received
    );

    Ok(PumpStats {
        client_to_upstream: sent,
        upstream_to_client: received,
        outcome,
    })
}

/// 请求行改为 origin-form，去掉逐跳头，补齐 Host，强制短连接
fn rewrite_for_origin(head: &mut RequestHead, host: &str, port: u16, origin_form: &str) {
    // Connection 里点名的头同样是逐跳头
    let named: Vec<String> = head
        .header("connection")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    for name in named.iter().map(String::as_str).chain(STRIPPED_REQUEST_HEADERS.iter().copied()) {
        if !name.eq_ignore_ascii_case("transfer-encoding") && !name.eq_ignore_ascii_case("content-length") {
            head.remove_header(name);
        }
    }

    if head.header("host").is_none() {
        let authority = if port == 80 {
            format_target(host, port).trim_end_matches(":80").to_string()
        } else {
            format_target(host, port)
        };
        head.headers.insert(0, ("Host".to_string(), authority));
    }
    head.set_header("Connection", "close");
    head.target = origin_form.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::http::read_request_head;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn ctx(local: &str) -> ConnectionContext {
        ConnectionContext {
            request_id: "test".to_string(),
            client_addr: "192.168.1.20:50000".parse().unwrap(),
            local_addr: local.parse().unwrap(),
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(5),
            force_close: CancellationToken::new(),
        }
    }

    #[test]
    fn test_loop_detection() {
        let ctx = ctx("192.168.1.10:8888");
        assert!(check_loop("192.168.1.10", 8888, &ctx).is_err());
        assert!(check_loop("127.0.0.1", 8888, &ctx).is_err());
        assert!(check_loop("localhost", 8888, &ctx).is_err());
        assert!(check_loop("192.168.1.10", 80, &ctx).is_ok());
        assert!(check_loop("example.com", 8888, &ctx).is_ok());
        // 客户端自己的地址不算循环
        assert!(check_loop("192.168.1.20", 8080, &ctx).is_ok());
    }

    #[test]
    fn test_rewrite_for_origin() {
        let mut head = RequestHead {
            method: "GET".to_string(),
            target: "http://example.com/a?b=1".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![
                ("Proxy-Connection".to_string(), "keep-alive".to_string()),
                ("Proxy-Authorization".to_string(), "Basic xyz".to_string()),
                ("Connection".to_string(), "keep-alive, X-Private".to_string()),
                ("X-Private".to_string(), "1".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ],
        };
        rewrite_for_origin(&mut head, "example.com", 80, "/a?b=1");

        assert_eq!(head.target, "/a?b=1");
        assert_eq!(
            head.headers,
            vec![
                ("Host".to_string(), "example.com".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
                ("Connection".to_string(), "close".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_forward_http_end_to_end() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr: SocketAddr = origin.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = origin.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let head = read_request_head(&mut reader).await.unwrap().unwrap();
            let mut body = vec![0u8; 5];
            reader.read_exact(&mut body).await.unwrap();
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            (head, body)
        });

        let (client_side, proxy_side) = tokio::io::duplex(4096);
        let raw = format!(
            "POST http://127.0.0.1:{}/submit HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 5\r\nProxy-Connection: keep-alive\r\n\r\nhello",
            origin_addr.port(),
            origin_addr.port()
        );
        let (mut client_read, mut client_write) = tokio::io::split(client_side);
        client_write.write_all(raw.as_bytes()).await.unwrap();

        let mut proxy_reader = BufReader::new(proxy_side);
        let head = read_request_head(&mut proxy_reader).await.unwrap().unwrap();
        let stats = forward_http(
            proxy_reader,
            head,
            "127.0.0.1",
            origin_addr.port(),
            "/submit",
            &ctx("127.0.0.1:8888"),
        )
        .await
        .unwrap();

        let mut response = Vec::new();
        client_read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok".to_vec());
        assert_eq!(stats.client_to_upstream, 5);

        let (upstream_head, body) = server.await.unwrap();
        assert_eq!(upstream_head.target, "/submit");
        assert_eq!(upstream_head.header("connection"), Some("close"));
        assert!(upstream_head.header("proxy-connection").is_none());
        assert_eq!(body, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_tunnel_connect_refused_returns_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut client_side, proxy_side) = tokio::io::duplex(4096);
        let err = open_tunnel(proxy_side, "127.0.0.1", port, &ctx("127.0.0.1:8888"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnect { .. }));

        let mut response = Vec::new();
        client_side.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
    }
}
