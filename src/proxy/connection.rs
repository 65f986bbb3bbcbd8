//! # 单个连接的处理流程
//!
//! 读请求头、分类、分派到隧道/转发/网关，结束时记录客户端统计。
//! 每个连接只处理一个请求，处理完即关闭。

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::classifier::{Classified, Route};
use super::forwarder::{forward_http, open_tunnel};
use super::http::{BodyDeadline, write_proxy_error};
use super::state::ProxyState;
use super::tunnel::PumpOutcome;
use crate::error::ProxyError;
use crate::logging::{LogComponent, LogStage};
use crate::statistics::RequestKind;
use crate::{ldebug, linfo, lwarn};

/// 单个连接的运行参数
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// 请求标识，贯穿该连接的所有日志
    pub request_id: String,
    /// 客户端地址
    pub client_addr: SocketAddr,
    /// 网关自己的监听地址
    pub local_addr: SocketAddr,
    /// 连接上游超时
    pub connect_timeout: Duration,
    /// 无字节流动的最长时间
    pub idle_timeout: Duration,
    /// 关闭宽限期结束后触发，强制中止还在进行的传输
    pub force_close: CancellationToken,
}

impl ConnectionContext {
    /// 读取请求体时使用的时限
    #[must_use]
    pub fn body_deadline(&self) -> BodyDeadline {
        BodyDeadline {
            idle: self.idle_timeout,
            force_close: self.force_close.clone(),
        }
    }
}

/// 处理一个已接入的连接
pub async fn handle_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    state: ProxyState,
    shutdown: CancellationToken,
    force_close: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let started = Instant::now();
    let ctx = ConnectionContext {
        request_id: Uuid::new_v4().to_string(),
        client_addr,
        local_addr,
        connect_timeout: state.timeouts().connect(),
        idle_timeout: state.timeouts().idle(),
        force_close,
    };
    let mut reader = BufReader::new(stream);

    // 还在等请求头的连接在关闭信号到来时直接断开
    let classified = tokio::select! {
        result = state.classifier.read_and_classify(&mut reader, state.timeouts().header_read()) => result,
        () = shutdown.cancelled() => {
            ldebug!(
                ctx.request_id,
                LogStage::Shutdown,
                LogComponent::Server,
                "idle_connection_closed",
                "Closing connection that had not sent a request",
                client = %client_addr
            );
            return;
        }
    };

    let Classified { head, route } = match classified {
        Ok(Some(classified)) => classified,
        Ok(None) => return,
        Err(e @ ProxyError::ConnectionTimeout { .. }) => {
            ldebug!(
                ctx.request_id,
                LogStage::Accept,
                LogComponent::Server,
                "header_timeout",
                "Request head not received in time",
                client = %client_addr,
                error = %e
            );
            return;
        }
        Err(e) => {
            lwarn!(
                ctx.request_id,
                LogStage::Classify,
                LogComponent::Classifier,
                "malformed_request",
                "Rejecting malformed request",
                client = %client_addr,
                error = %e
            );
            let _ = write_proxy_error(&mut reader, &e).await;
            return;
        }
    };

    let (kind, success) = match route {
        Route::ConnectTunnel { host, port } => {
            let result = open_tunnel(reader, &host, port, &ctx).await;
            match &result {
                Ok(stats) => linfo!(
                    ctx.request_id,
                    LogStage::Tunnel,
                    LogComponent::Tunnel,
                    "tunnel_closed",
                    "Tunnel closed",
                    client = %client_addr,
                    target = %format!("{host}:{port}"),
                    bytes_up = stats.client_to_upstream,
                    bytes_down = stats.upstream_to_client,
                    outcome = ?stats.outcome,
                    elapsed_ms = started.elapsed().as_millis()
                ),
                Err(e) => lwarn!(
                    ctx.request_id,
                    LogStage::Tunnel,
                    LogComponent::Tunnel,
                    "tunnel_failed",
                    "Tunnel could not be established",
                    client = %client_addr,
                    target = %format!("{host}:{port}"),
                    error = %e
                ),
            }
            (RequestKind::Tunnel, result.is_ok())
        }
        Route::ForwardHttp {
            host,
            port,
            origin_form,
        } => {
            let method = head.method.clone();
            let result = forward_http(reader, head, &host, port, &origin_form, &ctx).await;
            match &result {
                Ok(stats) => linfo!(
                    ctx.request_id,
                    LogStage::Forward,
                    LogComponent::Forwarder,
                    "forward_completed",
                    "Request forwarded",
                    client = %client_addr,
                    method = %method,
                    target = %format!("{host}:{port}"),
                    response_bytes = stats.upstream_to_client,
                    elapsed_ms = started.elapsed().as_millis()
                ),
                Err(e) => lwarn!(
                    ctx.request_id,
                    LogStage::Forward,
                    LogComponent::Forwarder,
                    "forward_failed",
                    "Forwarding failed",
                    client = %client_addr,
                    method = %method,
                    target = %format!("{host}:{port}"),
                    error = %e
                ),
            }
            let success = result.is_ok_and(|stats| stats.outcome == PumpOutcome::Completed);
            (RequestKind::Forward, success)
        }
        Route::Gateway { path_and_query } => {
            let result = state
                .gateway
                .handle(&mut reader, &head, &path_and_query, &ctx.request_id, &ctx.body_deadline())
                .await;
            match &result {
                Ok(outcome) => linfo!(
                    ctx.request_id,
                    LogStage::Response,
                    LogComponent::Gateway,
                    "gateway_completed",
                    "Gateway request completed",
                    client = %client_addr,
                    method = %head.method,
                    status = outcome.status,
                    attempts = outcome.attempts,
                    key_id = ?outcome.key_id,
                    elapsed_ms = started.elapsed().as_millis()
                ),
                Err(e) => lwarn!(
                    ctx.request_id,
                    LogStage::Response,
                    LogComponent::Gateway,
                    "gateway_failed",
                    "Gateway request failed",
                    client = %client_addr,
                    method = %head.method,
                    status = e.to_http_response_parts().0.as_u16(),
                    error = %e
                ),
            }
            let success = result.is_ok_and(|outcome| outcome.status < 400);
            (RequestKind::Gateway, success)
        }
    };

    state.stats.record(client_addr.ip(), kind, success);
}
