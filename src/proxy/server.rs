//! # 连接接入与监管
//!
//! 单端口监听；连接数达到上限时直接关闭新连接，不排队。
//! 关闭时先停止接入，等在途连接在宽限期内结束，超时后强制中止剩余传输。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::handle_connection;
use super::state::ProxyState;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror, linfo, lwarn};

/// 强制关闭后等待连接任务退出的上限
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// 并发连接名额，克隆后可在服务器之外查询在途连接数
#[derive(Debug, Clone)]
pub struct ConnectionLimit {
    max: usize,
    permits: Arc<Semaphore>,
}

impl ConnectionLimit {
    fn new(max: usize) -> Self {
        Self {
            max,
            permits: Arc::new(Semaphore::new(max)),
        }
    }

    /// 名额上限
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    /// 当前占用名额的连接数
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.max.saturating_sub(self.permits.available_permits())
    }

    fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }
}

/// 网关服务器
#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: ProxyState,
    limit: ConnectionLimit,
    tracker: TaskTracker,
    force_close: CancellationToken,
    shutdown_grace: Duration,
}

impl ProxyServer {
    /// 绑定监听地址
    pub async fn bind(addr: SocketAddr, state: ProxyState, max_connections: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::server_start_with_source(format!("无法监听 {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::server_start_with_source("无法获取监听地址", e))?;
        let shutdown_grace = state.timeouts().shutdown_grace();

        Ok(Self {
            listener,
            local_addr,
            state,
            limit: ConnectionLimit::new(max_connections),
            tracker: TaskTracker::new(),
            force_close: CancellationToken::new(),
            shutdown_grace,
        })
    }

    /// 实际监听地址（端口为 0 时由系统分配）
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 当前在途连接数
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.limit.live_connections()
    }

    /// 连接名额的共享句柄
    #[must_use]
    pub fn connection_limit(&self) -> ConnectionLimit {
        self.limit.clone()
    }

    /// 接入循环，`shutdown` 触发后优雅关闭并返回
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Server,
            "server_listening",
            "Gateway listening",
            addr = %self.local_addr,
            max_connections = self.limit.max()
        );

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, client_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // 文件描述符耗尽之类的错误，稍等再继续
                    lerror!(
                        "system",
                        LogStage::Accept,
                        LogComponent::Server,
                        "accept_failed",
                        "Failed to accept connection",
                        error = %e
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let Some(permit) = self.limit.try_admit() else {
                let rejected = ProxyError::AdmissionRejected {
                    max_connections: self.limit.max(),
                };
                lwarn!(
                    "system",
                    LogStage::Accept,
                    LogComponent::Server,
                    "admission_rejected",
                    "Connection limit reached, dropping connection",
                    client = %client_addr,
                    error = %rejected
                );
                drop(stream);
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                ldebug!(
                    "system",
                    LogStage::Accept,
                    LogComponent::Server,
                    "set_nodelay_failed",
                    "Failed to set TCP_NODELAY",
                    client = %client_addr,
                    error = %e
                );
            }
            let state = self.state.clone();
            let shutdown = shutdown.clone();
            let force_close = self.force_close.clone();
            let local_addr = self.local_addr;
            self.tracker.spawn(async move {
                handle_connection(stream, client_addr, local_addr, state, shutdown, force_close).await;
                drop(permit);
            });
        }

        drop(self.listener);
        self.tracker.close();
        let in_flight = self.tracker.len();
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Server,
            "draining",
            "Stopped accepting, draining connections",
            in_flight = in_flight,
            live_connections = self.limit.live_connections(),
            grace_secs = self.shutdown_grace.as_secs()
        );

        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            lwarn!(
                "system",
                LogStage::Shutdown,
                LogComponent::Server,
                "force_close",
                "Grace period elapsed, force-closing remaining connections",
                remaining = self.tracker.len(),
                live_connections = self.limit.live_connections()
            );
            self.force_close.cancel();
            if tokio::time::timeout(FORCE_CLOSE_WAIT, self.tracker.wait()).await.is_err() {
                lwarn!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Server,
                    "force_close_incomplete",
                    "Some connections did not stop after force close",
                    remaining = self.tracker.len()
                );
            }
        }

        ldebug!(
            "system",
            LogStage::Shutdown,
            LogComponent::Server,
            "server_stopped",
            "Server stopped"
        );
        Ok(())
    }
}
