//! # 应用组装
//!
//! 按进程配置创建用量存储、密钥存储、客户端统计和服务器，并管理它们的生命周期。

mod tasks;

pub use tasks::BackgroundTasks;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{EnvOverrides, KeyConfigStore, ProxyConfig};
use crate::error::Result;
use crate::gateway::{GatewayRouter, GatewaySettings};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::proxy::{ConnectionLimit, GatewayUpstream, ProxyServer, ProxyServices, ProxyState, ReqwestUpstream, RequestClassifier};
use crate::statistics::ClientStatsTracker;
use crate::usage::UsageStore;

/// 组装好、尚未运行的网关
#[derive(Debug)]
pub struct GatewayApp {
    config: ProxyConfig,
    key_store: Arc<KeyConfigStore>,
    stats: Arc<ClientStatsTracker>,
    server: ProxyServer,
}

impl GatewayApp {
    /// 使用 reqwest 上游组装
    pub async fn build(config: ProxyConfig, overrides: EnvOverrides) -> Result<Self> {
        let upstream = ReqwestUpstream::new(config.timeouts.connect(), config.gateway.request_timeout())?;
        Self::build_with_upstream(config, overrides, Arc::new(upstream)).await
    }

    /// 使用指定的上游实现组装
    pub async fn build_with_upstream(
        config: ProxyConfig,
        overrides: EnvOverrides,
        upstream: Arc<dyn GatewayUpstream>,
    ) -> Result<Self> {
        let usage = Arc::new(UsageStore::open(
            &config.gateway.usage_file,
            config.gateway.usage_retention_days,
        )?);
        let key_store = Arc::new(KeyConfigStore::open(
            &config.gateway.key_file,
            usage,
            config.gateway.reload_check_interval(),
            overrides,
        ));
        let stats = Arc::new(if config.stats.enabled {
            ClientStatsTracker::open(&config.stats.file)?
        } else {
            ClientStatsTracker::in_memory()
        });

        let gateway = GatewayRouter::new(
            Arc::clone(&key_store),
            upstream,
            GatewaySettings::from(&config.gateway),
        );
        let state = ProxyState::new(
            config.timeouts.clone(),
            ProxyServices {
                classifier: RequestClassifier::new(config.gateway.api_prefix.clone()),
                gateway: Arc::new(gateway),
                stats: Arc::clone(&stats),
            },
        );
        let server = ProxyServer::bind(config.server.socket_addr()?, state, config.server.max_connections).await?;

        Ok(Self {
            config,
            key_store,
            stats,
            server,
        })
    }

    /// 实际监听地址
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// 密钥存储
    #[must_use]
    pub fn key_store(&self) -> Arc<KeyConfigStore> {
        Arc::clone(&self.key_store)
    }

    /// 客户端统计
    #[must_use]
    pub fn stats(&self) -> Arc<ClientStatsTracker> {
        Arc::clone(&self.stats)
    }

    /// 连接名额，用于查询在途连接数
    #[must_use]
    pub fn connections(&self) -> ConnectionLimit {
        self.server.connection_limit()
    }

    /// 运行直到 `shutdown` 触发，随后停止后台任务并做最后一次保存
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            key_store,
            stats,
            server,
        } = self;

        let tasks = BackgroundTasks::start(&config, &key_store, &stats);
        let result = server.run(shutdown).await;
        tasks.stop().await;

        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Main,
            "gateway_stopped",
            "Gateway stopped",
            clients = stats.snapshot().total_ips,
            usage_records = key_store.usage().len()
        );
        result
    }
}
