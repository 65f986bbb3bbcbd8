use std::ops::Deref;
use std::sync::Arc;

use crate::config::TimeoutConfig;
use crate::gateway::GatewayRouter;
use crate::proxy::classifier::RequestClassifier;
use crate::statistics::ClientStatsTracker;

/// 连接处理用到的服务集合
#[derive(Debug, Clone)]
pub struct ProxyServices {
    /// 请求分类
    pub classifier: RequestClassifier,
    /// AI 网关
    pub gateway: Arc<GatewayRouter>,
    /// 客户端统计
    pub stats: Arc<ClientStatsTracker>,
}

/// 所有连接共享的只读状态
///
/// 克隆开销只有两次引用计数。
#[derive(Debug, Clone)]
pub struct ProxyState {
    timeouts: Arc<TimeoutConfig>,
    services: Arc<ProxyServices>,
}

impl ProxyState {
    /// 创建共享状态
    #[must_use]
    pub fn new(timeouts: TimeoutConfig, services: ProxyServices) -> Self {
        Self {
            timeouts: Arc::new(timeouts),
            services: Arc::new(services),
        }
    }

    /// 超时配置
    #[must_use]
    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }
}

impl Deref for ProxyState {
    type Target = ProxyServices;

    fn deref(&self) -> &Self::Target {
        &self.services
    }
}
