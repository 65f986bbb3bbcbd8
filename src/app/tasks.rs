use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{KeyConfigStore, KeyFileWatcher, ProxyConfig};
use crate::error::ProxyError;
use crate::logging::{LogComponent, LogStage};
use crate::statistics::ClientStatsTracker;
use crate::utils::spawn_periodic_save;
use crate::{linfo, lwarn};

/// 后台任务集合：密钥文件监听、用量落盘、客户端统计保存
///
/// 所有任务共用一个取消令牌，`stop` 时各自做最后一次保存后退出。
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    watcher: Option<KeyFileWatcher>,
}

impl BackgroundTasks {
    /// 按配置启动后台任务
    #[must_use]
    pub fn start(config: &ProxyConfig, key_store: &Arc<KeyConfigStore>, stats: &Arc<ClientStatsTracker>) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let watcher = if config.gateway.watch_key_file {
            match KeyFileWatcher::spawn(Arc::clone(key_store), cancel.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    // 惰性检查仍然会发现文件变化
                    lwarn!(
                        "system",
                        LogStage::Startup,
                        LogComponent::Watcher,
                        "key_watcher_unavailable",
                        "Key file watcher could not start, relying on periodic checks",
                        error = %e
                    );
                    None
                }
            }
        } else {
            None
        };

        let usage = Arc::clone(key_store.usage());
        handles.push(spawn_periodic_save(
            "usage_flush",
            config.gateway.usage_flush_interval(),
            cancel.clone(),
            move || {
                let usage = Arc::clone(&usage);
                async move {
                    tokio::task::spawn_blocking(move || usage.flush())
                        .await
                        .map_err(|e| ProxyError::internal_with_source("用量落盘任务异常退出", e))?
                }
            },
        ));

        if config.stats.enabled {
            let stats = Arc::clone(stats);
            handles.push(spawn_periodic_save(
                "stats_save",
                config.stats.auto_save_interval(),
                cancel.clone(),
                move || {
                    let stats = Arc::clone(&stats);
                    async move {
                        tokio::task::spawn_blocking(move || stats.save())
                            .await
                            .map_err(|e| ProxyError::internal_with_source("统计保存任务异常退出", e))?
                    }
                },
            ));
        }

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "background_tasks_started",
            "Background tasks started",
            watcher = watcher.is_some(),
            periodic_tasks = handles.len()
        );

        Self {
            cancel,
            handles,
            watcher,
        }
    }

    /// 停止所有任务并等待最后一次保存完成
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher {
            watcher.join().await;
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                lwarn!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Main,
                    "background_task_failed",
                    "Background task ended abnormally",
                    error = %e
                );
            }
        }
    }
}
