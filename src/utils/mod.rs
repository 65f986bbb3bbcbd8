//! # 通用工具
//!
//! 原子落盘和周期性保存任务，供用量、统计和密钥文件共用。

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror};

/// 以"写临时文件再重命名"的方式落盘 JSON，读者只会看到完整的旧文件或新文件
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            ProxyError::io(format!("创建目录失败: {}", parent.display()), e)
        })?;
    }

    let content = serde_json::to_vec_pretty(value)?;
    let tmp_path = temp_path_for(path);
    std::fs::write(&tmp_path, content)
        .map_err(|e| ProxyError::io(format!("写入临时文件失败: {}", tmp_path.display()), e))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| ProxyError::io(format!("替换文件失败: {}", path.display()), e))?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// 周期性执行保存动作，取消时再执行最后一次
///
/// `save` 返回 `Ok(true)` 表示确实写了文件。
pub fn spawn_periodic_save<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    save: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => run_save(name, &save).await,
            }
        }

        run_save(name, &save).await;
        ldebug!(
            "system",
            LogStage::Shutdown,
            LogComponent::Usage,
            "periodic_save_stopped",
            "Periodic save task stopped",
            task = name
        );
    })
}

async fn run_save<F, Fut>(name: &'static str, save: &F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    match save().await {
        Ok(true) => ldebug!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::Usage,
            "periodic_save",
            "State saved",
            task = name
        ),
        Ok(false) => {}
        Err(e) => lerror!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::Usage,
            "periodic_save_failed",
            "Failed to save state",
            task = name,
            error = %e
        ),
    }
}
