//! # 密钥文件监控模块
//!
//! 监听密钥文件所在目录，文件变化后触发 `KeyConfigStore` 重载。
//! 仪表盘通常以"写临时文件再重命名"的方式保存，所以按文件名过滤事件而不是只盯原 inode。

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::KeyConfigStore;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo, lwarn};

/// 连续事件的合并窗口
const DEBOUNCE: Duration = Duration::from_millis(100);

/// 密钥文件监控器
pub struct KeyFileWatcher {
    handle: JoinHandle<()>,
    _watcher: RecommendedWatcher,
}

impl KeyFileWatcher {
    /// 启动监控任务，`cancel` 触发后任务退出
    pub fn spawn(store: Arc<KeyConfigStore>, cancel: CancellationToken) -> Result<Self> {
        let key_path = store.path().to_path_buf();
        let watch_dir = watch_dir_for(&key_path);
        let (tx, rx) = mpsc::unbounded_channel::<()>();

        let file_name = key_path.file_name().map(std::ffi::OsStr::to_os_string);
        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|path| path.file_name().map(std::ffi::OsStr::to_os_string) == file_name);
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    );
                    if is_our_file && relevant {
                        let _ = tx.send(());
                    }
                }
                Err(e) => lwarn!(
                    "system",
                    LogStage::Reload,
                    LogComponent::Watcher,
                    "watch_error",
                    "File watcher reported an error",
                    error = %e
                ),
            }
        })
        .map_err(|e| ProxyError::config_with_source("创建文件监控器失败", e))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ProxyError::config_with_source(
                    format!("启动文件监控失败: {}", watch_dir.display()),
                    e,
                )
            })?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Watcher,
            "key_watcher_started",
            "Key file watcher started",
            path = %key_path.display()
        );

        let handle = tokio::spawn(run_watch_loop(store, rx, cancel));
        Ok(Self {
            handle,
            _watcher: watcher,
        })
    }

    /// 等待监控任务结束
    pub async fn join(self) {
        let Self { handle, _watcher } = self;
        let _ = handle.await;
    }
}

fn watch_dir_for(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

async fn run_watch_loop(
    store: Arc<KeyConfigStore>,
    mut rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => {
                if event.is_none() {
                    break;
                }
                // 等写入完成，并把这段时间里的事件合并成一次重载
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                let store = Arc::clone(&store);
                let result = tokio::task::spawn_blocking(move || store.reload_if_changed()).await;
                match result {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => ldebug!(
                        "system",
                        LogStage::Reload,
                        LogComponent::Watcher,
                        "key_file_unchanged",
                        "Key file event without content change"
                    ),
                    Ok(Err(e)) => lwarn!(
                        "system",
                        LogStage::Reload,
                        LogComponent::Watcher,
                        "key_reload_failed",
                        "Key file reload failed",
                        error = %e
                    ),
                    Err(e) => lwarn!(
                        "system",
                        LogStage::Reload,
                        LogComponent::Watcher,
                        "key_reload_panicked",
                        "Key reload task failed",
                        error = %e
                    ),
                }
            }
        }
    }

    ldebug!(
        "system",
        LogStage::Shutdown,
        LogComponent::Watcher,
        "key_watcher_stopped",
        "Key file watcher stopped"
    );
}
